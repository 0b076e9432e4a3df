// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory stand-in for the Windows named-pipe binding, used by
//! `qrexec-trigger`'s own tests and exported (unconditionally, like
//! `libdd-ipc`'s `example_interface`) so downstream crates can drive the
//! driver loop without a Windows target.
//!
//! [`MemPlatform`] models one named pipe with `instances` interchangeable
//! slots: connecting a fake client hands the connection to whichever
//! `MemPipe::connect` call happens to be waiting, mirroring how the OS
//! routes a `CreateFile` against a named pipe to an idle instance.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use super::{PipeConfig, PipeConnection, TriggerPlatform};
use crate::handles::{HandleError, RemoteHandle, StdioPipes};

const CHANNEL_BUF: usize = 4096;

/// An opaque, process-local handle value. Duplication is modeled as moving
/// the same token between two [`MemRemoteProcess`] bookkeeping sets rather
/// than ever touching a real OS object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemHandle(pub u64);

struct PendingConnection {
    stream: DuplexStream,
    pid: u32,
}

/// Shared registry backing every `MemPipe` instance bound to one name, plus
/// the bookkeeping a test needs to assert on (handles opened/duplicated,
/// dangling at the end of a scenario).
struct Registry {
    accept_tx: mpsc::Sender<PendingConnection>,
    accept_rx: AsyncMutex<mpsc::Receiver<PendingConnection>>,
    next_handle: AtomicU64,
    open_handles: Mutex<HashMap<u64, &'static str>>,
}

/// Test double for [`TriggerPlatform`]. Cheap to clone (an `Arc` inside);
/// share one instance between the pool under test and the harness driving
/// fake clients.
#[derive(Clone)]
pub struct MemPlatform {
    registry: Arc<Registry>,
}

impl Default for MemPlatform {
    fn default() -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(CHANNEL_BUF);
        MemPlatform {
            registry: Arc::new(Registry {
                accept_tx,
                accept_rx: AsyncMutex::new(accept_rx),
                next_handle: AtomicU64::new(1),
                open_handles: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl MemPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a fake client with the given peer pid, handing the server
    /// half of a duplex stream to whichever `MemPipe` is next to call
    /// `connect`. Returns the client half for the test to read/write.
    pub async fn connect_client(&self, pid: u32) -> DuplexStream {
        let (client, server) = tokio::io::duplex(CHANNEL_BUF);
        self.registry
            .accept_tx
            .send(PendingConnection { stream: server, pid })
            .await
            .expect("registry accept channel closed");
        client
    }

    /// Number of handles minted by `create_client_pipes` or process-opens
    /// that have not yet been closed or duplicated away. Used to assert the
    /// "handle non-leak" property (spec §8.4) after a scenario runs.
    pub fn open_handle_count(&self) -> usize {
        self.registry.open_handles.lock().unwrap().len()
    }

    fn alloc_handle(&self, kind: &'static str) -> MemHandle {
        let id = self.registry.next_handle.fetch_add(1, Ordering::SeqCst);
        self.registry.open_handles.lock().unwrap().insert(id, kind);
        MemHandle(id)
    }

    fn close_handle(&self, handle: MemHandle) {
        self.registry.open_handles.lock().unwrap().remove(&handle.0);
    }
}

/// One pipe "instance". Each endpoint task owns exactly one; `connect`
/// consumes the next queued [`PendingConnection`] and `disconnect` drops it,
/// making the instance available for reuse on the next `connect`.
pub struct MemPipe {
    platform: MemPlatform,
    current: Option<DuplexStream>,
    current_pid: Option<u32>,
}

impl PipeConnection for MemPipe {
    async fn connect(&mut self) -> io::Result<()> {
        // Every idle instance contends on the same queue; whichever one is
        // polling when a fake client connects wins, mirroring the OS
        // routing a `CreateFile` to an arbitrary idle pipe instance.
        let pending = self
            .platform
            .registry
            .accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::BrokenPipe, "no more fake clients queued")
            })?;
        self.current = Some(pending.stream);
        self.current_pid = Some(pending.pid);
        Ok(())
    }

    fn client_process_id(&self) -> io::Result<u32> {
        self.current_pid
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no client connected"))
    }

    fn disconnect(&mut self) -> io::Result<()> {
        self.current = None;
        self.current_pid = None;
        Ok(())
    }
}

impl AsyncRead for MemPipe {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.current {
            Some(stream) => Pin::new(stream).poll_read(cx, buf),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no client connected",
            ))),
        }
    }
}

impl AsyncWrite for MemPipe {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.current {
            Some(stream) => Pin::new(stream).poll_write(cx, buf),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no client connected",
            ))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.current {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.current {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Stand-in for an opened client process: just the pid plus a reservation
/// in the registry's duplicate-tracking table.
pub struct MemRemoteProcess {
    pid: u32,
}

impl TriggerPlatform for MemPlatform {
    type Pipe = MemPipe;
    type LocalHandle = MemHandleGuard;
    type RemoteProcess = MemRemoteProcess;

    fn bind_instance(&self, _config: &PipeConfig) -> io::Result<Self::Pipe> {
        Ok(MemPipe {
            platform: self.clone(),
            current: None,
            current_pid: None,
        })
    }

    fn open_remote_process(&self, pid: u32) -> Result<Self::RemoteProcess, HandleError> {
        Ok(MemRemoteProcess { pid })
    }

    fn duplicate_to_remote(
        &self,
        _remote: &Self::RemoteProcess,
        local: Self::LocalHandle,
    ) -> Result<RemoteHandle, HandleError> {
        let value = local.handle.0;
        local.close();
        Ok(RemoteHandle(value))
    }

    fn duplicate_from_remote(
        &self,
        _remote: &Self::RemoteProcess,
        remote_handle: u64,
    ) -> Result<Self::LocalHandle, HandleError> {
        Ok(MemHandleGuard {
            platform: self.clone(),
            handle: MemHandle(remote_handle),
            closed: false,
        })
    }

    fn create_client_pipes(&self) -> Result<StdioPipes<Self::LocalHandle>, HandleError> {
        let mk = |kind| MemHandleGuard {
            platform: self.clone(),
            handle: self.alloc_handle(kind),
            closed: false,
        };
        Ok(StdioPipes {
            stdin_write: mk("stdin_write"),
            stdout_read: mk("stdout_read"),
            stderr_read: mk("stderr_read"),
            stdin_read: mk("stdin_read"),
            stdout_write: mk("stdout_write"),
            stderr_write: mk("stderr_write"),
        })
    }
}

/// A [`MemHandle`] that removes itself from the registry's open-handle
/// table when dropped without being explicitly consumed by
/// `duplicate_to_remote`, modeling "recycle closes whatever it still owns".
pub struct MemHandleGuard {
    platform: MemPlatform,
    handle: MemHandle,
    closed: bool,
}

impl MemHandleGuard {
    fn close(mut self) {
        self.platform.close_handle(self.handle);
        self.closed = true;
    }
}

impl Drop for MemHandleGuard {
    fn drop(&mut self) {
        if !self.closed {
            self.platform.close_handle(self.handle);
        }
    }
}
