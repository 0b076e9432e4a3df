// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Platform binding seam (spec §4.6/§4.7): everything the endpoint state
//! machine needs from the operating system, expressed as traits so the
//! driver loop in `qrexec-trigger` is written once and exercised both
//! against real Windows named pipes and an in-memory double in tests.
//!
//! Mirrors the `#[cfg(unix)] / #[cfg(windows)]` module split `libdd-ipc`
//! uses for its own platform layer, with one difference: the in-memory
//! binding here (`testing`) is not unix-specific, it is a pure-Rust double
//! available on every target so the core state machine can be exercised in
//! CI without a Windows host.

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::{PipeSecurityError, WindowsPlatform};

pub mod testing;

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::handles::{HandleError, RemoteHandle, StdioPipes};

/// Static sizing and naming for the pipe instances the pool creates.
/// Mirrors `TRIGGER_PIPE_NAME`, the instance count, and the buffer/timeout
/// knobs from spec §4.1, made overridable by `TriggerServerConfig`.
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub name: String,
    pub out_buffer_size: u32,
    pub in_buffer_size: u32,
    pub client_timeout_ms: u32,
}

/// One message-framed, duplex, overlapped IPC instance (spec §3's `pipe`
/// field), abstracted over the concrete transport.
///
/// Implementors must behave like a Windows named pipe in message mode: a
/// `read`/`write` call observes exactly one message, and a short read/write
/// is a protocol violation rather than something to retry and reassemble.
/// [`PipeConnection::connect`] and [`PipeConnection::disconnect`] map
/// directly onto `ConnectNamedPipe`/`DisconnectNamedPipe`.
pub trait PipeConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Waits for a client to connect to this pipe instance. Resolves
    /// immediately if a client raced in before the call (spec §4.3's
    /// `PIPE_CONNECTED` tie-break collapses into this not suspending).
    fn connect(&mut self) -> impl std::future::Future<Output = io::Result<()>> + Send;

    /// The process id of the currently connected peer. Only meaningful
    /// between a successful `connect` and the following `disconnect`.
    fn client_process_id(&self) -> io::Result<u32>;

    /// Tears down the current connection and rearms the instance for a
    /// fresh `connect` (`DisconnectNamedPipe`).
    fn disconnect(&mut self) -> io::Result<()>;
}

/// Everything the endpoint pool needs from the host OS: constructing pipe
/// instances, duplicating handles across the client/server boundary, and
/// minting a fresh stdio channel set. One value is shared (via `Arc`) across
/// every endpoint task.
pub trait TriggerPlatform: Send + Sync + 'static {
    type Pipe: PipeConnection;
    /// A handle owned by this process, not yet duplicated anywhere.
    type LocalHandle: Send + 'static;
    /// An open reference to a peer process, suitable for duplicating
    /// handles into or out of.
    type RemoteProcess: Send + Sync + 'static;

    /// Creates one named-pipe instance bound to `config.name`, with the
    /// security descriptor described in spec §4.1 (everyone:
    /// read|write|create-instance|synchronize, nothing else).
    fn bind_instance(&self, config: &PipeConfig) -> io::Result<Self::Pipe>;

    /// Opens `pid` with the access needed to later duplicate handles into
    /// or out of it (`OpenProcess(PROCESS_DUP_HANDLE, ...)`).
    fn open_remote_process(&self, pid: u32) -> Result<Self::RemoteProcess, HandleError>;

    /// Duplicates `local` into `remote`'s address space with close-source
    /// semantics: the local reference is consumed, a new one appears
    /// remotely. Returns the handle value as it will appear there.
    fn duplicate_to_remote(
        &self,
        remote: &Self::RemoteProcess,
        local: Self::LocalHandle,
    ) -> Result<RemoteHandle, HandleError>;

    /// Duplicates a handle living inside `remote`'s address space
    /// (addressed by its remote-valued handle number) into this process.
    fn duplicate_from_remote(
        &self,
        remote: &Self::RemoteProcess,
        remote_handle: u64,
    ) -> Result<Self::LocalHandle, HandleError>;

    /// Creates a fresh local stdin/stdout/stderr pipe triple for one client
    /// (`CreateClientPipes`), split into the server-retained and
    /// client-bound halves.
    fn create_client_pipes(&self) -> Result<StdioPipes<Self::LocalHandle>, HandleError>;
}
