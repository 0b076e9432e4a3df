// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The per-endpoint state machine (spec §4.3): one independently-scheduled
//! async task per pool slot, looping S0→S1→S3→S4→S5→recycle forever. Spec
//! §5 realizes "the driver" this way in Rust — one task per endpoint
//! rather than one thread multiplexing all of them via `WaitForMultipleObjects`
//! — so that the entire lifetime of one endpoint is still owned by exactly
//! one logical driver, never two tasks at once.
//!
//! Every early `continue 'endpoint` below is a recycle: spec §4.5 requires
//! no endpoint is ever stranded outside the S0..S5 cycle, so every error
//! path in this loop feeds back into issuing a fresh accept. Handles that
//! go out of scope along the way (`pipe`, `client_process`, any stdio
//! locals not yet handed to the dispatcher) are closed by their own `Drop`
//! impls, which is what spec §4.5's "closes transient handles" becomes
//! once handle lifetime is expressed as Rust ownership.

use std::sync::Arc;

use qrexec_trigger_ipc::{
    CreateProcessResponse, IoHandles, PipeConfig, PipeConnection, ProcessFds, TriggerConnectParams,
    TriggerPlatform,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::daemon::DaemonSink;
use crate::dispatcher::Dispatcher;
use crate::pool::EndpointPool;
use crate::register::{register, PendingClientInfo};

/// Observable slice of spec §3's `state` field, named after the states in
/// spec §4.3. There is no `S2`: the original numbering jumps from S1
/// straight to S3, and this mirrors that gap rather than renumbering it
/// away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    WaitingForClient,
    ReceivingParameters,
    WaitingForDaemonDecision,
    SendingIoHandles,
    ReceivingProcessHandle,
}

/// Drives one pool slot through its state machine forever, until `shutdown`
/// is notified. Constructed by [`crate::pool::EndpointPool`]'s owner (the
/// binary's startup code, or a test harness), one per slot index.
pub struct Endpoint<P: TriggerPlatform, D: Dispatcher<Handle = P::LocalHandle>> {
    index: usize,
    platform: Arc<P>,
    pool: Arc<EndpointPool>,
    daemon: Arc<dyn DaemonSink>,
    dispatcher: Arc<D>,
    pipe_config: PipeConfig,
    shutdown: CancellationToken,
    state_tx: watch::Sender<EndpointState>,
}

impl<P: TriggerPlatform, D: Dispatcher<Handle = P::LocalHandle>> Endpoint<P, D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        platform: Arc<P>,
        pool: Arc<EndpointPool>,
        daemon: Arc<dyn DaemonSink>,
        dispatcher: Arc<D>,
        pipe_config: PipeConfig,
        shutdown: CancellationToken,
    ) -> (Self, watch::Receiver<EndpointState>) {
        let (state_tx, state_rx) = watch::channel(EndpointState::WaitingForClient);
        (
            Endpoint {
                index,
                platform,
                pool,
                daemon,
                dispatcher,
                pipe_config,
                shutdown,
                state_tx,
            },
            state_rx,
        )
    }

    fn set_state(&self, state: EndpointState) {
        tracing::debug!(index = self.index, ?state, "endpoint state transition");
        let _ = self.state_tx.send(state);
    }

    /// Runs the S0→S5→recycle loop until shutdown. Never returns an error:
    /// spec §7 requires no per-endpoint failure ever reaches the driver
    /// loop, so every failure path here recycles instead of propagating.
    pub async fn run(mut self) {
        'endpoint: loop {
            self.set_state(EndpointState::WaitingForClient);

            let mut pipe = match self.platform.bind_instance(&self.pipe_config) {
                Ok(pipe) => pipe,
                Err(error) => {
                    tracing::error!(index = self.index, %error, "failed to bind pipe instance");
                    return;
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                result = pipe.connect() => {
                    if let Err(error) = result {
                        tracing::debug!(index = self.index, %error, "accept failed");
                        continue 'endpoint;
                    }
                }
            }

            let pid = match pipe.client_process_id() {
                Ok(pid) => pid,
                Err(error) => {
                    tracing::warn!(index = self.index, %error, "could not read client pid");
                    let _ = pipe.disconnect();
                    continue 'endpoint;
                }
            };
            let client_process = match self.platform.open_remote_process(pid) {
                Ok(process) => process,
                Err(error) => {
                    tracing::warn!(index = self.index, pid, %error, "could not open client process");
                    let _ = pipe.disconnect();
                    continue 'endpoint;
                }
            };

            self.set_state(EndpointState::ReceivingParameters);
            let mut params_buf = vec![0u8; TriggerConnectParams::WIRE_SIZE];
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                result = pipe.read_exact(&mut params_buf) => {
                    if result.is_err() {
                        tracing::debug!(index = self.index, "short read of trigger_connect_params");
                        let _ = pipe.disconnect();
                        continue 'endpoint;
                    }
                }
            }
            let mut params = match TriggerConnectParams::decode(&params_buf) {
                Ok(params) => params,
                Err(error) => {
                    tracing::debug!(index = self.index, %error, "malformed trigger_connect_params");
                    let _ = pipe.disconnect();
                    continue 'endpoint;
                }
            };

            let (ident, verdict_rx) = self.pool.begin_waiting_for_verdict(self.index);
            params.process_fds = ProcessFds::with_ident(&ident);

            // The state transition precedes the forward to the daemon:
            // spec §4.3 requires this ordering since the verdict may arrive
            // before `send_trigger_connect_existing` returns.
            self.set_state(EndpointState::WaitingForDaemonDecision);

            let daemon = self.daemon.clone();
            let forward_params = params.clone();
            let forwarded = tokio::task::spawn_blocking(move || {
                daemon.send_trigger_connect_existing(&forward_params)
            })
            .await;
            match forwarded {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::warn!(index = self.index, ident, %error, "daemon rejected forward");
                    self.pool.clear_slot(self.index);
                    let _ = pipe.disconnect();
                    continue 'endpoint;
                }
                Err(join_error) => {
                    tracing::error!(index = self.index, ident, %join_error, "daemon forward task panicked");
                    self.pool.clear_slot(self.index);
                    let _ = pipe.disconnect();
                    continue 'endpoint;
                }
            }

            let client_id = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                result = verdict_rx => match result {
                    Ok(id) => id,
                    Err(_) => {
                        // Daemon never called ProceedWithExecution for this
                        // ident (spec scenario S-3); the client eventually
                        // disconnects and this recycles as a transient I/O
                        // error on the next operation.
                        tracing::debug!(index = self.index, ident, "verdict channel dropped without a verdict");
                        self.pool.clear_slot(self.index);
                        let _ = pipe.disconnect();
                        continue 'endpoint;
                    }
                },
            };

            self.set_state(EndpointState::SendingIoHandles);
            let stdio = match self.platform.create_client_pipes() {
                Ok(stdio) => stdio,
                Err(error) => {
                    tracing::warn!(index = self.index, %error, "failed to create client stdio pipes");
                    let _ = pipe.disconnect();
                    continue 'endpoint;
                }
            };

            let remote_stdin = match self.platform.duplicate_to_remote(&client_process, stdio.stdin_read) {
                Ok(handle) => handle,
                Err(error) => {
                    tracing::warn!(index = self.index, %error, "failed to duplicate stdin handle");
                    let _ = pipe.disconnect();
                    continue 'endpoint;
                }
            };
            let remote_stdout = match self.platform.duplicate_to_remote(&client_process, stdio.stdout_write) {
                Ok(handle) => handle,
                Err(error) => {
                    tracing::warn!(index = self.index, %error, "failed to duplicate stdout handle");
                    let _ = pipe.disconnect();
                    continue 'endpoint;
                }
            };
            let remote_stderr = match self.platform.duplicate_to_remote(&client_process, stdio.stderr_write) {
                Ok(handle) => handle,
                Err(error) => {
                    tracing::warn!(index = self.index, %error, "failed to duplicate stderr handle");
                    let _ = pipe.disconnect();
                    continue 'endpoint;
                }
            };

            let io_handles = IoHandles {
                stdin: remote_stdin.0,
                stdout: remote_stdout.0,
                stderr: remote_stderr.0,
            };
            if pipe.write_all(&io_handles.encode()).await.is_err() {
                tracing::debug!(index = self.index, "failed to write io handle triple");
                let _ = pipe.disconnect();
                continue 'endpoint;
            }

            self.set_state(EndpointState::ReceivingProcessHandle);
            let mut response_buf = [0u8; CreateProcessResponse::WIRE_SIZE];
            if pipe.read_exact(&mut response_buf).await.is_err() {
                tracing::debug!(index = self.index, "failed to read create_process_response");
                let _ = pipe.disconnect();
                continue 'endpoint;
            }
            let response = match CreateProcessResponse::decode(&response_buf) {
                Ok(response) => response,
                Err(error) => {
                    tracing::debug!(index = self.index, %error, "malformed create_process_response");
                    let _ = pipe.disconnect();
                    continue 'endpoint;
                }
            };

            let locals = PendingClientInfo {
                write_stdin: stdio.stdin_write,
                stdout_read: stdio.stdout_read,
                stderr_read: stdio.stderr_read,
            };
            if let Err(error) = register(
                &*self.platform,
                &*self.dispatcher,
                &client_process,
                client_id,
                response,
                locals,
            ) {
                tracing::warn!(index = self.index, client_id, %error, "register failed");
            }

            // Recycle (spec §4.5): `client_process` and any stdio handles
            // register() didn't hand off are dropped (closed) as this scope
            // ends; the pool entry is cleared defensively even though the
            // verdict path already clears it on the success route.
            self.pool.clear_slot(self.index);
            let _ = pipe.disconnect();
        }
    }
}
