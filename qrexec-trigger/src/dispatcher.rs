// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The dispatcher seam (spec §4.7, §6): the subsystem that owns a client
//! once the handshake completes. Out of scope per spec §1 — this module
//! only defines the boundary (`AddExistingClient`, `send_exit_code`,
//! `CloseReadPipeHandles`) and test doubles that record calls for the
//! at-most-once hand-off property (spec §8.3).
//!
//! `CreateClientPipes` (the stdio channel factory) is deliberately *not*
//! part of this trait even though spec §6 lists it alongside the
//! dispatcher calls textually: spec §1 names it as a distinct out-of-scope
//! collaborator from the dispatcher itself ("the file-copy agent... the
//! `CreateClientPipes` / stdin/stdout/stderr channel factory... the
//! dispatcher that owns clients after registration"), and it behaves like
//! an OS-facing factory, not a client registry. It lives on
//! [`qrexec_trigger_ipc::TriggerPlatform`] instead; see DESIGN.md.

/// Outcome the driver reports when the daemon told it process creation
/// failed (spec §4.4's `ERROR_CODE` branch); mirrors
/// `MAKE_ERROR_RESPONSE(ERROR_SET_WINDOWS, code)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodeResponse {
    pub windows_error_code: u32,
}

/// The local ends of a registered client's stdio pipes plus its process
/// handle, handed to the dispatcher on success (spec §3's `client_info`).
pub struct ClientInfo<H> {
    pub write_stdin: H,
    pub stdout_read: H,
    pub stderr_read: H,
    pub process: H,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("dispatcher refused to register client {client_id}: {reason}")]
    Refused { client_id: u32, reason: String },
}

/// The registration/ownership seam described in spec §4.7. `Handle` is
/// [`qrexec_trigger_ipc::TriggerPlatform::LocalHandle`]; binding it as an
/// associated type (rather than a free generic parameter) lets a driver
/// generic over one `Platform` pick a `dyn Dispatcher<Handle = Platform::LocalHandle>`
/// trait object, so the concrete dispatcher can be swapped at runtime
/// without re-monomorphizing the whole pool.
pub trait Dispatcher: Send + Sync + 'static {
    type Handle: Send + 'static;

    /// Hands a successfully-registered client over to the dispatcher. On
    /// `Ok`, the dispatcher now owns every handle inside `client_info` —
    /// the caller must not close them. On `Err`, the caller still owns
    /// them and is responsible for closing them (recycle does this).
    fn add_existing_client(
        &self,
        client_id: u32,
        client_info: ClientInfo<Self::Handle>,
    ) -> Result<(), DispatcherError>;

    /// Reports a process-creation failure reported by the daemon's client
    /// (spec §4.4); the client was never registered.
    fn send_exit_code(&self, client_id: u32, response: ExitCodeResponse);

    /// Closes the read ends of a client's stdout/stderr pipes once the
    /// dispatcher's own watcher has drained them. Not called by the core
    /// directly (the core only ever transfers ownership forward via
    /// `add_existing_client`); present for interface completeness with
    /// spec §6 and available to a future dispatcher implementation.
    fn close_read_pipe_handles(&self, client_id: i64, handle: Self::Handle);
}

/// Logs registrations instead of handing them to a real dispatcher. Useful
/// for a binary built without the dispatcher subsystem wired in; every
/// handle passed to it is simply dropped (closed) after being logged.
/// Generic over the platform's handle type so it can back any
/// `TriggerPlatform` without pulling in a concrete binding here.
pub struct LoggingDispatcher<H>(std::marker::PhantomData<fn(H)>);

impl<H> Default for LoggingDispatcher<H> {
    fn default() -> Self {
        LoggingDispatcher(std::marker::PhantomData)
    }
}

impl<H: Send + 'static> Dispatcher for LoggingDispatcher<H> {
    type Handle = H;

    fn add_existing_client(
        &self,
        client_id: u32,
        _client_info: ClientInfo<Self::Handle>,
    ) -> Result<(), DispatcherError> {
        tracing::warn!(client_id, "no dispatcher wired up; dropping registered client");
        Ok(())
    }

    fn send_exit_code(&self, client_id: u32, response: ExitCodeResponse) {
        tracing::warn!(client_id, code = response.windows_error_code, "no dispatcher wired up; dropping exit code");
    }

    fn close_read_pipe_handles(&self, _client_id: i64, _handle: Self::Handle) {}
}

pub mod testing {
    use std::sync::Mutex;

    use super::{ClientInfo, Dispatcher, DispatcherError, ExitCodeResponse};

    #[derive(Debug, Clone)]
    pub struct RecordedRegistration {
        pub client_id: u32,
    }

    #[derive(Debug, Clone)]
    pub struct RecordedExitCode {
        pub client_id: u32,
        pub response: ExitCodeResponse,
    }

    /// Records every `add_existing_client` / `send_exit_code` call,
    /// verifying the "at most once per client" property from spec §8.3.
    /// `H` is the test platform's handle type (`MemHandleGuard`); the
    /// handles themselves are dropped (closed) immediately after being
    /// recorded, modeling the dispatcher taking ownership.
    pub struct RecordingDispatcher<H> {
        registrations: Mutex<Vec<RecordedRegistration>>,
        exit_codes: Mutex<Vec<RecordedExitCode>>,
        refuse_next: Mutex<bool>,
        _marker: std::marker::PhantomData<fn(H)>,
    }

    impl<H> Default for RecordingDispatcher<H> {
        fn default() -> Self {
            RecordingDispatcher {
                registrations: Mutex::new(Vec::new()),
                exit_codes: Mutex::new(Vec::new()),
                refuse_next: Mutex::new(false),
                _marker: std::marker::PhantomData,
            }
        }
    }

    impl<H> RecordingDispatcher<H> {
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next `add_existing_client` call fail, to exercise the
        /// "dispatcher refusal" recycle path (spec §7).
        pub fn refuse_next_registration(&self) {
            *self.refuse_next.lock().unwrap() = true;
        }

        pub fn registrations(&self) -> Vec<RecordedRegistration> {
            self.registrations.lock().unwrap().clone()
        }

        pub fn exit_codes(&self) -> Vec<RecordedExitCode> {
            self.exit_codes.lock().unwrap().clone()
        }
    }

    impl<H: Send + 'static> Dispatcher for RecordingDispatcher<H> {
        type Handle = H;

        fn add_existing_client(
            &self,
            client_id: u32,
            _client_info: ClientInfo<Self::Handle>,
        ) -> Result<(), DispatcherError> {
            let mut refuse = self.refuse_next.lock().unwrap();
            if *refuse {
                *refuse = false;
                return Err(DispatcherError::Refused {
                    client_id,
                    reason: "test double told to refuse".into(),
                });
            }
            self.registrations
                .lock()
                .unwrap()
                .push(RecordedRegistration { client_id });
            Ok(())
        }

        fn send_exit_code(&self, client_id: u32, response: ExitCodeResponse) {
            self.exit_codes
                .lock()
                .unwrap()
                .push(RecordedExitCode { client_id, response });
        }

        fn close_read_pipe_handles(&self, _client_id: i64, _handle: Self::Handle) {}
    }
}
