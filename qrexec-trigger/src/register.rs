// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The "register" subroutine (spec §4.4): turns a client's
//! `create_process_response` into either an exit-code report or a
//! hand-off to the dispatcher. Handle closing is not spelled out here —
//! an `H` that goes out of scope without being moved into the returned
//! [`ClientInfo`] is closed by its own `Drop` impl, the same way recycle
//! closes everything the endpoint still owns.

use qrexec_trigger_ipc::{CreateProcessResponse, HandleError, TriggerPlatform};

use crate::dispatcher::{ClientInfo, Dispatcher, ExitCodeResponse};

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("client reported create_process_response = NONE, a protocol violation")]
    NoProcess,
    #[error("failed to duplicate the client's process handle: {0}")]
    Duplicate(#[from] HandleError),
    #[error("dispatcher refused client {client_id}: {source}")]
    Refused {
        client_id: u32,
        #[source]
        source: crate::dispatcher::DispatcherError,
    },
}

/// The local ends of the three stdio pipes a [`register`] call has not yet
/// attached a process handle to; built in state S4 and threaded through to
/// S5 (spec §3's `client_info` field, minus the process handle which only
/// becomes available once the client answers with its `HANDLE` variant).
pub struct PendingClientInfo<H> {
    pub write_stdin: H,
    pub stdout_read: H,
    pub stderr_read: H,
}

/// Implements spec §4.4 in full: on `ERROR_CODE`, reports the failure to
/// the dispatcher as an exit code and returns (the caller's stdio handles
/// are dropped by the caller, not here, since this function never took
/// ownership of `locals` in that branch — see call site). On `HANDLE`,
/// duplicates the client's process handle into this process and hands the
/// completed [`ClientInfo`] to the dispatcher.
pub fn register<P, D>(
    platform: &P,
    dispatcher: &D,
    client_process: &P::RemoteProcess,
    assigned_client_id: u32,
    response: CreateProcessResponse,
    locals: PendingClientInfo<P::LocalHandle>,
) -> Result<(), RegisterError>
where
    P: TriggerPlatform,
    D: Dispatcher<Handle = P::LocalHandle> + ?Sized,
{
    match response {
        CreateProcessResponse::None => Err(RegisterError::NoProcess),
        CreateProcessResponse::ErrorCode(code) => {
            dispatcher.send_exit_code(
                assigned_client_id,
                ExitCodeResponse {
                    windows_error_code: code,
                },
            );
            Ok(())
        }
        CreateProcessResponse::Handle(remote_handle) => {
            let process = platform.duplicate_from_remote(client_process, remote_handle)?;
            let client_info = ClientInfo {
                write_stdin: locals.write_stdin,
                stdout_read: locals.stdout_read,
                stderr_read: locals.stderr_read,
                process,
            };
            dispatcher
                .add_existing_client(assigned_client_id, client_info)
                .map_err(|source| RegisterError::Refused {
                    client_id: assigned_client_id,
                    source,
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use qrexec_trigger_ipc::platform::testing::MemPlatform;

    use super::*;
    use crate::dispatcher::testing::RecordingDispatcher;

    #[tokio::test]
    async fn error_code_reports_exit_code_without_registering() {
        let platform = MemPlatform::new();
        let dispatcher = RecordingDispatcher::default();
        let remote = platform.open_remote_process(1234).unwrap();
        let pipes = platform.create_client_pipes().unwrap();

        let outcome = register(
            &platform,
            &dispatcher,
            &remote,
            42,
            CreateProcessResponse::ErrorCode(5),
            PendingClientInfo {
                write_stdin: pipes.stdin_write,
                stdout_read: pipes.stdout_read,
                stderr_read: pipes.stderr_read,
            },
        );

        assert!(outcome.is_ok());
        assert!(dispatcher.registrations().is_empty());
        let codes = dispatcher.exit_codes();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].client_id, 42);
        assert_eq!(codes[0].response.windows_error_code, 5);
    }

    #[tokio::test]
    async fn handle_registers_the_client_exactly_once() {
        let platform = MemPlatform::new();
        let dispatcher = RecordingDispatcher::default();
        let remote = platform.open_remote_process(4321).unwrap();
        let pipes = platform.create_client_pipes().unwrap();

        let outcome = register(
            &platform,
            &dispatcher,
            &remote,
            7,
            CreateProcessResponse::Handle(0xdead_beef),
            PendingClientInfo {
                write_stdin: pipes.stdin_write,
                stdout_read: pipes.stdout_read,
                stderr_read: pipes.stderr_read,
            },
        );

        assert!(outcome.is_ok());
        let registrations = dispatcher.registrations();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].client_id, 7);
    }

    #[tokio::test]
    async fn none_variant_is_a_protocol_violation() {
        let platform = MemPlatform::new();
        let dispatcher = RecordingDispatcher::default();
        let remote = platform.open_remote_process(1).unwrap();
        let pipes = platform.create_client_pipes().unwrap();

        let outcome = register(
            &platform,
            &dispatcher,
            &remote,
            1,
            CreateProcessResponse::None,
            PendingClientInfo {
                write_stdin: pipes.stdin_write,
                stdout_read: pipes.stdout_read,
                stderr_read: pipes.stderr_read,
            },
        );

        assert!(matches!(outcome, Err(RegisterError::NoProcess)));
        assert!(dispatcher.registrations().is_empty());
    }

    #[tokio::test]
    async fn dispatcher_refusal_surfaces_as_an_error() {
        let platform = MemPlatform::new();
        let dispatcher = RecordingDispatcher::default();
        dispatcher.refuse_next_registration();
        let remote = platform.open_remote_process(99).unwrap();
        let pipes = platform.create_client_pipes().unwrap();

        let outcome = register(
            &platform,
            &dispatcher,
            &remote,
            9,
            CreateProcessResponse::Handle(1),
            PendingClientInfo {
                write_stdin: pipes.stdin_write,
                stdout_read: pipes.stdout_read,
                stderr_read: pipes.stderr_read,
            },
        );

        assert!(matches!(outcome, Err(RegisterError::Refused { client_id: 9, .. })));
    }
}
