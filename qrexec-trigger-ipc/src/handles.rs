// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ownership-transfer abstraction over OS handles that cross a process
//! boundary via duplication rather than by value.
//!
//! Modeled on `datadog-ipc`'s handle-transport split: a [`RemoteHandle`] is a
//! handle value that is only meaningful inside some *other* process's address
//! space. The concrete notion of "a handle owned by this process" is left to
//! [`crate::platform::TriggerPlatform::LocalHandle`], since its representation
//! (a Windows `OwnedHandle`, or an opaque token in tests) differs per binding.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("failed to open process {pid} for handle duplication: {source}")]
    OpenProcess {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to duplicate handle into remote process: {0}")]
    Duplicate(#[source] std::io::Error),
    #[error("failed to duplicate handle out of remote process: {0}")]
    DuplicateIn(#[source] std::io::Error),
    #[error("failed to create client stdio pipes: {0}")]
    CreatePipes(#[source] std::io::Error),
}

/// A handle value that is only valid in the address space of the peer
/// process a given pipe endpoint is talking to. Never dereference this
/// locally; it exists purely to be written onto the wire (see
/// `qrexec_trigger_ipc::protocol::IoHandles`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteHandle(pub u64);

/// The three local stdio pipe ends created by the external channel factory
/// (`CreateClientPipes` in the original interface), split into the half the
/// server keeps (`client_info.*`) and the half that gets duplicated into the
/// client process.
///
/// `H` is [`crate::platform::TriggerPlatform::LocalHandle`]: a real
/// `OwnedHandle` against the Windows binding, an opaque token in tests.
pub struct StdioPipes<H> {
    /// Server-retained write end of the child's stdin pipe.
    pub stdin_write: H,
    /// Server-retained read end of the child's stdout pipe.
    pub stdout_read: H,
    /// Server-retained read end of the child's stderr pipe.
    pub stderr_read: H,
    /// Read end of the stdin pipe, to be duplicated into the client process.
    pub stdin_read: H,
    /// Write end of the stdout pipe, to be duplicated into the client process.
    pub stdout_write: H,
    /// Write end of the stderr pipe, to be duplicated into the client process.
    pub stderr_write: H,
}
