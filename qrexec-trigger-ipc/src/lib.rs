// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire protocol, handle-ownership abstractions, and platform bindings shared
//! between the trigger server core and its Windows named-pipe transport.
//!
//! This crate mirrors the `datadog-ipc` split from the rest of the workspace:
//! platform-neutral types and traits live at the top level, the concrete OS
//! binding lives under [`platform`].

pub mod handles;
pub mod platform;
pub mod protocol;

pub use handles::{HandleError, RemoteHandle, StdioPipes};
pub use platform::{PipeConfig, PipeConnection, TriggerPlatform};
pub use protocol::{
    CreateProcessResponse, IoHandles, ProcessFds, ProtocolError, TriggerConnectParams,
};
