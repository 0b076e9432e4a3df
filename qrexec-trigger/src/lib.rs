// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The qrexec trigger server core: a fixed-size pool of named-pipe
//! endpoints, each driving in-guest clients through a handshake with the
//! out-of-guest qrexec daemon.

pub mod config;
pub mod daemon;
pub mod dispatcher;
pub mod endpoint;
pub mod pool;
pub mod register;

pub use config::TriggerServerConfig;
pub use daemon::DaemonSink;
pub use dispatcher::{ClientInfo, Dispatcher, DispatcherError, ExitCodeResponse};
pub use endpoint::{Endpoint, EndpointState};
pub use pool::{EndpointPool, LookupError};
pub use register::{register, PendingClientInfo, RegisterError};
