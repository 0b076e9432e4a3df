// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Startup configuration (spec §4.8): the handful of knobs the original
//! baked in as compile-time constants (`INSTANCES`, `TRIGGER_PIPE_NAME`,
//! `PIPE_TIMEOUT`), made overridable from the environment the way a guest
//! service reads its tunables at startup.

use std::env;

use qrexec_trigger_ipc::PipeConfig;

/// Default pipe name, matching `TRIGGER_PIPE_NAME` in the original headers.
pub const DEFAULT_PIPE_NAME: &str = r"\\.\pipe\qrexec_trigger";
/// Default pool size (`INSTANCES` in the original).
pub const DEFAULT_INSTANCES: u32 = 30;
/// Default per-client connect timeout, in milliseconds (`PIPE_TIMEOUT`).
pub const DEFAULT_CLIENT_TIMEOUT_MS: u32 = 2000;
/// Default pipe buffer size, large enough for the biggest control message
/// (`trigger_connect_params`).
const DEFAULT_BUFFER_SIZE: u32 = 4096;

#[derive(Debug, Clone)]
pub struct TriggerServerConfig {
    pub pipe_name: String,
    pub instances: u32,
    pub client_timeout_ms: u32,
}

impl Default for TriggerServerConfig {
    fn default() -> Self {
        TriggerServerConfig {
            pipe_name: DEFAULT_PIPE_NAME.to_string(),
            instances: DEFAULT_INSTANCES,
            client_timeout_ms: DEFAULT_CLIENT_TIMEOUT_MS,
        }
    }
}

impl TriggerServerConfig {
    /// Reads overrides from `QREXEC_TRIGGER_PIPE_NAME` and
    /// `QREXEC_TRIGGER_INSTANCES`, falling back to the compiled-in
    /// defaults. Malformed overrides are logged and ignored rather than
    /// treated as a startup error, since the defaults are always usable.
    pub fn from_env() -> Self {
        let mut config = TriggerServerConfig::default();

        if let Ok(name) = env::var("QREXEC_TRIGGER_PIPE_NAME") {
            if !name.is_empty() {
                config.pipe_name = name;
            }
        }

        if let Ok(raw) = env::var("QREXEC_TRIGGER_INSTANCES") {
            match raw.parse::<u32>() {
                Ok(0) => tracing::warn!("QREXEC_TRIGGER_INSTANCES must be positive, ignoring"),
                Ok(n) => config.instances = n,
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "invalid QREXEC_TRIGGER_INSTANCES, ignoring")
                }
            }
        }

        config
    }

    pub fn pipe_config(&self) -> PipeConfig {
        PipeConfig {
            name: self.pipe_name.clone(),
            out_buffer_size: DEFAULT_BUFFER_SIZE,
            in_buffer_size: DEFAULT_BUFFER_SIZE,
            client_timeout_ms: self.client_timeout_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_stable() {
        let config = TriggerServerConfig::default();
        assert_eq!(config.instances, DEFAULT_INSTANCES);
        assert_eq!(config.pipe_name, DEFAULT_PIPE_NAME);
    }
}
