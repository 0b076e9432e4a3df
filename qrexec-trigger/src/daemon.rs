// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The daemon sink seam (spec §4.7): the core's only outbound call to the
//! out-of-guest qrexec daemon. The real wire format that carries
//! `MSG_AGENT_TO_SERVER_TRIGGER_CONNECT_EXISTING` to the daemon is out of
//! scope (spec §1); this module only defines the boundary and two doubles
//! for it, mirroring how `datadog-ipc` keeps its transport generic over a
//! small blocking-call trait (`transport/blocking.rs`) rather than baking in
//! one wire protocol.

use qrexec_trigger_ipc::TriggerConnectParams;

/// Forwards a trigger-connect request to the daemon. `send_trigger_connect_existing`
/// mirrors `ReturnData(0, MSG_AGENT_TO_SERVER_TRIGGER_CONNECT_EXISTING, ...)`
/// from the original: a blocking call, expected to return quickly relative
/// to request latency (spec §5's "Suspension points").
///
/// Implementations are called from a blocking context (`spawn_blocking`); do
/// not assume an async runtime is available inside `send_trigger_connect_existing`.
pub trait DaemonSink: Send + Sync + 'static {
    fn send_trigger_connect_existing(&self, params: &TriggerConnectParams) -> anyhow::Result<()>;
}

/// Stub used when no real agent-to-daemon transport is wired up: logs the
/// request and succeeds. Lets the binary start and exercise the rest of the
/// handshake (useful for smoke-testing a build without the daemon side
/// present), at the cost of every request eventually timing out in S3.
pub struct LoggingDaemonSink;

impl DaemonSink for LoggingDaemonSink {
    fn send_trigger_connect_existing(&self, params: &TriggerConnectParams) -> anyhow::Result<()> {
        tracing::warn!(
            ident = params.process_fds.ident_str().unwrap_or("<bad ident>"),
            exec_index = %params.exec_index_string(),
            target_vmname = %params.target_vmname_string(),
            "no daemon transport configured; dropping trigger-connect request on the floor"
        );
        Ok(())
    }
}

pub mod testing {
    use std::sync::Mutex;

    use qrexec_trigger_ipc::TriggerConnectParams;
    use tokio::sync::mpsc;

    use super::DaemonSink;

    /// Records every forwarded request and hands it to the test over a
    /// channel, so a test can drive `ProceedWithExecution` for the right
    /// `ident` once the driver has actually issued the forward (spec
    /// scenario S-5's race).
    pub struct RecordingDaemonSink {
        tx: Mutex<mpsc::UnboundedSender<TriggerConnectParams>>,
    }

    impl RecordingDaemonSink {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<TriggerConnectParams>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                RecordingDaemonSink {
                    tx: Mutex::new(tx),
                },
                rx,
            )
        }
    }

    impl DaemonSink for RecordingDaemonSink {
        fn send_trigger_connect_existing(
            &self,
            params: &TriggerConnectParams,
        ) -> anyhow::Result<()> {
            self.tx
                .lock()
                .unwrap()
                .send(params.clone())
                .map_err(|_| anyhow::anyhow!("test receiver dropped"))
        }
    }

    /// Always fails, modeling a daemon transport that is down.
    pub struct FailingDaemonSink;

    impl DaemonSink for FailingDaemonSink {
        fn send_trigger_connect_existing(
            &self,
            _params: &TriggerConnectParams,
        ) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("daemon transport unavailable"))
        }
    }
}
