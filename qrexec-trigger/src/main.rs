// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Service entry point (spec §4.8). Installs a `tracing-subscriber`
//! `EnvFilter` subscriber, loads [`TriggerServerConfig`] from the
//! environment, spawns one [`Endpoint`] task per pool slot, and waits for
//! either `Ctrl+C` or every task to finish after shutdown is signaled.
//!
//! Full Windows service-control-manager registration (so the process can
//! run as an actual guest service rather than a console application) is
//! named as an open question in DESIGN.md rather than implemented here: it
//! has no bearing on the state machine under test, and `Ctrl+C` is
//! sufficient to drive the same shutdown path SCM stop control would.

#[cfg(windows)]
use std::sync::Arc;

#[cfg(windows)]
use qrexec_trigger::dispatcher::LoggingDispatcher;
#[cfg(windows)]
use qrexec_trigger::{DaemonSink, Endpoint, EndpointPool};
#[cfg(windows)]
use tokio::task::JoinSet;
#[cfg(windows)]
use tokio_util::sync::CancellationToken;
#[cfg(windows)]
use tracing_subscriber::EnvFilter;

#[cfg(windows)]
#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = qrexec_trigger::TriggerServerConfig::from_env();
    tracing::info!(
        pipe_name = %config.pipe_name,
        instances = config.instances,
        "starting qrexec trigger server"
    );

    let platform = Arc::new(qrexec_trigger_ipc::platform::WindowsPlatform::default());
    let pool = Arc::new(EndpointPool::new(config.instances as usize));
    let daemon: Arc<dyn DaemonSink> = Arc::new(qrexec_trigger::daemon::LoggingDaemonSink);
    // No real dispatcher subsystem is wired into this binary (out of scope
    // per spec §1); this logs every hand-off instead of acting on it.
    let dispatcher = Arc::new(LoggingDispatcher::default());
    let shutdown = CancellationToken::new();
    let pipe_config = config.pipe_config();

    let mut tasks = JoinSet::new();
    for index in 0..config.instances as usize {
        let (endpoint, _state_rx) = Endpoint::new(
            index,
            platform.clone(),
            pool.clone(),
            daemon.clone(),
            dispatcher.clone(),
            pipe_config.clone(),
            shutdown.clone(),
        );
        tasks.spawn(endpoint.run());
    }

    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for ctrl-c, shutting down anyway");
    } else {
        tracing::info!("ctrl-c received, shutting down");
    }
    shutdown.cancel();

    while tasks.join_next().await.is_some() {}
    tracing::info!("all endpoint tasks finished, exiting");
    Ok(())
}

#[cfg(not(windows))]
fn main() {
    eprintln!("qrexec-trigger only runs on Windows (it binds named pipes); nothing to do here.");
    std::process::exit(1);
}

#[cfg(windows)]
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
