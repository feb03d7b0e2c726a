//! Host binary: parse arguments, build the supervisor, run until the
//! host asks for shutdown.
//!
//! Exit codes: 0 normal shutdown, 1 configuration error, 2
//! initialization failure, 3 unrecoverable subsystem failure. SIGTERM
//! and ctrl-c both trigger the orderly path: stop accepting work, drain,
//! persist caches, close connections.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use nimbus::cli::Args;
use nimbus::net::http3::ScriptedOrigin;
use nimbus::persist::StateStore;
use nimbus::supervisor::{InProcessLauncher, ProcessKind, ProcessSupervisor};

const EXIT_CONFIG: u8 = 1;
const EXIT_INIT: u8 = 2;
const EXIT_SUBSYSTEM: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    nimbus::logging::init();
    let args = Args::parse();

    let config = match args.to_config() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let store = match &args.state_dir {
        Some(dir) => match StateStore::new(dir) {
            Ok(store) => Some(store),
            Err(e) => {
                error!("cannot open state directory: {e}");
                return ExitCode::from(EXIT_INIT);
            }
        },
        None => None,
    };

    // The in-process launcher and scripted origin stand in for the
    // host's process spawner and datagram stack.
    let launcher = InProcessLauncher::new(config.ipc.clone());
    let origin = Arc::new(ScriptedOrigin::new());
    let supervisor = match ProcessSupervisor::new(config, launcher, origin, store) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!("initialization failed: {e}");
            return ExitCode::from(EXIT_INIT);
        }
    };
    supervisor.start_maintenance(Duration::from_secs(30));

    // Bring up the standard child set.
    for kind in [
        ProcessKind::Network,
        ProcessKind::Storage,
        ProcessKind::Gpu,
        ProcessKind::Renderer,
    ] {
        if let Err(e) = supervisor.spawn(kind).await {
            error!("failed to start {kind:?} process: {e}");
            supervisor.shutdown().await;
            return ExitCode::from(EXIT_SUBSYSTEM);
        }
    }
    info!("nimbus core v{} running", nimbus::VERSION);

    wait_for_shutdown_signal().await;
    supervisor.shutdown().await;
    info!("shutdown complete");
    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        result = tokio::signal::ctrl_c() => {
            if result.is_ok() {
                info!("interrupt received");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
