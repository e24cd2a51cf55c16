//! Command routing: classify the invocation, settle gateway ownership, then
//! run the backend and report its exit code.

use crate::config::{MuxConfig, DELEGATED_OWNER_VAR};
use crate::coordinator::{Role, SingletonCoordinator};
use crate::error::MuxError;
use crate::health::is_listening;
use crate::lock::NamedLock;
use crate::process::{BackendSupervisor, OutputMode};
use crate::proxy::ProxyServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Upper bound for the gateway loop to wind down after shutdown is signalled
const GATEWAY_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound for checking whether a backend already listens on the execution address
const EXECUTION_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// How an invocation is run against the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Long-running or interactive: raw output, block until the backend exits
    Foreground,
    /// Short management command: captured, rewritten output
    PassThrough,
    /// Unknown to us: raw, so the backend reports its own errors
    Unrecognized,
}

impl CommandClass {
    pub fn output_mode(self) -> OutputMode {
        match self {
            CommandClass::PassThrough => OutputMode::Captured,
            CommandClass::Foreground | CommandClass::Unrecognized => OutputMode::Raw,
        }
    }
}

/// Classify by the first argument, case-insensitively
pub fn classify(args: &[String]) -> CommandClass {
    let Some(first) = args.first() else {
        return CommandClass::Unrecognized;
    };

    match first.to_ascii_lowercase().as_str() {
        "serve" | "run" => CommandClass::Foreground,
        "create" | "show" | "stop" | "pull" | "push" | "list" | "ls" | "ps" | "cp" | "rm"
        | "help" | "-v" | "--version" | "-h" | "--help" => CommandClass::PassThrough,
        _ => CommandClass::Unrecognized,
    }
}

fn is_serve(args: &[String]) -> bool {
    args.first()
        .is_some_and(|first| first.eq_ignore_ascii_case("serve"))
}

pub struct CommandRouter {
    config: Arc<MuxConfig>,
    coordinator: SingletonCoordinator,
    supervisor: BackendSupervisor,
}

impl CommandRouter {
    pub fn new(config: Arc<MuxConfig>) -> Self {
        Self {
            coordinator: SingletonCoordinator::new(Arc::clone(&config)),
            supervisor: BackendSupervisor::new(Arc::clone(&config)),
            config,
        }
    }

    /// Run one invocation to completion and return the process exit code.
    ///
    /// Gateway ownership is settled before any backend command starts.
    pub async fn run(&self, args: &[String]) -> Result<i32, MuxError> {
        let class = classify(args);
        let serve = is_serve(args);
        info!(?class, args = ?args, "Routing command");

        match self.coordinator.acquire_or_defer().await? {
            Role::Client if serve => {
                info!(address = %self.config.hosts.public, "Gateway already running; nothing to serve");
                return Ok(0);
            }
            Role::Owner(lock) if serve => return self.serve(args, Some(lock)).await,
            Role::Delegated if serve => return self.serve(args, None).await,
            Role::Owner(lock) => self.hand_off_gateway(lock).await?,
            Role::Client | Role::Delegated => {}
        }

        self.supervisor.run_foreground(args, class.output_mode()).await
    }

    /// Host the gateway in this process for as long as the backend runs
    async fn serve(&self, args: &[String], lock: Option<NamedLock>) -> Result<i32, MuxError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Binding happens while the lock is still held
        let server = ProxyServer::bind(&self.config, shutdown_rx).await?;
        let mut gateway = tokio::spawn(server.run());
        if let Some(lock) = lock {
            lock.release();
        }

        let execution = &self.config.hosts.execution;
        let outcome = if is_listening(execution, EXECUTION_PROBE_TIMEOUT).await {
            info!(execution = %execution, "Backend already listening; serving the gateway only");
            tokio::select! {
                _ = shutdown_signal() => Ok(0),
                joined = &mut gateway => return Err(gateway_failure(joined)),
            }
        } else {
            tokio::select! {
                code = self.supervisor.run_foreground(args, OutputMode::Raw) => code,
                joined = &mut gateway => return Err(gateway_failure(joined)),
            }
        };

        wind_down(shutdown_tx, gateway, outcome).await
    }

    /// Start a detached `serve` of ourselves to own the gateway, holding the
    /// lock until it answers the health probe.
    async fn hand_off_gateway(&self, lock: NamedLock) -> Result<(), MuxError> {
        let exe = std::env::current_exe()?;
        let log_path = self.config.gateway_log_path();
        info!(exe = %exe.display(), log = %log_path.display(), "Starting detached gateway");

        self.supervisor
            .launch_detached(&exe, &["serve"], &[(DELEGATED_OWNER_VAR, "1")], &log_path)
            .await?;
        self.coordinator.await_healthy().await?;

        lock.release();
        Ok(())
    }
}

/// The gateway loop only returns after shutdown; anything earlier is a failure
fn gateway_failure(joined: Result<anyhow::Result<()>, tokio::task::JoinError>) -> MuxError {
    let reason = match joined {
        Ok(Ok(())) => "accept loop exited unexpectedly".to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(e) => e.to_string(),
    };
    error!(reason, "Gateway stopped while the backend was running");
    MuxError::Gateway(reason)
}

/// Stop the gateway once the backend is done; the backend's outcome stands
/// whatever the gateway reports while stopping
async fn wind_down(
    shutdown_tx: watch::Sender<bool>,
    gateway: JoinHandle<anyhow::Result<()>>,
    outcome: Result<i32, MuxError>,
) -> Result<i32, MuxError> {
    let _ = shutdown_tx.send(true);
    if let Err(e) = stop_gateway(gateway).await {
        warn!(error = %e, "Gateway failed while stopping");
    }
    outcome
}

async fn stop_gateway(gateway: JoinHandle<anyhow::Result<()>>) -> Result<(), MuxError> {
    match tokio::time::timeout(GATEWAY_STOP_TIMEOUT, gateway).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(MuxError::Gateway(e.to_string())),
        Ok(Err(e)) => Err(MuxError::Gateway(e.to_string())),
        Err(_) => {
            warn!(
                timeout_secs = GATEWAY_STOP_TIMEOUT.as_secs(),
                "Gateway did not stop in time"
            );
            Ok(())
        }
    }
}

/// Wait for Ctrl+C or, on Unix, SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
    }
}
