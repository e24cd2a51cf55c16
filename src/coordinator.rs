//! Singleton coordination across racing CLI invocations
//!
//! The named lock keeps two invocations from starting a gateway at the same
//! time; the health probe confirms that whoever holds the public address is
//! actually a working gateway. Neither check alone is enough: a lock holder
//! may die mid-startup, and a foreign process may own the port without ever
//! taking the lock.

use crate::config::MuxConfig;
use crate::error::MuxError;
use crate::health::probe_gateway;
use crate::lock::NamedLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Pause between lock/probe attempts while another invocation starts up
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Bounds for a single probe inside the overall deadline
const MIN_PROBE_ATTEMPT: Duration = Duration::from_millis(250);
const MAX_PROBE_ATTEMPT: Duration = Duration::from_secs(1);

/// Outcome of gateway acquisition for this invocation
#[derive(Debug)]
pub enum Role {
    /// This process must start the gateway; keep the lock until startup ends
    Owner(NamedLock),
    /// A parent invocation holds the lock on this process's behalf
    Delegated,
    /// A healthy gateway already answers on the public address
    Client,
}

impl Role {
    pub fn is_client(&self) -> bool {
        matches!(self, Role::Client)
    }
}

pub struct SingletonCoordinator {
    config: Arc<MuxConfig>,
}

impl SingletonCoordinator {
    pub fn new(config: Arc<MuxConfig>) -> Self {
        Self { config }
    }

    /// Become the gateway owner or defer to a healthy existing gateway.
    ///
    /// Retries until the probe timeout elapses, then fails with
    /// `StartupRace` rather than waiting indefinitely.
    pub async fn acquire_or_defer(&self) -> Result<Role, MuxError> {
        if self.config.delegated_owner {
            debug!("Gateway ownership delegated by parent invocation");
            return Ok(Role::Delegated);
        }

        let public = &self.config.hosts.public;
        let deadline = Instant::now() + self.config.probe_timeout;

        loop {
            let attempt = deadline
                .saturating_duration_since(Instant::now())
                .clamp(MIN_PROBE_ATTEMPT, MAX_PROBE_ATTEMPT);

            if let Some(lock) = NamedLock::try_acquire(&self.config.lock_dir, public)? {
                // A previous owner may have finished startup and released the lock
                if probe_gateway(public, attempt).await {
                    info!(address = %public, "Gateway already running");
                    return Ok(Role::Client);
                }
                info!(address = %public, lock = %lock.path().display(), "Acquired gateway ownership");
                return Ok(Role::Owner(lock));
            }

            if probe_gateway(public, attempt).await {
                info!(address = %public, "Gateway already running");
                return Ok(Role::Client);
            }

            if Instant::now() >= deadline {
                return Err(MuxError::startup_race(
                    public.to_string(),
                    "the startup lock is held elsewhere and no gateway acknowledged the health probe",
                ));
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until a gateway acknowledges the health probe, bounded by the probe timeout
    pub async fn await_healthy(&self) -> Result<(), MuxError> {
        let public = &self.config.hosts.public;
        let deadline = Instant::now() + self.config.probe_timeout;

        loop {
            let attempt = deadline
                .saturating_duration_since(Instant::now())
                .clamp(MIN_PROBE_ATTEMPT, MAX_PROBE_ATTEMPT);

            if probe_gateway(public, attempt).await {
                debug!(address = %public, "Gateway is healthy");
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(MuxError::startup_race(
                    public.to_string(),
                    "the gateway did not acknowledge the health probe in time",
                ));
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
