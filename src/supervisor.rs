//! Liveness supervision for the keyword-spotting process
//!
//! The host environment aggressively terminates background audio processes,
//! so the supervisor keeps three independent protections running: a
//! CPU-sleep-prevention lease (with a hard 24 h expiry bounding the cost of
//! a missed release), a recurring 15-minute revival deadline that restarts
//! the spotter if it is found dead, and an immediate ≈1 s revival when the
//! hosting task is discarded. Supervision is advisory: the spotter is the
//! source of truth for its own liveness.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::Result;
use crate::spotter::SpotterControl;

/// Recurring revival cadence
pub const REVIVAL_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Revival delay after the hosting task is discarded; the discard is a
/// strong signal of imminent termination
pub const DISCARD_REVIVAL_DELAY: Duration = Duration::from_secs(1);

/// Hard expiry on the sleep-prevention lease
pub const LEASE_MAX_HOLD: Duration = Duration::from_secs(24 * 60 * 60);

/// Command queue depth for the supervisor task
const COMMAND_BUFFER: usize = 16;

/// CPU-sleep-prevention port; the host environment provides the real token
pub trait SleepInhibitor: Send + Sync {
    /// Acquire the sleep-prevention token.
    ///
    /// # Errors
    ///
    /// Returns error if the host refuses; supervision continues without it.
    fn acquire(&self) -> Result<()>;

    /// Release the token. Idempotent.
    fn release(&self);
}

/// Inhibitor for hosts without a sleep-prevention facility
pub struct NullInhibitor;

impl SleepInhibitor for NullInhibitor {
    fn acquire(&self) -> Result<()> {
        tracing::debug!("sleep inhibition unavailable on this host");
        Ok(())
    }

    fn release(&self) {}
}

/// An acquired sleep-prevention lease
#[derive(Debug, Clone)]
pub struct SupervisionLease {
    /// When the lease was acquired
    pub acquired_at: DateTime<Utc>,
    /// Hard expiry; the supervisor releases at this point regardless
    pub expires_at: DateTime<Utc>,
}

impl SupervisionLease {
    fn acquire_now() -> Self {
        let acquired_at = Utc::now();
        let expires_at = acquired_at
            + chrono::Duration::from_std(LEASE_MAX_HOLD).unwrap_or(chrono::Duration::hours(24));
        Self {
            acquired_at,
            expires_at,
        }
    }
}

enum Command {
    SpotterStarted,
    SpotterStopped,
    TaskDiscarded,
}

/// Handle to the liveness supervisor task
#[derive(Clone)]
pub struct LivenessSupervisor {
    tx: mpsc::Sender<Command>,
}

impl LivenessSupervisor {
    /// Spawn the supervisor over a spotter and a sleep inhibitor
    #[must_use]
    pub fn spawn(spotter: Arc<dyn SpotterControl>, inhibitor: Arc<dyn SleepInhibitor>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(run(rx, spotter, inhibitor));
        Self { tx }
    }

    /// The spotting process (re)started: acquire the lease, reschedule the
    /// revival deadline. Restarting never duplicates the schedule.
    pub async fn spotter_started(&self) {
        let _ = self.tx.send(Command::SpotterStarted).await;
    }

    /// Deliberate, user-initiated stop: cancel the pending revival and
    /// release the lease.
    pub async fn spotter_stopped(&self) {
        let _ = self.tx.send(Command::SpotterStopped).await;
    }

    /// The hosting task was discarded while the process should still run.
    pub async fn task_discarded(&self) {
        let _ = self.tx.send(Command::TaskDiscarded).await;
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run(
    mut rx: mpsc::Receiver<Command>,
    spotter: Arc<dyn SpotterControl>,
    inhibitor: Arc<dyn SleepInhibitor>,
) {
    let mut lease: Option<SupervisionLease> = None;
    let mut revival_at: Option<Instant> = None;
    let mut lease_expires_at: Option<Instant> = None;

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::SpotterStarted => {
                        if lease.is_none() {
                            match inhibitor.acquire() {
                                Ok(()) => {
                                    let acquired = SupervisionLease::acquire_now();
                                    tracing::info!(
                                        expires_at = %acquired.expires_at,
                                        "sleep-prevention lease acquired"
                                    );
                                    lease = Some(acquired);
                                    lease_expires_at = Some(Instant::now() + LEASE_MAX_HOLD);
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "sleep inhibition unavailable");
                                }
                            }
                        }
                        revival_at = Some(Instant::now() + REVIVAL_INTERVAL);
                        tracing::debug!("revival rescheduled");
                    }
                    Command::SpotterStopped => {
                        revival_at = None;
                        if lease.take().is_some() {
                            inhibitor.release();
                            lease_expires_at = None;
                            tracing::info!("sleep-prevention lease released");
                        }
                        tracing::debug!("revival cancelled on deliberate stop");
                    }
                    Command::TaskDiscarded => {
                        if revival_at.is_some() {
                            revival_at = Some(Instant::now() + DISCARD_REVIVAL_DELAY);
                            tracing::info!("hosting task discarded, scheduling immediate revival");
                        }
                    }
                }
            }

            () = sleep_until_opt(revival_at), if revival_at.is_some() => {
                if spotter.is_running() {
                    tracing::trace!("spotter alive at revival check");
                } else {
                    // The only operation retried indefinitely: a failed
                    // restart waits for the next deadline
                    match spotter.start() {
                        Ok(()) => tracing::info!("spotter revived"),
                        Err(e) => tracing::error!(error = %e, "spotter revival failed"),
                    }
                }
                revival_at = Some(Instant::now() + REVIVAL_INTERVAL);
            }

            () = sleep_until_opt(lease_expires_at), if lease_expires_at.is_some() => {
                if let Some(expired) = lease.take() {
                    tracing::warn!(
                        acquired_at = %expired.acquired_at,
                        "sleep-prevention lease hit hard expiry, releasing"
                    );
                    inhibitor.release();
                }
                lease_expires_at = None;
            }
        }
    }

    if lease.take().is_some() {
        inhibitor.release();
    }
}
