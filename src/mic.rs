//! Microphone arbitration
//!
//! Exactly one of {keyword spotter, dictation} may own the microphone at any
//! instant. Acquiring for a new owner synchronously revokes the current owner
//! (stopping its audio stream) before granting, so there is no window where
//! two consumers read the same hardware stream. Revocation failure is
//! reported as a resource conflict but never blocks the grant: audio engines
//! are externally supervised, so the arbiter fails open in favor of
//! responsiveness.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Bound on how long revoking the previous owner may take before the
/// handoff is reported as a resource conflict
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Microphone owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MicOwner {
    /// Nobody holds the microphone
    #[default]
    None,
    /// The always-on keyword spotter
    KeywordSpotter,
    /// An active dictation session
    Dictation,
}

impl std::fmt::Display for MicOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::KeywordSpotter => write!(f, "keyword-spotter"),
            Self::Dictation => write!(f, "dictation"),
        }
    }
}

/// A microphone consumer that can be told to stop its audio stream when
/// its grant is revoked.
///
/// Implementations must not call back into the arbiter from `stop_stream`.
pub trait MicConsumer: Send + Sync {
    /// Stop reading from the microphone. Called with the grant already
    /// reassigned; must be prompt and must not block on the audio device.
    ///
    /// # Errors
    ///
    /// Returns error if the stream could not be stopped; the arbiter logs
    /// this as a resource conflict and proceeds.
    fn stop_stream(&self) -> crate::Result<()>;
}

/// Outcome of an acquisition request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// Grant succeeded with a clean handoff
    Granted,
    /// Grant succeeded, but the previous owner did not stop cleanly
    /// within the bound
    GrantedAfterConflict,
    /// Request refused (acquiring for `MicOwner::None` is invalid)
    Denied,
}

impl Acquisition {
    /// Whether the caller now owns the microphone
    #[must_use]
    pub const fn is_granted(self) -> bool {
        matches!(self, Self::Granted | Self::GrantedAfterConflict)
    }
}

struct Inner {
    owner: MicOwner,
    consumers: HashMap<MicOwner, Arc<dyn MicConsumer>>,
}

/// Serializes microphone ownership between the keyword spotter and
/// dictation sessions
pub struct MicArbiter {
    inner: Mutex<Inner>,
}

impl Default for MicArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl MicArbiter {
    /// Create a new arbiter with no owner
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                owner: MicOwner::None,
                consumers: HashMap::new(),
            }),
        }
    }

    /// Register the stop hook for an owner. Later registrations replace
    /// earlier ones.
    pub fn register(&self, owner: MicOwner, consumer: Arc<dyn MicConsumer>) {
        if owner == MicOwner::None {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.consumers.insert(owner, consumer);
    }

    /// Acquire the microphone for `owner`, revoking the current owner first.
    ///
    /// Synchronous from the caller's perspective: returns only after the
    /// previous owner has been told to stop.
    pub fn acquire(&self, owner: MicOwner) -> Acquisition {
        if owner == MicOwner::None {
            return Acquisition::Denied;
        }

        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let previous = inner.owner;
        if previous == owner {
            return Acquisition::Granted;
        }

        inner.owner = owner;

        let mut conflict = false;
        if previous != MicOwner::None
            && let Some(consumer) = inner.consumers.get(&previous).cloned()
        {
            let started = Instant::now();
            if let Err(e) = consumer.stop_stream() {
                tracing::warn!(
                    previous = %previous,
                    owner = %owner,
                    error = %e,
                    "previous mic owner did not stop cleanly; granting anyway"
                );
                conflict = true;
            } else if started.elapsed() > STOP_TIMEOUT {
                tracing::warn!(
                    previous = %previous,
                    owner = %owner,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "mic revocation exceeded stop timeout"
                );
                conflict = true;
            }
        }

        tracing::debug!(previous = %previous, owner = %owner, conflict, "mic granted");
        if conflict {
            Acquisition::GrantedAfterConflict
        } else {
            Acquisition::Granted
        }
    }

    /// Release the microphone if `owner` currently holds it.
    ///
    /// Idempotent: releasing a non-current owner is a no-op.
    pub fn release(&self, owner: MicOwner) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.owner == owner && owner != MicOwner::None {
            inner.owner = MicOwner::None;
            tracing::debug!(owner = %owner, "mic released");
        }
    }

    /// Current microphone owner
    #[must_use]
    pub fn owner(&self) -> MicOwner {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .owner
    }
}
