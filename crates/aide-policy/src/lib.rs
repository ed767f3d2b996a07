use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use aide_protocol::{CommandError, ConfirmationId, SafetyTier};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Never executed, even with confirmation.
pub const BLOCKED_PATTERNS: &[&str] = &[
    "mkfs",
    "dd if=",
    "> /dev/",
    ":(){ :|:",
    "chmod -r 777 /",
    "shutdown",
    "reboot",
    "halt",
    "init 0",
    "init 6",
];

/// Executed only after explicit confirmation.
pub const DESTRUCTIVE_PATTERNS: &[&str] = &[
    "rm ",
    "rm\t",
    "rmdir",
    "kill ",
    "killall",
    "pkill",
    "sudo ",
    "mv /",
    "chmod",
    "chown",
    "diskutil",
    "launchctl",
    "defaults write",
    "networksetup",
];

/// Case-insensitive substring classification; blocked patterns win.
pub fn classify(command: &str) -> SafetyTier {
    let lowered = command.to_lowercase();
    if BLOCKED_PATTERNS.iter().any(|p| lowered.contains(p)) {
        SafetyTier::Blocked
    } else if DESTRUCTIVE_PATTERNS.iter().any(|p| lowered.contains(p)) {
        SafetyTier::Destructive
    } else {
        SafetyTier::Safe
    }
}

/// Sliding-window limiter keyed by source label.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_calls: usize,
    calls: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), 20)
    }
}

impl RateLimiter {
    pub fn new(window: Duration, max_calls: usize) -> Self {
        Self {
            window,
            max_calls,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, source: &str) -> Result<(), CommandError> {
        self.check_at(source, Instant::now())
    }

    /// Rejected attempts are not recorded. Sources whose window has emptied
    /// are forgotten.
    pub fn check_at(&self, source: &str, now: Instant) -> Result<(), CommandError> {
        let mut calls = self.calls.lock();
        calls.retain(|_, window| {
            while window
                .front()
                .is_some_and(|oldest| now.saturating_duration_since(*oldest) >= self.window)
            {
                window.pop_front();
            }
            !window.is_empty()
        });

        let window = calls.entry(source.to_owned()).or_default();
        if window.len() >= self.max_calls {
            let retry_after = window
                .front()
                .map(|oldest| self.window.saturating_sub(now.saturating_duration_since(*oldest)))
                .unwrap_or(self.window);
            debug!(source, in_window = window.len(), "rate limit exceeded");
            return Err(CommandError::RateLimitExceeded {
                origin: source.to_owned(),
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }

        window.push_back(now);
        Ok(())
    }

    pub fn in_window(&self, source: &str) -> usize {
        self.calls.lock().get(source).map_or(0, VecDeque::len)
    }

    /// Sources with at least one call still inside the window.
    pub fn tracked_sources(&self) -> usize {
        self.calls.lock().len()
    }
}

#[derive(Debug)]
struct LockState {
    locked: bool,
    last_command_at: Instant,
}

/// Result of admitting a command through [`AutoLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// The command ended a locked period.
    pub unlocked: bool,
}

/// Inactivity lock that restricts trust-sensitive sources after a quiet period.
#[derive(Debug)]
pub struct AutoLock {
    timeout: Duration,
    restricted_sources: Vec<String>,
    state: Mutex<LockState>,
}

impl AutoLock {
    pub fn new(timeout: Duration, restricted_sources: Vec<String>) -> Self {
        Self::new_at(timeout, restricted_sources, Instant::now())
    }

    pub fn new_at(timeout: Duration, restricted_sources: Vec<String>, now: Instant) -> Self {
        Self {
            timeout,
            restricted_sources,
            state: Mutex::new(LockState {
                locked: false,
                last_command_at: now,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    pub fn requires_verification(&self, source: &str) -> bool {
        self.restricted_sources.iter().any(|s| s == source)
    }

    pub fn refresh(&self) -> bool {
        self.refresh_at(Instant::now())
    }

    /// Returns true only on the transition into the locked state.
    pub fn refresh_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if !state.locked && now.saturating_duration_since(state.last_command_at) >= self.timeout {
            state.locked = true;
            info!(timeout_secs = self.timeout.as_secs(), "inactivity lock engaged");
            return true;
        }
        false
    }

    pub fn admit(&self, source: &str) -> Result<Admission, CommandError> {
        self.admit_at(source, Instant::now())
    }

    /// Restricted sources are rejected while locked without touching the
    /// activity timestamp. Admission never engages the lock; only
    /// [`AutoLock::refresh_at`] does, so callers refresh first and observe
    /// every transition.
    pub fn admit_at(&self, source: &str, now: Instant) -> Result<Admission, CommandError> {
        let mut state = self.state.lock();
        if state.locked && self.requires_verification(source) {
            return Err(CommandError::LockedRejection {
                origin: source.to_owned(),
            });
        }

        let unlocked = state.locked;
        state.locked = false;
        state.last_command_at = now;
        if unlocked {
            info!(source, "inactivity lock released");
        }
        Ok(Admission { unlocked })
    }
}

/// A destructive shell command waiting for an explicit yes or no.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub id: ConfirmationId,
    pub command: String,
    pub source: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ConfirmationQueue {
    ttl: Duration,
    pending: Mutex<HashMap<ConfirmationId, (PendingConfirmation, Instant)>>,
}

impl Default for ConfirmationQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(5 * 60))
    }
}

impl ConfirmationQueue {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn enqueue(&self, command: impl Into<String>, source: impl Into<String>) -> PendingConfirmation {
        self.enqueue_at(command, source, Instant::now())
    }

    pub fn enqueue_at(
        &self,
        command: impl Into<String>,
        source: impl Into<String>,
        now: Instant,
    ) -> PendingConfirmation {
        let pending = PendingConfirmation {
            id: ConfirmationId::new_uuid(),
            command: command.into(),
            source: source.into(),
            requested_at: Utc::now(),
        };
        self.pending
            .lock()
            .insert(pending.id.clone(), (pending.clone(), now));
        pending
    }

    pub fn take(&self, id: &ConfirmationId) -> Option<PendingConfirmation> {
        self.take_at(id, Instant::now())
    }

    /// Removes the entry; expired entries are dropped and reported as absent.
    pub fn take_at(&self, id: &ConfirmationId, now: Instant) -> Option<PendingConfirmation> {
        let mut pending = self.pending.lock();
        Self::prune(&mut pending, self.ttl, now);
        pending.remove(id).map(|(confirmation, _)| confirmation)
    }

    pub fn pending(&self) -> Vec<PendingConfirmation> {
        self.pending_at(Instant::now())
    }

    pub fn pending_at(&self, now: Instant) -> Vec<PendingConfirmation> {
        let mut pending = self.pending.lock();
        Self::prune(&mut pending, self.ttl, now);
        let mut items: Vec<_> = pending.values().map(|(c, _)| c.clone()).collect();
        items.sort_by_key(|c| c.requested_at);
        items
    }

    fn prune(
        pending: &mut HashMap<ConfirmationId, (PendingConfirmation, Instant)>,
        ttl: Duration,
        now: Instant,
    ) {
        pending.retain(|id, (_, at)| {
            let live = now.saturating_duration_since(*at) < ttl;
            if !live {
                debug!(confirmation_id = %id, "pending confirmation expired");
            }
            live
        });
    }
}
