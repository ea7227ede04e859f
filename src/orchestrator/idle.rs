//! Idle teardown decisions.
//!
//! [`check_idle`] decides whether a process with no attached clients is kept
//! for another round or killed. Guards are consulted in order and the first
//! one that wants the process kept wins; new policies are added by appending
//! an [`IdleGuard`] to the list, never by changing `check_idle`.

use std::time::{Duration, Instant};

use crate::models::session::SessionActivity;

/// Current monotonic time on tokio's clock.
///
/// Activity timestamps and idle checks both read this, so paused-clock tests
/// see the same instants the timers do.
#[must_use]
pub fn monotonic_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Thresholds for [`check_idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlePolicy {
    /// Idle time before the first kill decision; also the grace window.
    pub idle_timeout: Duration,
    /// Absolute cap; past this no guard can keep the process alive.
    pub max_idle: Duration,
    /// Default re-check delay for guards that do not request one.
    pub recheck_interval: Duration,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5 * 60),
            max_idle: Duration::from_secs(30 * 60),
            recheck_interval: Duration::from_secs(30),
        }
    }
}

/// A guard's opinion on one idle check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GuardVerdict {
    /// Keep the process alive for now.
    pub keep: bool,
    /// Human-readable explanation.
    pub reason: Option<String>,
    /// Requested delay before the next check.
    pub recheck: Option<Duration>,
}

impl GuardVerdict {
    /// Keep the process alive.
    #[must_use]
    pub fn keep(reason: impl Into<String>) -> Self {
        Self {
            keep: true,
            reason: Some(reason.into()),
            recheck: None,
        }
    }

    /// No objection to a kill.
    #[must_use]
    pub fn decline() -> Self {
        Self::default()
    }

    /// Decline with an explanation.
    #[must_use]
    pub fn decline_because(reason: impl Into<String>) -> Self {
        Self {
            keep: false,
            reason: Some(reason.into()),
            recheck: None,
        }
    }

    /// Request a specific delay before the next check.
    #[must_use]
    pub fn with_recheck(mut self, delay: Duration) -> Self {
        self.recheck = Some(delay);
        self
    }
}

/// A named keep-alive policy. Implementations are stateless per call.
pub trait IdleGuard: Send + Sync {
    /// Stable name used in logs.
    fn name(&self) -> &str;

    /// Whether the process should survive this check.
    fn should_keep_alive(&self, activity: &SessionActivity, now: Instant) -> GuardVerdict;
}

/// Keeps a process alive while a turn is outstanding and output is fresh.
///
/// A turn with no output for longer than `stale_after` is treated as wedged
/// and the guard declines, so a stuck process cannot block teardown forever.
#[derive(Debug, Clone, Copy)]
pub struct ActiveTurnGuard {
    stale_after: Duration,
}

impl ActiveTurnGuard {
    /// Default staleness threshold (10 minutes).
    pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

    /// Guard with an explicit staleness threshold.
    #[must_use]
    pub fn new(stale_after: Duration) -> Self {
        Self { stale_after }
    }
}

impl Default for ActiveTurnGuard {
    fn default() -> Self {
        Self::new(Self::DEFAULT_STALE_AFTER)
    }
}

impl IdleGuard for ActiveTurnGuard {
    fn name(&self) -> &str {
        "active-turn"
    }

    fn should_keep_alive(&self, activity: &SessionActivity, now: Instant) -> GuardVerdict {
        if !activity.turn_in_progress {
            return GuardVerdict::decline();
        }

        // No output yet: measure from spawn.
        let last_seen = activity.last_output_at.unwrap_or(activity.spawned_at);
        let silent_for = now.saturating_duration_since(last_seen);

        if silent_for <= self.stale_after {
            GuardVerdict::keep("turn in progress")
        } else {
            GuardVerdict::decline_because(format!(
                "turn in progress but no output for {}s",
                silent_for.as_secs()
            ))
        }
    }
}

/// Guards installed when none are configured explicitly.
#[must_use]
pub fn default_guards(stale_after: Duration) -> Vec<Box<dyn IdleGuard>> {
    vec![Box::new(ActiveTurnGuard::new(stale_after))]
}

/// Result of one idle check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleDecision {
    /// Tear the process down.
    Kill {
        /// Why.
        reason: String,
    },
    /// Check again later.
    Recheck {
        /// Delay before the next check.
        delay: Duration,
        /// Whether a guard deferred the kill on this check.
        guard_deferred: bool,
        /// Why.
        reason: String,
    },
}

/// Decide whether an idle process is killed or re-checked.
///
/// `guard_deferred_last` is the aggregate flag from the previous decision:
/// when the guards stop deferring, exactly one grace window of the full idle
/// timeout is granted before the next kill decision.
///
/// `max_idle` is measured from `idle_start`, and the idle monitor resets
/// `idle_start` whenever a guard defers. The cap therefore only fires when
/// the gap between two checks exceeds it; a guard that keeps deferring at
/// the default recheck interval holds the process indefinitely.
pub fn check_idle(
    idle_start: Instant,
    guard_deferred_last: bool,
    guards: &[Box<dyn IdleGuard>],
    activity: &SessionActivity,
    now: Instant,
    policy: &IdlePolicy,
) -> IdleDecision {
    let idle_for = now.saturating_duration_since(idle_start);
    if idle_for > policy.max_idle {
        return IdleDecision::Kill {
            reason: format!("idle for {}s, exceeded absolute cap", idle_for.as_secs()),
        };
    }

    for guard in guards {
        let verdict = guard.should_keep_alive(activity, now);
        if verdict.keep {
            let reason = verdict
                .reason
                .unwrap_or_else(|| format!("kept alive by {}", guard.name()));
            return IdleDecision::Recheck {
                delay: verdict.recheck.unwrap_or(policy.recheck_interval),
                guard_deferred: true,
                reason,
            };
        }
    }

    if guard_deferred_last {
        return IdleDecision::Recheck {
            delay: policy.idle_timeout,
            guard_deferred: false,
            reason: "grace period after guard released".to_owned(),
        };
    }

    IdleDecision::Kill {
        reason: "idle timeout".to_owned(),
    }
}
