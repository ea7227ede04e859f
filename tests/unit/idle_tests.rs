//! Unit tests for idle teardown decisions.

use std::time::{Duration, Instant};

use agent_relay::models::session::SessionActivity;
use agent_relay::orchestrator::idle::{
    check_idle, default_guards, ActiveTurnGuard, GuardVerdict, IdleDecision, IdleGuard, IdlePolicy,
};

const MIN: Duration = Duration::from_secs(60);

fn policy() -> IdlePolicy {
    IdlePolicy {
        idle_timeout: 5 * MIN,
        max_idle: 30 * MIN,
        recheck_interval: Duration::from_secs(30),
    }
}

fn idle_activity(spawned: Instant) -> SessionActivity {
    SessionActivity {
        turn_in_progress: false,
        last_output_at: None,
        spawned_at: spawned,
    }
}

fn busy_activity(spawned: Instant, last_output: Instant) -> SessionActivity {
    SessionActivity {
        turn_in_progress: true,
        last_output_at: Some(last_output),
        spawned_at: spawned,
    }
}

struct AlwaysKeep;

impl IdleGuard for AlwaysKeep {
    fn name(&self) -> &str {
        "always"
    }

    fn should_keep_alive(&self, _: &SessionActivity, _: Instant) -> GuardVerdict {
        GuardVerdict::keep("always")
    }
}

#[test]
fn cap_overrides_every_guard() {
    let start = Instant::now();
    let guards: Vec<Box<dyn IdleGuard>> = vec![Box::new(AlwaysKeep)];
    let decision = check_idle(
        start,
        true,
        &guards,
        &idle_activity(start),
        start + 31 * MIN,
        &policy(),
    );
    assert!(matches!(decision, IdleDecision::Kill { .. }), "{decision:?}");
}

#[test]
fn exactly_at_cap_is_not_killed_by_cap() {
    let start = Instant::now();
    let guards: Vec<Box<dyn IdleGuard>> = vec![Box::new(AlwaysKeep)];
    let decision = check_idle(
        start,
        false,
        &guards,
        &idle_activity(start),
        start + 30 * MIN,
        &policy(),
    );
    assert!(matches!(
        decision,
        IdleDecision::Recheck {
            guard_deferred: true,
            ..
        }
    ));
}

#[test]
fn no_guards_and_no_prior_deferral_kills() {
    let start = Instant::now();
    let decision = check_idle(
        start,
        false,
        &[],
        &idle_activity(start),
        start + 5 * MIN,
        &policy(),
    );
    assert_eq!(
        decision,
        IdleDecision::Kill {
            reason: "idle timeout".into()
        }
    );
}

#[test]
fn active_turn_defers_with_default_recheck() {
    let start = Instant::now();
    let now = start + 5 * MIN;
    let guards = default_guards(10 * MIN);
    let decision = check_idle(
        start,
        false,
        &guards,
        &busy_activity(start, now - MIN),
        now,
        &policy(),
    );
    assert_eq!(
        decision,
        IdleDecision::Recheck {
            delay: Duration::from_secs(30),
            guard_deferred: true,
            reason: "turn in progress".into(),
        }
    );
}

#[test]
fn stale_turn_does_not_defer() {
    let start = Instant::now();
    let now = start + 20 * MIN;
    let guards = default_guards(10 * MIN);
    let decision = check_idle(
        now - 5 * MIN,
        false,
        &guards,
        &busy_activity(start, now - 11 * MIN),
        now,
        &policy(),
    );
    assert!(matches!(decision, IdleDecision::Kill { .. }));
}

#[test]
fn release_grants_exactly_one_grace_window() {
    let start = Instant::now();
    let guards = default_guards(10 * MIN);
    let now = start + 6 * MIN;

    let grace = check_idle(start, true, &guards, &idle_activity(start), now, &policy());
    assert_eq!(
        grace,
        IdleDecision::Recheck {
            delay: 5 * MIN,
            guard_deferred: false,
            reason: "grace period after guard released".into(),
        }
    );

    let after = check_idle(
        start,
        false,
        &guards,
        &idle_activity(start),
        now + 5 * MIN,
        &policy(),
    );
    assert!(matches!(after, IdleDecision::Kill { .. }));
}

#[test]
fn first_keeping_guard_wins() {
    struct Decline;
    impl IdleGuard for Decline {
        fn name(&self) -> &str {
            "decline"
        }
        fn should_keep_alive(&self, _: &SessionActivity, _: Instant) -> GuardVerdict {
            GuardVerdict::decline()
        }
    }
    struct KeepSlow;
    impl IdleGuard for KeepSlow {
        fn name(&self) -> &str {
            "slow"
        }
        fn should_keep_alive(&self, _: &SessionActivity, _: Instant) -> GuardVerdict {
            GuardVerdict::keep("slow").with_recheck(Duration::from_secs(90))
        }
    }

    let start = Instant::now();
    let guards: Vec<Box<dyn IdleGuard>> =
        vec![Box::new(Decline), Box::new(KeepSlow), Box::new(AlwaysKeep)];
    let decision = check_idle(
        start,
        false,
        &guards,
        &idle_activity(start),
        start + MIN,
        &policy(),
    );
    assert_eq!(
        decision,
        IdleDecision::Recheck {
            delay: Duration::from_secs(90),
            guard_deferred: true,
            reason: "slow".into(),
        }
    );
}

#[test]
fn active_turn_guard_boundary_is_inclusive() {
    let start = Instant::now();
    let guard = ActiveTurnGuard::new(MIN);
    let at_limit = guard.should_keep_alive(&busy_activity(start, start), start + MIN);
    assert!(at_limit.keep);
    let past = guard.should_keep_alive(
        &busy_activity(start, start),
        start + MIN + Duration::from_millis(1),
    );
    assert!(!past.keep);
}

#[test]
fn idle_session_is_never_kept_by_active_turn_guard() {
    let start = Instant::now();
    let verdict = ActiveTurnGuard::default().should_keep_alive(&idle_activity(start), start);
    assert_eq!(verdict, GuardVerdict::decline());
}
