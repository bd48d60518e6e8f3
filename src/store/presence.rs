use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Derived liveness state, never stored; recomputed from `last_activity_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Active,
    Idle,
    Away,
    Stuck,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Idle => write!(f, "idle"),
            Self::Away => write!(f, "away"),
            Self::Stuck => write!(f, "stuck"),
        }
    }
}

const ACTIVE_WINDOW: Duration = Duration::from_secs(30);
const IDLE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Status from elapsed time since last activity, combined with whether the
/// agent holds a claim or reservation (a "commitment").
pub fn derive_status(
    last_activity_at: DateTime<Utc>,
    now: DateTime<Utc>,
    has_commitment: bool,
    stuck_threshold: Duration,
) -> PresenceStatus {
    let elapsed = (now - last_activity_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    if elapsed < ACTIVE_WINDOW {
        return PresenceStatus::Active;
    }
    if elapsed < IDLE_WINDOW {
        return PresenceStatus::Idle;
    }
    if elapsed >= stuck_threshold {
        return if has_commitment {
            PresenceStatus::Stuck
        } else {
            PresenceStatus::Away
        };
    }
    if has_commitment {
        PresenceStatus::Idle
    } else {
        PresenceStatus::Away
    }
}

/// Debounces stuck notifications: one per (agent, stuck-episode), where an
/// episode is identified by the `last_activity_at` it went stuck with. Fresh
/// activity starts a new episode.
#[derive(Default)]
pub struct StuckTracker {
    notified: HashMap<String, DateTime<Utc>>,
}

impl StuckTracker {
    /// Whether a stuck notification should be surfaced now.
    pub fn should_notify(&mut self, name: &str, last_activity_at: DateTime<Utc>) -> bool {
        match self.notified.get(name) {
            Some(episode) if *episode == last_activity_at => false,
            _ => {
                self.notified.insert(name.into(), last_activity_at);
                true
            }
        }
    }

    /// Clear episode state once the agent is no longer stuck.
    pub fn resolve(&mut self, name: &str) {
        self.notified.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    const THRESHOLD: Duration = Duration::from_secs(900);

    fn at(secs_ago: i64) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        (now - TimeDelta::seconds(secs_ago), now)
    }

    #[test]
    fn status_table() {
        // < 30 s: active regardless of commitments.
        let (last, now) = at(10);
        assert_eq!(derive_status(last, now, false, THRESHOLD), PresenceStatus::Active);
        assert_eq!(derive_status(last, now, true, THRESHOLD), PresenceStatus::Active);

        // < 5 min: idle regardless.
        let (last, now) = at(120);
        assert_eq!(derive_status(last, now, false, THRESHOLD), PresenceStatus::Idle);
        assert_eq!(derive_status(last, now, true, THRESHOLD), PresenceStatus::Idle);

        // >= 5 min below threshold: commitment keeps it idle, otherwise away.
        let (last, now) = at(600);
        assert_eq!(derive_status(last, now, true, THRESHOLD), PresenceStatus::Idle);
        assert_eq!(derive_status(last, now, false, THRESHOLD), PresenceStatus::Away);

        // >= threshold: stuck only with a commitment.
        let (last, now) = at(1000);
        assert_eq!(derive_status(last, now, true, THRESHOLD), PresenceStatus::Stuck);
        assert_eq!(derive_status(last, now, false, THRESHOLD), PresenceStatus::Away);
    }

    #[test]
    fn respects_configured_threshold() {
        let (last, now) = at(400);
        assert_eq!(
            derive_status(last, now, true, Duration::from_secs(350)),
            PresenceStatus::Stuck
        );
        assert_eq!(
            derive_status(last, now, true, Duration::from_secs(900)),
            PresenceStatus::Idle
        );
    }

    #[test]
    fn stuck_notifications_fire_once_per_episode() {
        let mut tracker = StuckTracker::default();
        let t1 = Utc::now();
        assert!(tracker.should_notify("Fox", t1));
        assert!(!tracker.should_notify("Fox", t1));

        // New activity timestamp means a new episode.
        let t2 = t1 + TimeDelta::seconds(60);
        assert!(tracker.should_notify("Fox", t2));

        // Resolution clears the episode so a relapse notifies again.
        tracker.resolve("Fox");
        assert!(tracker.should_notify("Fox", t2));
    }

    #[test]
    fn episodes_are_per_agent() {
        let mut tracker = StuckTracker::default();
        let t = Utc::now();
        assert!(tracker.should_notify("Fox", t));
        assert!(tracker.should_notify("Owl", t));
    }
}
