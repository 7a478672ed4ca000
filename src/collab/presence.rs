use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::models::{PresenceEntry, PresenceSet, PresenceStatus};

#[derive(Debug, Clone)]
struct Tracked {
    status: PresenceStatus,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    last_seen: Instant,
}

/// Changes produced by one presence sweep
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub idled: Vec<String>,
    /// Users whose liveness window elapsed, as `offline` entries
    pub expired: Vec<PresenceEntry>,
}

impl SweepOutcome {
    pub fn is_empty(&self) -> bool {
        self.idled.is_empty() && self.expired.is_empty()
    }
}

/// Per-document view of connected users.
///
/// Owned by the document coordinator, which is the only writer. Readers get
/// owned snapshots.
#[derive(Debug)]
pub struct PresenceTracker {
    doc_id: String,
    idle_after: Duration,
    expire_after: Duration,
    users: HashMap<String, Tracked>,
}

impl PresenceTracker {
    pub fn new(doc_id: impl Into<String>, idle_after: Duration, expire_after: Duration) -> Self {
        Self {
            doc_id: doc_id.into(),
            idle_after,
            expire_after,
            users: HashMap::new(),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Mark a user active and reset both their activity and liveness clocks.
    /// Returns true when the visible status changed.
    pub fn mark_active(&mut self, user_id: &str) -> bool {
        let now = Instant::now();
        let changed = self
            .users
            .get(user_id)
            .map_or(true, |t| t.status != PresenceStatus::Active);
        self.users.insert(
            user_id.to_string(),
            Tracked {
                status: PresenceStatus::Active,
                last_activity: now,
                last_activity_at: Utc::now(),
                last_seen: now,
            },
        );
        changed
    }

    /// Liveness refresh from a heartbeat
    pub fn touch(&mut self, user_id: &str) -> bool {
        match self.users.get_mut(user_id) {
            Some(tracked) => {
                tracked.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn mark_idle(&mut self, user_id: &str) -> bool {
        match self.users.get_mut(user_id) {
            Some(tracked) if tracked.status == PresenceStatus::Active => {
                tracked.status = PresenceStatus::Idle;
                true
            }
            _ => false,
        }
    }

    /// Drop a user, returning their final entry marked offline
    pub fn remove(&mut self, user_id: &str) -> Option<PresenceEntry> {
        self.users.remove(user_id).map(|tracked| departed(user_id, &tracked))
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Idle users without recent operations and drop users whose liveness
    /// window elapsed.
    pub fn sweep(&mut self, now: Instant) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        for (user_id, tracked) in self.users.iter_mut() {
            if now.saturating_duration_since(tracked.last_seen) >= self.expire_after {
                outcome.expired.push(departed(user_id, tracked));
            } else if tracked.status == PresenceStatus::Active
                && now.saturating_duration_since(tracked.last_activity) >= self.idle_after
            {
                tracked.status = PresenceStatus::Idle;
                outcome.idled.push(user_id.clone());
            }
        }
        for entry in &outcome.expired {
            self.users.remove(&entry.user_id);
        }
        outcome.idled.sort();
        outcome.expired.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        outcome
    }

    pub fn snapshot(&self) -> PresenceSet {
        let mut set: PresenceSet = self
            .users
            .iter()
            .map(|(user_id, tracked)| PresenceEntry {
                user_id: user_id.clone(),
                status: tracked.status,
                last_activity: tracked.last_activity_at,
            })
            .collect();
        set.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        set
    }
}

fn departed(user_id: &str, tracked: &Tracked) -> PresenceEntry {
    PresenceEntry {
        user_id: user_id.to_string(),
        status: PresenceStatus::Offline,
        last_activity: tracked.last_activity_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new("doc", Duration::from_secs(60), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn users_expire_after_the_liveness_window() {
        let mut presence = tracker();
        assert!(presence.mark_active("alice"));
        assert!(!presence.mark_active("alice"));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(presence.sweep(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let outcome = presence.sweep(Instant::now());
        assert_eq!(outcome.expired.len(), 1);
        assert_eq!(outcome.expired[0].user_id, "alice");
        assert_eq!(outcome.expired[0].status, PresenceStatus::Offline);
        assert!(presence.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_users_alive_but_idle() {
        let mut presence = tracker();
        presence.mark_active("alice");
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(10)).await;
            assert!(presence.touch("alice"));
        }
        let outcome = presence.sweep(Instant::now());
        assert_eq!(outcome.idled, vec!["alice".to_string()]);
        assert!(outcome.expired.is_empty());
        assert_eq!(presence.snapshot()[0].status, PresenceStatus::Idle);

        // An operation brings the user back.
        assert!(presence.mark_active("alice"));
        assert_eq!(presence.snapshot()[0].status, PresenceStatus::Active);
    }

    #[test]
    fn snapshots_are_detached_copies() {
        let mut presence = tracker();
        presence.mark_active("bob");
        presence.mark_active("alice");
        let snapshot = presence.snapshot();
        let gone = presence.remove("alice").unwrap();
        assert_eq!(gone.status, PresenceStatus::Offline);
        assert!(presence.remove("alice").is_none());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].user_id, "alice");
        assert_eq!(presence.snapshot().len(), 1);
        assert!(!presence.touch("alice"));
        assert!(!presence.mark_idle("alice"));
    }
}
