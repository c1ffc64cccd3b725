use std::collections::HashMap;

use indexmap::IndexSet;

/// Per-user index of submitted job ids, kept across queue transitions so
/// user-filtered views stay O(user's jobs).
#[derive(Debug, Default)]
pub struct UserJobTracker {
    jobs_by_user: HashMap<String, IndexSet<String>>,
}

impl UserJobTracker {
    pub fn track(&mut self, user_id: &str, id_hash: &str) {
        self.jobs_by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(id_hash.to_string());
    }

    pub fn jobs_for_user(&self, user_id: &str) -> Vec<String> {
        self.jobs_by_user
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn owns(&self, user_id: &str, id_hash: &str) -> bool {
        self.jobs_by_user
            .get(user_id)
            .is_some_and(|ids| ids.contains(id_hash))
    }

    pub fn user_count(&self) -> usize {
        self.jobs_by_user.len()
    }

    pub fn clear(&mut self) {
        self.jobs_by_user.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_per_user_in_insertion_order() {
        let mut tracker = UserJobTracker::default();
        tracker.track("alice", "h1");
        tracker.track("alice", "h3");
        tracker.track("alice", "h2");
        tracker.track("bob", "h4");

        assert_eq!(tracker.jobs_for_user("alice"), vec!["h1", "h3", "h2"]);
        assert_eq!(tracker.jobs_for_user("bob"), vec!["h4"]);
        assert!(tracker.jobs_for_user("carol").is_empty());
    }

    #[test]
    fn ownership_checks() {
        let mut tracker = UserJobTracker::default();
        tracker.track("alice", "h1");
        assert!(tracker.owns("alice", "h1"));
        assert!(!tracker.owns("bob", "h1"));
        assert!(!tracker.owns("alice", "h2"));
    }

    #[test]
    fn duplicate_tracking_is_idempotent() {
        let mut tracker = UserJobTracker::default();
        tracker.track("alice", "h1");
        tracker.track("alice", "h1");
        assert_eq!(tracker.jobs_for_user("alice").len(), 1);
    }

    #[test]
    fn clear_empties_everything() {
        let mut tracker = UserJobTracker::default();
        tracker.track("alice", "h1");
        tracker.clear();
        assert_eq!(tracker.user_count(), 0);
    }
}
