//! Shared registry of order IDs believed to be resting on the exchange.
//!
//! The maker and the basket executor record every accepted order here and
//! release it once it fills, cancels, or goes terminal. The persistence
//! loop snapshots the registry so a restart can cancel orders the previous
//! run left behind. An ID whose remote cancel failed is kept on purpose:
//! better to re-cancel a dead order at start-up than to leave a live one
//! resting blind.

use std::collections::HashSet;

use parking_lot::Mutex;

#[derive(Default)]
pub struct OpenOrderTracker {
    inner: Mutex<HashSet<String>>,
}

impl OpenOrderTracker {
    pub fn insert(&self, order_id: &str) {
        self.inner.lock().insert(order_id.to_string());
    }

    pub fn remove(&self, order_id: &str) {
        self.inner.lock().remove(order_id);
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.inner.lock().contains(order_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove_lifecycle() {
        let tracker = OpenOrderTracker::default();
        assert!(tracker.is_empty());

        tracker.insert("a");
        tracker.insert("b");
        assert_eq!(tracker.len(), 2);
        assert!(tracker.contains("a"));

        tracker.remove("a");
        assert!(!tracker.contains("a"));
        assert_eq!(tracker.ids(), vec!["b".to_string()]);
    }

    #[test]
    fn test_duplicate_insert_is_single_entry() {
        let tracker = OpenOrderTracker::default();
        tracker.insert("a");
        tracker.insert("a");
        assert_eq!(tracker.len(), 1);
    }
}
