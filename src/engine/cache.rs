//! Market-state cache — latest book snapshot per asset.
//!
//! Single logical writer (the stream manager), many readers. Snapshots are
//! immutable once published and swapped atomically per asset; a stored
//! sequence number guards against out-of-order application.
//!
//! The cache also owns the disconnect-handler registry: the stream manager
//! fires the registered handlers BEFORE any reconnect attempt so strategies
//! can flash-cancel resting orders instead of quoting blind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::types::BookSnapshot;

/// Institutional floor: a book older than this is invalid data.
pub const DEFAULT_STALENESS: Duration = Duration::from_millis(500);

type DisconnectHandler = Box<dyn Fn() + Send + Sync>;

pub struct MarketStateCache {
    books: RwLock<HashMap<String, Arc<BookSnapshot>>>,
    handlers: Mutex<Vec<(String, DisconnectHandler)>>,
}

impl Default for MarketStateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketStateCache {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Publish a snapshot. Returns false (and keeps the stored book) when
    /// the sequence number does not strictly increase.
    pub fn upsert(&self, snapshot: BookSnapshot) -> bool {
        let mut books = self.books.write();
        if let Some(existing) = books.get(&snapshot.asset) {
            if snapshot.seq <= existing.seq {
                warn!(
                    asset = %snapshot.asset,
                    stored_seq = existing.seq,
                    incoming_seq = snapshot.seq,
                    "rejecting out-of-order book update",
                );
                return false;
            }
        }
        debug!(asset = %snapshot.asset, seq = snapshot.seq, "book snapshot published");
        books.insert(snapshot.asset.clone(), Arc::new(snapshot));
        true
    }

    pub fn get(&self, asset: &str) -> Option<Arc<BookSnapshot>> {
        self.books.read().get(asset).cloned()
    }

    pub fn last_seq(&self, asset: &str) -> Option<u64> {
        self.books.read().get(asset).map(|s| s.seq)
    }

    /// All sequence numbers, for the persisted-state snapshot.
    pub fn all_seqs(&self) -> HashMap<String, u64> {
        self.books
            .read()
            .iter()
            .map(|(asset, snap)| (asset.clone(), snap.seq))
            .collect()
    }

    /// A missing snapshot counts as stale.
    pub fn is_stale(&self, asset: &str, threshold: Duration) -> bool {
        match self.get(asset) {
            Some(snap) => snap.age(Instant::now()) > threshold,
            None => true,
        }
    }

    pub fn stale_assets(&self, threshold: Duration) -> Vec<String> {
        let now = Instant::now();
        self.books
            .read()
            .values()
            .filter(|snap| snap.age(now) > threshold)
            .map(|snap| snap.asset.clone())
            .collect()
    }

    /// Register (or replace) a disconnect handler under an id. Handlers must
    /// not block: they forward a cancel command onto a channel.
    pub fn register_disconnect_handler<F>(&self, id: &str, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.lock();
        handlers.retain(|(existing, _)| existing != id);
        handlers.push((id.to_string(), Box::new(handler)));
    }

    /// Fire every registered handler. Called by the stream manager on any
    /// transport close, heartbeat timeout, or read error — before reconnect.
    pub fn trigger_disconnect_handlers(&self) {
        let handlers = self.handlers.lock();
        warn!(count = handlers.len(), "disconnect: firing flash-cancel handlers");
        for (id, handler) in handlers.iter() {
            debug!(handler = %id, "invoking disconnect handler");
            handler();
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rust_decimal_macros::dec;

    use super::*;
    use crate::engine::types::BookLevel;

    fn snap(asset: &str, seq: u64) -> BookSnapshot {
        BookSnapshot::new(
            asset.to_string(),
            vec![BookLevel { price: dec!(0.44), size: dec!(50) }],
            vec![BookLevel { price: dec!(0.46), size: dec!(50) }],
            seq,
            Instant::now(),
        )
    }

    #[test]
    fn test_upsert_and_get() {
        let cache = MarketStateCache::new();
        assert!(cache.upsert(snap("a", 1)));
        let stored = cache.get("a").unwrap();
        assert_eq!(stored.seq, 1);
        assert_eq!(stored.mid_price, dec!(0.45));
    }

    #[test]
    fn test_upsert_rejects_non_increasing_seq() {
        let cache = MarketStateCache::new();
        assert!(cache.upsert(snap("a", 5)));
        assert!(!cache.upsert(snap("a", 5)));
        assert!(!cache.upsert(snap("a", 4)));
        assert_eq!(cache.get("a").unwrap().seq, 5);
        assert!(cache.upsert(snap("a", 6)));
    }

    #[test]
    fn test_missing_asset_is_stale() {
        let cache = MarketStateCache::new();
        assert!(cache.is_stale("ghost", Duration::from_secs(1)));
    }

    #[test]
    fn test_staleness_threshold() {
        let cache = MarketStateCache::new();
        let mut old = snap("a", 1);
        old.updated_at = Instant::now() - Duration::from_millis(600);
        cache.upsert(old);
        assert!(cache.is_stale("a", Duration::from_millis(500)));
        assert!(!cache.is_stale("a", Duration::from_secs(2)));
        assert_eq!(cache.stale_assets(Duration::from_millis(500)), vec!["a".to_string()]);
    }

    #[test]
    fn test_disconnect_handlers_fire() {
        let cache = MarketStateCache::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let f1 = fired.clone();
        cache.register_disconnect_handler("mm", move || {
            f1.fetch_add(1, Ordering::SeqCst);
        });
        let f2 = fired.clone();
        cache.register_disconnect_handler("scanner", move || {
            f2.fetch_add(1, Ordering::SeqCst);
        });

        cache.trigger_disconnect_handlers();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_disconnect_handler_replaced_by_id() {
        let cache = MarketStateCache::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let f = fired.clone();
            cache.register_disconnect_handler("mm", move || {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }

        cache.trigger_disconnect_handlers();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
