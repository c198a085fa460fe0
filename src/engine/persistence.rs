//! Persisted state — a compact JSON document written on an interval and
//! reconciled against the exchange at start-up.
//!
//! The exchange is the source of truth on rehydration: any per-asset
//! disagreement beyond one tick logs a checksum warning and the persisted
//! copy loses.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use super::cache::MarketStateCache;
use super::inventory::{InventoryManager, Position};
use super::risk::RiskController;
use super::types::{FLAT_TOLERANCE, PRICE_TICK};
use crate::exchange::PositionRecord;

pub type OutstandingOrders = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPosition {
    pub asset: String,
    pub market: String,
    pub shares: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub saved_at: DateTime<Utc>,
    pub positions: Vec<PersistedPosition>,
    pub realized_pnl: Decimal,
    pub peak_equity: Decimal,
    pub last_book_seq: HashMap<String, u64>,
    pub outstanding_order_ids: Vec<String>,
}

/// Capture the current state of the core.
pub fn snapshot(
    inventory: &InventoryManager,
    risk: &RiskController,
    cache: &MarketStateCache,
    outstanding_order_ids: Vec<String>,
) -> PersistedState {
    let positions: Vec<PersistedPosition> = inventory
        .positions()
        .into_iter()
        .filter(|p| !p.is_flat())
        .map(|p| PersistedPosition {
            asset: p.asset,
            market: p.market,
            shares: p.shares,
            avg_entry_price: p.avg_entry_price,
            realized_pnl: p.realized_pnl,
        })
        .collect();
    PersistedState {
        saved_at: Utc::now(),
        positions,
        // Lifetime figure from the manager, not a sum over open positions:
        // closed positions already left the map but their P&L stays.
        realized_pnl: inventory.realized_pnl(),
        peak_equity: risk.status().peak_equity,
        last_book_seq: cache.all_seqs(),
        outstanding_order_ids,
    }
}

/// Atomic write: temp file in the same directory, then rename.
pub fn save(path: &Path, state: &PersistedState) -> Result<()> {
    let body = serde_json::to_vec_pretty(state).context("state serialization failed")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

pub fn load(path: &Path) -> Result<PersistedState> {
    let body = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&body).context("state deserialization failed")
}

/// Merge the persisted book against a freshly fetched exchange view.
/// Agreement within one tick keeps the persisted record (it carries the
/// realized P&L the exchange does not report); anything else is a checksum
/// warning and the exchange wins.
pub fn reconcile(persisted: &PersistedState, exchange: &[PositionRecord]) -> Vec<Position> {
    let persisted_by_asset: HashMap<&str, &PersistedPosition> =
        persisted.positions.iter().map(|p| (p.asset.as_str(), p)).collect();

    let mut restored = Vec::new();
    for record in exchange {
        if record.shares.abs() < FLAT_TOLERANCE {
            continue;
        }
        let position = match persisted_by_asset.get(record.asset.as_str()) {
            Some(saved) => {
                let shares_diff = (saved.shares - record.shares).abs();
                let price_diff = (saved.avg_entry_price - record.avg_price).abs();
                if shares_diff > FLAT_TOLERANCE || price_diff > PRICE_TICK {
                    warn!(
                        asset = %record.asset,
                        saved_shares = %saved.shares,
                        exchange_shares = %record.shares,
                        "checksum mismatch, using exchange state",
                    );
                    from_exchange(record)
                } else {
                    from_persisted(saved)
                }
            }
            None => {
                warn!(asset = %record.asset, "position unknown to persisted state, adopting");
                from_exchange(record)
            }
        };
        restored.push(position);
    }

    for saved in &persisted.positions {
        if !exchange.iter().any(|r| r.asset == saved.asset) {
            warn!(asset = %saved.asset, "persisted position absent on exchange, dropping");
        }
    }
    restored
}

fn base_position(asset: &str, market: &str, shares: Decimal, avg: Decimal, realized: Decimal) -> Position {
    Position {
        asset: asset.to_string(),
        market: market.to_string(),
        shares,
        avg_entry_price: avg,
        realized_pnl: realized,
        unrealized_pnl: Decimal::ZERO,
        mark_price: avg,
        last_update: Instant::now(),
        accumulated_dust: Decimal::ZERO,
        fill_count: 0,
        total_markout_pnl: Decimal::ZERO,
        markout_samples: 0,
        fill_history: Default::default(),
    }
}

fn from_persisted(saved: &PersistedPosition) -> Position {
    base_position(&saved.asset, &saved.market, saved.shares, saved.avg_entry_price, saved.realized_pnl)
}

fn from_exchange(record: &PositionRecord) -> Position {
    base_position(&record.asset, &record.market, record.shares, record.avg_price, Decimal::ZERO)
}

/// Interval writer. One snapshot per tick, one final snapshot on stop.
pub async fn run_persistence_loop(
    path: PathBuf,
    interval: Duration,
    inventory: Arc<InventoryManager>,
    risk: Arc<RiskController>,
    cache: Arc<MarketStateCache>,
    outstanding: OutstandingOrders,
    mut stop_rx: watch::Receiver<bool>,
) {
    info!(path = %path.display(), secs = interval.as_secs(), "persistence loop started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let state = snapshot(&inventory, &risk, &cache, outstanding());
                if let Err(err) = save(&path, &state) {
                    warn!(?err, "state persistence failed");
                }
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
    let state = snapshot(&inventory, &risk, &cache, outstanding());
    if let Err(err) = save(&path, &state) {
        warn!(?err, "final state persistence failed");
    }
    info!("persistence loop stopped");
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::engine::inventory::InventoryConfig;
    use crate::engine::messages::InventoryView;
    use crate::engine::risk::RiskConfig;
    use crate::engine::types::Side;

    fn state_with(positions: Vec<PersistedPosition>) -> PersistedState {
        PersistedState {
            saved_at: Utc::now(),
            positions,
            realized_pnl: Decimal::ZERO,
            peak_equity: dec!(100),
            last_book_seq: HashMap::new(),
            outstanding_order_ids: Vec::new(),
        }
    }

    fn persisted(asset: &str, shares: Decimal, avg: Decimal) -> PersistedPosition {
        PersistedPosition {
            asset: asset.to_string(),
            market: "mkt".to_string(),
            shares,
            avg_entry_price: avg,
            realized_pnl: dec!(1.25),
        }
    }

    fn exchange(asset: &str, shares: Decimal, avg: Decimal) -> PositionRecord {
        PositionRecord {
            asset: asset.to_string(),
            market: "mkt".to_string(),
            shares,
            avg_price: avg,
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("pm-engine-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");

        let mut state = state_with(vec![persisted("a", dec!(10), dec!(0.50))]);
        state.last_book_seq.insert("a".to_string(), 42);
        state.outstanding_order_ids.push("ord-1".to_string());

        save(&path, &state).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.positions.len(), 1);
        assert_eq!(loaded.positions[0].shares, dec!(10));
        assert_eq!(loaded.last_book_seq["a"], 42);
        assert_eq!(loaded.outstanding_order_ids, vec!["ord-1".to_string()]);
        assert_eq!(loaded.peak_equity, dec!(100));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_reconcile_agreement_keeps_persisted_pnl() {
        let state = state_with(vec![persisted("a", dec!(10), dec!(0.50))]);
        let restored = reconcile(&state, &[exchange("a", dec!(10), dec!(0.50))]);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].realized_pnl, dec!(1.25));
    }

    #[test]
    fn test_reconcile_mismatch_uses_exchange_truth() {
        let state = state_with(vec![persisted("a", dec!(10), dec!(0.50))]);
        let restored = reconcile(&state, &[exchange("a", dec!(12), dec!(0.48))]);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].shares, dec!(12));
        assert_eq!(restored[0].avg_entry_price, dec!(0.48));
        assert_eq!(restored[0].realized_pnl, Decimal::ZERO);
    }

    #[test]
    fn test_reconcile_adopts_unknown_exchange_position() {
        let state = state_with(vec![]);
        let restored = reconcile(&state, &[exchange("b", dec!(3), dec!(0.20))]);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].asset, "b");
    }

    #[test]
    fn test_reconcile_drops_position_absent_on_exchange() {
        let state = state_with(vec![persisted("gone", dec!(10), dec!(0.50))]);
        let restored = reconcile(&state, &[]);
        assert!(restored.is_empty());
    }

    fn persist_and_restore(live: &InventoryManager) -> (PersistedState, InventoryManager) {
        let (_, inv_rx) = watch::channel(InventoryView::default());
        let risk = RiskController::new(RiskConfig::default(), inv_rx);
        let cache = MarketStateCache::new();
        let state = snapshot(live, &risk, &cache, Vec::new());
        let records: Vec<PositionRecord> = state
            .positions
            .iter()
            .map(|p| exchange(&p.asset, p.shares, p.avg_entry_price))
            .collect();

        let restarted = InventoryManager::new(InventoryConfig::default());
        restarted.restore(reconcile(&state, &records), state.realized_pnl);
        (state, restarted)
    }

    #[test]
    fn test_rehydrate_then_update_matches_uninterrupted_run() {
        let live = InventoryManager::new(InventoryConfig::default());
        live.record_trade("a", "mkt", Side::Buy, dec!(10), dec!(0.50));

        // Persist mid-run, restore into a fresh manager.
        let (_, restarted) = persist_and_restore(&live);

        // The next trade lands on both; they must agree.
        live.record_trade("a", "mkt", Side::Sell, dec!(4), dec!(0.55));
        restarted.record_trade("a", "mkt", Side::Sell, dec!(4), dec!(0.55));

        let a = live.position("a").unwrap();
        let b = restarted.position("a").unwrap();
        assert_eq!(a.shares, b.shares);
        assert_eq!(a.avg_entry_price, b.avg_entry_price);
        assert_eq!(a.realized_pnl, b.realized_pnl);
        assert_eq!(live.realized_pnl(), restarted.realized_pnl());
    }

    #[test]
    fn test_rehydrate_after_close_keeps_realized_pnl() {
        let live = InventoryManager::new(InventoryConfig::default());
        // A full round trip that goes flat and gets purged before the
        // snapshot: its P&L must still cross the restart.
        live.record_trade("a", "mkt", Side::Buy, dec!(10), dec!(0.40));
        live.record_trade("a", "mkt", Side::Sell, dec!(10), dec!(0.50));
        live.purge_flat(std::time::Duration::ZERO);
        // A second position still open at snapshot time.
        live.record_trade("b", "mkt2", Side::Buy, dec!(5), dec!(0.30));

        let (state, restarted) = persist_and_restore(&live);
        assert_eq!(state.realized_pnl, dec!(1.00));
        assert_eq!(restarted.realized_pnl(), dec!(1.00));

        // Closing the surviving position accrues on top of the restored
        // total, matching the run that never restarted.
        live.record_trade("b", "mkt2", Side::Sell, dec!(5), dec!(0.36));
        restarted.record_trade("b", "mkt2", Side::Sell, dec!(5), dec!(0.36));
        assert_eq!(live.realized_pnl(), dec!(1.30));
        assert_eq!(restarted.realized_pnl(), dec!(1.30));
        assert_eq!(live.view().realized_pnl, restarted.view().realized_pnl);
    }
}
