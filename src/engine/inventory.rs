//! Inventory manager — positions, P&L, volatility, reservation skew.
//!
//! One mutex serializes trades and mark updates; readers get the
//! last-completed totals from a `watch` broadcast and never touch the lock.
//!
//! Reservation-price model:
//!   skew = gamma* x shares x sigma^2 x min(T/24, 1) x mid
//! Long inventory biases quotes down (incentivize selling out), short biases
//! them up.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_decimal::prelude::{FromPrimitive, Signed, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::messages::{FillEvent, InventoryView};
use super::types::{floor_to_tick, OrderIntent, Side, TimeInForce, FLAT_TOLERANCE, PRICE_TICK};

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InventoryConfig {
    /// Maximum notional per market (USD).
    pub max_position_per_market: Decimal,
    /// Maximum sum of |shares x price| across all positions (USD).
    pub max_gross_exposure: Decimal,
    /// Avellaneda-Stoikov risk aversion (0.1 aggressive .. 0.5 defensive).
    pub gamma_base: f64,
    pub gamma_min: f64,
    pub gamma_max: f64,
    /// Long-run volatility reference for dynamic gamma. Absent at cold
    /// start, in which case gamma stays at base.
    pub baseline_volatility: Option<f64>,
    /// Rolling window for realized volatility.
    pub volatility_window: Duration,
    /// Fallback sigma when the history is too short to estimate.
    pub default_volatility: f64,
    pub price_tick: Decimal,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            max_position_per_market: dec!(5000),
            max_gross_exposure: dec!(50000),
            gamma_base: 0.2,
            gamma_min: 0.05,
            gamma_max: 1.0,
            baseline_volatility: None,
            volatility_window: Duration::from_secs(3600),
            default_volatility: 0.05,
            price_tick: PRICE_TICK,
        }
    }
}

/// Fewer samples than this and volatility is undefined.
const MIN_VOL_SAMPLES: usize = 10;
/// Price-history ring per asset.
const PRICE_RING: usize = 1000;
/// Fill records retained per position for markout bookkeeping.
const FILL_RING: usize = 256;
/// Replayed fills already applied; bounded insertion-order eviction.
const SEEN_FILL_CAP: usize = 50_000;

// ─────────────────────────────────────────────────────────
// Position
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct FillRecord {
    pub ts: Instant,
    pub side: Side,
    pub fill_price: Decimal,
    pub micro_at_fill: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub asset: String,
    pub market: String,
    /// Signed: positive long, negative short.
    pub shares: Decimal,
    /// Share-weighted average of opening fills, quantized to the tick.
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub mark_price: Decimal,
    pub last_update: Instant,
    /// Sub-tick remainder carried between average-entry updates. Stays
    /// below one tick after every trade.
    pub accumulated_dust: Decimal,
    pub fill_count: u64,
    pub total_markout_pnl: Decimal,
    pub markout_samples: u64,
    pub fill_history: VecDeque<FillRecord>,
}

impl Position {
    fn open(asset: &str, market: &str, price: Decimal) -> Self {
        Self {
            asset: asset.to_string(),
            market: market.to_string(),
            shares: Decimal::ZERO,
            avg_entry_price: price,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            mark_price: price,
            last_update: Instant::now(),
            accumulated_dust: Decimal::ZERO,
            fill_count: 0,
            total_markout_pnl: Decimal::ZERO,
            markout_samples: 0,
            fill_history: VecDeque::with_capacity(FILL_RING),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.shares.abs() < FLAT_TOLERANCE
    }

    pub fn notional(&self) -> Decimal {
        (self.shares * self.mark_price).abs()
    }

    pub fn avg_markout_per_fill(&self) -> Option<Decimal> {
        if self.markout_samples == 0 {
            return None;
        }
        Some(self.total_markout_pnl / Decimal::from(self.markout_samples))
    }

    fn update_mark(&mut self, mark: Decimal) {
        self.mark_price = mark;
        self.unrealized_pnl = if self.is_flat() {
            Decimal::ZERO
        } else {
            (mark - self.avg_entry_price) * self.shares
        };
        self.last_update = Instant::now();
    }

    /// Set the average entry to `raw_avg` quantized to the tick, carrying
    /// the remainder in the dust accumulator. Once |dust| reaches a tick the
    /// whole ticks are folded back in, so the cumulative rounding loss never
    /// exceeds one tick regardless of fill count.
    fn set_avg_entry(&mut self, raw_avg: Decimal, tick: Decimal) {
        let quantized = floor_to_tick(raw_avg, tick);
        self.accumulated_dust += raw_avg - quantized;
        let mut avg = quantized;
        if self.accumulated_dust.abs() >= tick {
            let carry = floor_to_tick(self.accumulated_dust, tick);
            avg += carry;
            self.accumulated_dust -= carry;
        }
        self.avg_entry_price = avg;
    }

    /// Apply one trade. Realized P&L moves only on position-reducing size;
    /// the average entry only re-weights on position-increasing size. A flip
    /// through zero resets the entry to the trade price.
    fn apply_trade(&mut self, side: Side, shares: Decimal, price: Decimal, tick: Decimal) {
        let delta = side.sign() * shares;
        let old_shares = self.shares;
        let new_shares = old_shares + delta;

        let increasing = old_shares.is_zero() || (old_shares.signum() == delta.signum());
        if increasing {
            let total_cost = self.avg_entry_price * old_shares.abs() + price * shares;
            if !new_shares.is_zero() {
                self.set_avg_entry(total_cost / new_shares.abs(), tick);
            }
        } else {
            let closed = shares.min(old_shares.abs());
            let pnl_per_share = (price - self.avg_entry_price) * old_shares.signum();
            self.realized_pnl += pnl_per_share * closed;

            let flipped = !new_shares.is_zero() && new_shares.signum() != old_shares.signum();
            if flipped {
                self.avg_entry_price = price;
                self.accumulated_dust = Decimal::ZERO;
            }
        }

        self.shares = new_shares;
        self.fill_count += 1;
        self.last_update = Instant::now();
    }

    fn push_fill(&mut self, record: FillRecord) {
        if self.fill_history.len() == FILL_RING {
            self.fill_history.pop_front();
        }
        self.fill_history.push_back(record);
    }
}

// ─────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────

struct Inner {
    positions: HashMap<String, Position>,
    price_history: HashMap<String, VecDeque<(Instant, f64)>>,
    seen_fills: HashSet<String>,
    seen_order: VecDeque<String>,
    trade_count: u64,
    /// Lifetime realized P&L. Accumulated here on every reducing trade so
    /// it survives positions going flat and being purged.
    realized_total: Decimal,
}

pub struct InventoryManager {
    cfg: InventoryConfig,
    inner: Mutex<Inner>,
    view_tx: watch::Sender<InventoryView>,
}

impl InventoryManager {
    pub fn new(cfg: InventoryConfig) -> Self {
        info!(
            max_per_market = %cfg.max_position_per_market,
            max_gross = %cfg.max_gross_exposure,
            gamma = cfg.gamma_base,
            "inventory manager initialized",
        );
        let (view_tx, _) = watch::channel(InventoryView::default());
        Self {
            cfg,
            inner: Mutex::new(Inner {
                positions: HashMap::new(),
                price_history: HashMap::new(),
                seen_fills: HashSet::new(),
                seen_order: VecDeque::new(),
                trade_count: 0,
                realized_total: Decimal::ZERO,
            }),
            view_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<InventoryView> {
        self.view_tx.subscribe()
    }

    /// Apply a fill from the user channel. Returns false for replays —
    /// applying the same (order_id, trade_id) twice is a no-op.
    pub fn record_fill(&self, fill: &FillEvent, micro_at_fill: Decimal) -> bool {
        let key = format!("{}:{}", fill.order_id, fill.trade_id);
        {
            let mut inner = self.inner.lock();
            if inner.seen_fills.contains(&key) {
                debug!(order_id = %fill.order_id, trade_id = %fill.trade_id, "duplicate fill dropped");
                return false;
            }
            inner.seen_fills.insert(key.clone());
            inner.seen_order.push_back(key);
            while inner.seen_order.len() > SEEN_FILL_CAP {
                if let Some(old) = inner.seen_order.pop_front() {
                    inner.seen_fills.remove(&old);
                }
            }
        }

        self.record_trade(&fill.asset, &fill.market, fill.side, fill.size, fill.price);

        let mut inner = self.inner.lock();
        if let Some(position) = inner.positions.get_mut(&fill.asset) {
            position.push_fill(FillRecord {
                ts: fill.ts,
                side: fill.side,
                fill_price: fill.price,
                micro_at_fill,
                size: fill.size,
            });
        }
        true
    }

    /// Atomic position update. Creates the position on first contact.
    pub fn record_trade(&self, asset: &str, market: &str, side: Side, shares: Decimal, price: Decimal) {
        let tick = self.cfg.price_tick;
        {
            let mut inner = self.inner.lock();
            let (realized_delta, position_shares, avg_entry) = {
                let position = inner
                    .positions
                    .entry(asset.to_string())
                    .or_insert_with(|| Position::open(asset, market, price));
                let realized_before = position.realized_pnl;
                position.apply_trade(side, shares, price, tick);
                position.update_mark(price);
                (
                    position.realized_pnl - realized_before,
                    position.shares,
                    position.avg_entry_price,
                )
            };
            inner.realized_total += realized_delta;
            inner.trade_count += 1;

            if let Some(price_f) = price.to_f64() {
                Self::push_price(&mut inner.price_history, asset, price_f);
            }

            debug!(
                asset = %asset,
                side = side.as_str(),
                %shares,
                %price,
                %position_shares,
                %avg_entry,
                "trade recorded",
            );
        }
        self.broadcast();
    }

    /// Recompute unrealized P&L against fresh mids and extend the price
    /// history used for volatility.
    pub fn update_marks(&self, prices: &HashMap<String, Decimal>) {
        {
            let mut inner = self.inner.lock();
            for (asset, price) in prices {
                if let Some(position) = inner.positions.get_mut(asset) {
                    position.update_mark(*price);
                }
                if let Some(price_f) = price.to_f64() {
                    Self::push_price(&mut inner.price_history, asset, price_f);
                }
            }
        }
        self.broadcast();
    }

    fn push_price(history: &mut HashMap<String, VecDeque<(Instant, f64)>>, asset: &str, price: f64) {
        let ring = history.entry(asset.to_string()).or_default();
        if ring.len() == PRICE_RING {
            ring.pop_front();
        }
        ring.push_back((Instant::now(), price));
    }

    /// Accumulate a markout observation into the position's running stats.
    pub fn record_markout(&self, asset: &str, markout_pnl: Decimal) {
        let mut inner = self.inner.lock();
        if let Some(position) = inner.positions.get_mut(asset) {
            position.total_markout_pnl += markout_pnl;
            position.markout_samples += 1;
        }
    }

    /// Annualized std-dev of log returns over the volatility window.
    /// Undefined below `MIN_VOL_SAMPLES`.
    pub fn volatility(&self, asset: &str) -> Option<f64> {
        let inner = self.inner.lock();
        let ring = inner.price_history.get(asset)?;
        let cutoff = Instant::now().checked_sub(self.cfg.volatility_window);
        let recent: Vec<f64> = ring
            .iter()
            .filter(|(ts, _)| cutoff.map(|c| *ts >= c).unwrap_or(true))
            .map(|(_, p)| *p)
            .filter(|p| *p > 0.0)
            .collect();
        if recent.len() < MIN_VOL_SAMPLES {
            return None;
        }

        let returns: Vec<f64> = recent.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
        if returns.is_empty() {
            return None;
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;

        // Annualize assuming roughly one sample per minute.
        const MINUTES_PER_YEAR: f64 = 365.0 * 24.0 * 60.0;
        Some(variance.sqrt() * MINUTES_PER_YEAR.sqrt())
    }

    pub fn baseline_volatility(&self) -> Option<f64> {
        self.cfg.baseline_volatility
    }

    /// gamma* = gamma_base x (1 + sigma_now / sigma_baseline), clamped.
    /// Falls back to base when either estimate is missing.
    pub fn dynamic_gamma(&self, asset: &str) -> f64 {
        let base = self.cfg.gamma_base;
        let (Some(baseline), Some(current)) = (self.cfg.baseline_volatility, self.volatility(asset))
        else {
            return base;
        };
        if baseline <= 0.0 {
            return base;
        }
        (base * (1.0 + current / baseline)).clamp(self.cfg.gamma_min, self.cfg.gamma_max)
    }

    /// Price offset for the reservation price. Sign follows the inventory.
    pub fn inventory_skew(&self, asset: &str, mid: Decimal, time_to_expiry_hours: f64) -> Decimal {
        let shares = {
            let inner = self.inner.lock();
            match inner.positions.get(asset) {
                Some(p) if !p.is_flat() => p.shares,
                _ => return Decimal::ZERO,
            }
        };

        let sigma = self.volatility(asset).unwrap_or(self.cfg.default_volatility);
        let gamma = self.dynamic_gamma(asset);
        let t = (time_to_expiry_hours / 24.0).min(1.0);
        let shares_f = shares.to_f64().unwrap_or(0.0);
        let mid_f = mid.to_f64().unwrap_or(0.0);

        let skew = gamma * shares_f * sigma * sigma * t * mid_f;
        Decimal::from_f64(skew).unwrap_or(Decimal::ZERO)
    }

    /// Would this delta breach the per-market or gross exposure caps?
    pub fn check_limits(&self, asset: &str, delta_shares: Decimal, price: Decimal) -> (bool, String) {
        let inner = self.inner.lock();
        let current_shares = inner
            .positions
            .get(asset)
            .map(|p| p.shares)
            .unwrap_or(Decimal::ZERO);
        let new_notional = ((current_shares + delta_shares) * price).abs();
        if new_notional > self.cfg.max_position_per_market {
            return (
                false,
                format!(
                    "per-market limit: {new_notional} > {}",
                    self.cfg.max_position_per_market
                ),
            );
        }

        let current_gross: Decimal = inner.positions.values().map(|p| p.notional()).sum();
        let new_gross = current_gross + (delta_shares * price).abs();
        if new_gross > self.cfg.max_gross_exposure {
            return (
                false,
                format!("gross exposure limit: {new_gross} > {}", self.cfg.max_gross_exposure),
            );
        }
        (true, String::new())
    }

    /// Synthetic liquidation intent. Never submits anything.
    pub fn flatten(&self, asset: &str, mark: Decimal) -> Option<OrderIntent> {
        let inner = self.inner.lock();
        let position = inner.positions.get(asset)?;
        if position.is_flat() {
            return None;
        }
        let side = if position.shares > Decimal::ZERO { Side::Sell } else { Side::Buy };
        warn!(asset = %asset, shares = %position.shares, %mark, "flatten intent generated");
        Some(OrderIntent {
            asset: asset.to_string(),
            side,
            size: position.shares.abs(),
            limit_price: mark,
            tif: TimeInForce::Gtc,
            client_nonce: uuid::Uuid::new_v4().to_string(),
        })
    }

    pub fn flatten_all(&self, marks: &HashMap<String, Decimal>) -> Vec<OrderIntent> {
        let assets: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .positions
                .values()
                .filter(|p| !p.is_flat())
                .map(|p| p.asset.clone())
                .collect()
        };
        let intents: Vec<OrderIntent> = assets
            .iter()
            .filter_map(|asset| {
                let mark = marks.get(asset)?;
                self.flatten(asset, *mark)
            })
            .collect();
        warn!(count = intents.len(), "flatten-all intents generated");
        intents
    }

    /// Drop flat positions that have been quiet for the grace window.
    pub fn purge_flat(&self, grace: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner
            .positions
            .retain(|_, p| !(p.is_flat() && now.saturating_duration_since(p.last_update) > grace));
    }

    pub fn position(&self, asset: &str) -> Option<Position> {
        self.inner.lock().positions.get(asset).cloned()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.inner.lock().positions.values().cloned().collect()
    }

    /// Lifetime realized P&L, including positions that have since closed.
    pub fn realized_pnl(&self) -> Decimal {
        self.inner.lock().realized_total
    }

    /// Rehydrate from persisted/exchange state. Replaces any current book;
    /// `realized_pnl` is the persisted lifetime total, which per-position
    /// history cannot reconstruct once closed positions were purged.
    pub fn restore(&self, positions: Vec<Position>, realized_pnl: Decimal) {
        {
            let mut inner = self.inner.lock();
            inner.positions = positions.into_iter().map(|p| (p.asset.clone(), p)).collect();
            inner.realized_total = realized_pnl;
        }
        self.broadcast();
    }

    pub fn view(&self) -> InventoryView {
        *self.view_tx.borrow()
    }

    fn broadcast(&self) {
        let inner = self.inner.lock();
        let mut view = InventoryView::default();
        for position in inner.positions.values() {
            let value = position.shares * position.mark_price;
            view.gross_exposure += value.abs();
            view.net_exposure += value;
            view.position_value += value;
            view.unrealized_pnl += position.unrealized_pnl;
            if !position.is_flat() {
                view.open_positions += 1;
            }
        }
        // Lifetime figure, not a sum over the current map: closed positions
        // keep counting after purge_flat evicts them.
        view.realized_pnl = inner.realized_total;
        // send_replace: the view must update even before anyone subscribes.
        self.view_tx.send_replace(view);
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> InventoryManager {
        InventoryManager::new(InventoryConfig::default())
    }

    fn fill(order: &str, trade: &str, side: Side, size: Decimal, price: Decimal) -> FillEvent {
        FillEvent {
            order_id: order.to_string(),
            trade_id: trade.to_string(),
            asset: "asset-1".to_string(),
            market: "mkt-1".to_string(),
            side,
            price,
            size,
            fee_rate_bps: 0,
            ts: Instant::now(),
        }
    }

    #[test]
    fn test_weighted_average_entry() {
        let inv = manager();
        inv.record_trade("a", "m", Side::Buy, dec!(10), dec!(0.50));
        inv.record_trade("a", "m", Side::Buy, dec!(10), dec!(0.52));
        let p = inv.position("a").unwrap();
        assert_eq!(p.shares, dec!(20));
        // (10*0.50 + 10*0.52) / 20 = 0.51
        assert_eq!(p.avg_entry_price, dec!(0.51));
    }

    #[test]
    fn test_sell_realizes_pnl_only_on_reduction() {
        let inv = manager();
        inv.record_trade("a", "m", Side::Buy, dec!(10), dec!(0.40));
        assert_eq!(inv.position("a").unwrap().realized_pnl, Decimal::ZERO);

        inv.record_trade("a", "m", Side::Sell, dec!(4), dec!(0.50));
        let p = inv.position("a").unwrap();
        assert_eq!(p.shares, dec!(6));
        // (0.50 - 0.40) * 4
        assert_eq!(p.realized_pnl, dec!(0.40));
        // Average entry unchanged by the reducing trade.
        assert_eq!(p.avg_entry_price, dec!(0.40));
    }

    #[test]
    fn test_long_to_short_flip_resets_entry() {
        let inv = manager();
        inv.record_trade("a", "m", Side::Buy, dec!(5), dec!(0.40));
        inv.record_trade("a", "m", Side::Sell, dec!(8), dec!(0.55));
        let p = inv.position("a").unwrap();
        assert_eq!(p.shares, dec!(-3));
        assert_eq!(p.avg_entry_price, dec!(0.55));
        // Only the 5 closed shares realize.
        assert_eq!(p.realized_pnl, dec!(0.75));
    }

    #[test]
    fn test_short_covered_by_buy_realizes() {
        let inv = manager();
        inv.record_trade("a", "m", Side::Sell, dec!(10), dec!(0.60));
        inv.record_trade("a", "m", Side::Buy, dec!(10), dec!(0.55));
        let p = inv.position("a").unwrap();
        assert!(p.is_flat());
        // Short from 0.60 covered at 0.55: (0.55 - 0.60) * -1 * 10
        assert_eq!(p.realized_pnl, dec!(0.50));
    }

    #[test]
    fn test_dust_stays_below_one_tick() {
        let inv = manager();
        // Awkward sizes that never divide evenly on the tick grid.
        let prices = [dec!(0.333), dec!(0.347), dec!(0.351), dec!(0.339), dec!(0.362)];
        for (i, price) in prices.iter().cycle().take(50).enumerate() {
            let size = Decimal::from(i as i64 % 7 + 1) / dec!(3);
            inv.record_trade("a", "m", Side::Buy, size, *price);
            let p = inv.position("a").unwrap();
            assert!(
                p.accumulated_dust.abs() < PRICE_TICK,
                "dust {} escaped the tick bound after fill {}",
                p.accumulated_dust,
                i,
            );
            // Entry always on the tick grid.
            assert_eq!(p.avg_entry_price, floor_to_tick(p.avg_entry_price, PRICE_TICK));
        }
    }

    #[test]
    fn test_duplicate_fill_is_idempotent() {
        let inv = manager();
        let f = fill("ord-1", "trade-1", Side::Buy, dec!(10), dec!(0.50));
        assert!(inv.record_fill(&f, dec!(0.50)));
        let before = inv.position("asset-1").unwrap();

        assert!(!inv.record_fill(&f, dec!(0.50)));
        let after = inv.position("asset-1").unwrap();
        assert_eq!(before.shares, after.shares);
        assert_eq!(before.realized_pnl, after.realized_pnl);
        assert_eq!(before.fill_count, after.fill_count);
    }

    #[test]
    fn test_volatility_undefined_below_min_samples() {
        let inv = manager();
        let mut marks = HashMap::new();
        for i in 0..5 {
            marks.insert("a".to_string(), dec!(0.50) + Decimal::new(i, 3));
            inv.update_marks(&marks);
        }
        assert!(inv.volatility("a").is_none());
    }

    #[test]
    fn test_volatility_defined_with_enough_samples() {
        let inv = manager();
        let mut marks = HashMap::new();
        for i in 0..20 {
            marks.insert("a".to_string(), dec!(0.50) + Decimal::new(i % 4, 3));
            inv.update_marks(&marks);
        }
        assert!(inv.volatility("a").unwrap() > 0.0);
    }

    #[test]
    fn test_dynamic_gamma_without_baseline_is_base() {
        let inv = manager();
        let mut marks = HashMap::new();
        for i in 0..20 {
            marks.insert("a".to_string(), dec!(0.50) + Decimal::new(i % 4, 3));
            inv.update_marks(&marks);
        }
        assert_eq!(inv.dynamic_gamma("a"), 0.2);
    }

    #[test]
    fn test_dynamic_gamma_scales_and_clamps() {
        let cfg = InventoryConfig {
            baseline_volatility: Some(0.01),
            ..InventoryConfig::default()
        };
        let inv = InventoryManager::new(cfg);
        let mut marks = HashMap::new();
        for i in 0..40 {
            // Violent swings: current vol far above baseline → clamp to max.
            let price = if i % 2 == 0 { dec!(0.30) } else { dec!(0.70) };
            marks.insert("a".to_string(), price);
            inv.update_marks(&marks);
        }
        assert_eq!(inv.dynamic_gamma("a"), 1.0);
    }

    #[test]
    fn test_skew_sign_follows_inventory() {
        let inv = manager();
        inv.record_trade("long", "m", Side::Buy, dec!(100), dec!(0.50));
        inv.record_trade("short", "m", Side::Sell, dec!(100), dec!(0.50));
        let long_skew = inv.inventory_skew("long", dec!(0.50), 24.0);
        let short_skew = inv.inventory_skew("short", dec!(0.50), 24.0);
        assert!(long_skew > Decimal::ZERO);
        assert!(short_skew < Decimal::ZERO);
        assert_eq!(inv.inventory_skew("ghost", dec!(0.50), 24.0), Decimal::ZERO);
    }

    #[test]
    fn test_check_limits_per_market() {
        let cfg = InventoryConfig {
            max_position_per_market: dec!(100),
            ..InventoryConfig::default()
        };
        let inv = InventoryManager::new(cfg);
        let (ok, _) = inv.check_limits("a", dec!(150), dec!(0.50));
        assert!(ok); // 75 notional
        let (ok, reason) = inv.check_limits("a", dec!(250), dec!(0.50));
        assert!(!ok);
        assert!(reason.contains("per-market"));
    }

    #[test]
    fn test_check_limits_gross() {
        let cfg = InventoryConfig {
            max_gross_exposure: dec!(100),
            ..InventoryConfig::default()
        };
        let inv = InventoryManager::new(cfg);
        inv.record_trade("a", "m1", Side::Buy, dec!(150), dec!(0.50));
        let (ok, reason) = inv.check_limits("b", dec!(100), dec!(0.50));
        assert!(!ok);
        assert!(reason.contains("gross"));
    }

    #[test]
    fn test_flatten_produces_opposite_intent() {
        let inv = manager();
        inv.record_trade("a", "m", Side::Buy, dec!(10), dec!(0.50));
        let intent = inv.flatten("a", dec!(0.48)).unwrap();
        assert_eq!(intent.side, Side::Sell);
        assert_eq!(intent.size, dec!(10));
        assert_eq!(intent.limit_price, dec!(0.48));
        assert!(inv.flatten("ghost", dec!(0.5)).is_none());
    }

    #[test]
    fn test_purge_flat_removes_quiet_positions() {
        let inv = manager();
        inv.record_trade("a", "m", Side::Buy, dec!(10), dec!(0.50));
        inv.record_trade("a", "m", Side::Sell, dec!(10), dec!(0.50));
        assert!(inv.position("a").unwrap().is_flat());
        inv.purge_flat(Duration::ZERO);
        assert!(inv.position("a").is_none());
    }

    #[test]
    fn test_realized_pnl_survives_close_and_purge() {
        let inv = manager();
        inv.record_trade("a", "m", Side::Buy, dec!(10), dec!(0.40));
        inv.record_trade("a", "m", Side::Sell, dec!(10), dec!(0.50));
        // Round trip banked a dollar.
        assert_eq!(inv.realized_pnl(), dec!(1.00));
        assert_eq!(inv.view().realized_pnl, dec!(1.00));

        inv.purge_flat(Duration::ZERO);
        assert!(inv.position("a").is_none());
        // Evicting the flat position must not erase its history.
        assert_eq!(inv.realized_pnl(), dec!(1.00));

        // A second market adds on top.
        inv.record_trade("b", "m2", Side::Buy, dec!(4), dec!(0.25));
        inv.record_trade("b", "m2", Side::Sell, dec!(4), dec!(0.35));
        assert_eq!(inv.realized_pnl(), dec!(1.40));
    }

    #[test]
    fn test_view_totals() {
        let inv = manager();
        inv.record_trade("a", "m1", Side::Buy, dec!(10), dec!(0.50));
        inv.record_trade("b", "m2", Side::Sell, dec!(4), dec!(0.25));
        let view = inv.view();
        assert_eq!(view.gross_exposure, dec!(6.00));
        assert_eq!(view.net_exposure, dec!(4.00));
        assert_eq!(view.open_positions, 2);
    }
}
