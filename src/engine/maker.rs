//! Market-making engine — continuous quoting around a reservation price.
//!
//! Quote cycle per market, re-evaluated on every book update (subject to a
//! minimum re-quote interval) and synchronously after every fill:
//!
//!   1. stale book -> pull quotes
//!   2. price-jump filter on |micro - mid| / mid
//!   3. binary-sum sanity (YES + NO must price near 1)
//!   4. reservation price r = mid - gamma* x q x sigma^2 x T x mid
//!   5. half-spread = base/2 x adverse x volatility, clamped
//!   6. quotes clamped to [tick, 1 - tick]
//!   7. boundary hard-caps and skew hysteresis
//!   8. toxic-flow cooldown suspends the picked-off side
//!   9. post-only placement, walking one tick away from mid on would-cross
//!
//! Fills cancel the opposite resting quote before anything else touches the
//! book: a racing fill on the other side at stale prices is double exposure.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::cache::MarketStateCache;
use super::inventory::InventoryManager;
use super::messages::{CancelReason, FillEvent, MakerMsg};
use super::orders::OpenOrderTracker;
use super::ratelimit::DualRateLimiter;
use super::risk::RiskController;
use super::types::{clamp_price, floor_to_tick, OrderIntent, Side, TimeInForce};
use crate::exchange::{ExchangeClient, PlaceOutcome, RejectReason};

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MakerConfig {
    pub quote_size: Decimal,
    /// Target full spread before multipliers.
    pub base_spread: Decimal,
    pub min_spread: Decimal,
    pub max_spread: Decimal,
    pub price_tick: Decimal,
    pub staleness: Duration,
    /// Book-driven re-quotes are throttled to this cadence; fills bypass it.
    pub min_requote_interval: Duration,
    /// |micro - mid| / mid above this pauses the market.
    pub jump_threshold: Decimal,
    pub jump_pause: Duration,
    pub binary_sum_tolerance: Decimal,
    /// Above this mid the BUY side is disabled; mirrored below 1 - this.
    pub boundary_high: Decimal,
    pub boundary_low: Decimal,
    /// Replace a resting quote only when it moves at least this many ticks.
    pub hysteresis_ticks: Decimal,
    pub toxic_window: Duration,
    pub toxic_fill_count: usize,
    pub toxic_gamma_multiplier: Decimal,
    pub toxic_cooldown: Duration,
    /// Adverse-selection gate: needs this many fills...
    pub adverse_min_fills: u64,
    /// ...averaging worse than this markout per fill.
    pub adverse_markout_threshold: Decimal,
    pub markout_horizon: Duration,
    pub volatility_mult_cap: f64,
    pub time_to_expiry_hours: f64,
    pub post_only_retries: u32,
}

impl Default for MakerConfig {
    fn default() -> Self {
        Self {
            quote_size: dec!(10),
            base_spread: dec!(0.015),
            min_spread: dec!(0.005),
            max_spread: dec!(0.05),
            price_tick: dec!(0.001),
            staleness: Duration::from_millis(500),
            min_requote_interval: Duration::from_millis(200),
            jump_threshold: dec!(0.005),
            jump_pause: Duration::from_secs(5),
            binary_sum_tolerance: dec!(0.05),
            boundary_high: dec!(0.98),
            boundary_low: dec!(0.02),
            hysteresis_ticks: dec!(5),
            toxic_window: Duration::from_secs(10),
            toxic_fill_count: 3,
            toxic_gamma_multiplier: dec!(1.5),
            toxic_cooldown: Duration::from_secs(300),
            adverse_min_fills: 20,
            adverse_markout_threshold: dec!(-0.005),
            markout_horizon: Duration::from_secs(5),
            volatility_mult_cap: 3.0,
            time_to_expiry_hours: 24.0,
            post_only_retries: 3,
        }
    }
}

/// A market the engine quotes: one traded outcome plus its complement for
/// the binary-sum health check.
#[derive(Debug, Clone)]
pub struct MakerMarket {
    pub market: String,
    pub asset: String,
    pub complement: Option<String>,
}

// ─────────────────────────────────────────────────────────
// Per-market state
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RestingQuote {
    order_id: String,
    price: Decimal,
}

#[derive(Debug)]
struct PendingMarkout {
    asset: String,
    due: Instant,
    fill_price: Decimal,
    signed_size: Decimal,
}

struct MarketState {
    spec: MakerMarket,
    bid: Option<RestingQuote>,
    ask: Option<RestingQuote>,
    last_cycle_at: Option<Instant>,
    paused_until: Option<Instant>,
    toxic_until: Option<Instant>,
    /// Side of ours that keeps getting hit during toxic flow.
    toxic_side: Option<Side>,
    recent_fills: VecDeque<(Instant, Side)>,
}

impl MarketState {
    fn new(spec: MakerMarket) -> Self {
        Self {
            spec,
            bid: None,
            ask: None,
            last_cycle_at: None,
            paused_until: None,
            toxic_until: None,
            toxic_side: None,
            recent_fills: VecDeque::with_capacity(16),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────

pub struct MarketMaker {
    cfg: MakerConfig,
    markets: HashMap<String, MarketState>,
    asset_to_market: HashMap<String, String>,
    cache: Arc<MarketStateCache>,
    inventory: Arc<InventoryManager>,
    risk: Arc<RiskController>,
    client: Arc<dyn ExchangeClient>,
    limiter: Arc<DualRateLimiter>,
    /// Shared registry of resting order IDs, persisted for restart cleanup.
    orders: Arc<OpenOrderTracker>,
    pending_markouts: VecDeque<PendingMarkout>,
}

impl MarketMaker {
    pub fn new(
        cfg: MakerConfig,
        markets: Vec<MakerMarket>,
        cache: Arc<MarketStateCache>,
        inventory: Arc<InventoryManager>,
        risk: Arc<RiskController>,
        client: Arc<dyn ExchangeClient>,
        limiter: Arc<DualRateLimiter>,
        orders: Arc<OpenOrderTracker>,
    ) -> Self {
        info!(
            markets = markets.len(),
            base_spread = %cfg.base_spread,
            size = %cfg.quote_size,
            "market maker initialized",
        );
        let asset_to_market = markets
            .iter()
            .map(|m| (m.asset.clone(), m.market.clone()))
            .collect();
        let markets = markets
            .into_iter()
            .map(|m| (m.market.clone(), MarketState::new(m)))
            .collect();
        Self {
            cfg,
            markets,
            asset_to_market,
            cache,
            inventory,
            risk,
            client,
            limiter,
            orders,
            pending_markouts: VecDeque::new(),
        }
    }

    pub fn subscribed_assets(&self) -> Vec<String> {
        self.markets
            .values()
            .flat_map(|m| {
                std::iter::once(m.spec.asset.clone()).chain(m.spec.complement.clone())
            })
            .collect()
    }

    /// Mailbox loop. Book updates drive quoting; fills are handled
    /// synchronously before any further book processing.
    pub async fn run(mut self, mut mailbox: mpsc::Receiver<MakerMsg>, mut stop_rx: watch::Receiver<bool>) {
        info!("market maker started");
        let mut markout_ticker = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                msg = mailbox.recv() => {
                    match msg {
                        Some(MakerMsg::Fill(fill)) => self.on_fill(fill).await,
                        Some(MakerMsg::BookUpdate { asset }) => {
                            if let Some(market) = self.asset_to_market.get(&asset).cloned() {
                                self.quote_cycle(&market, false).await;
                            }
                        }
                        Some(MakerMsg::CancelAll(reason)) => self.cancel_everything(reason).await,
                        None => break,
                    }
                }
                _ = markout_ticker.tick() => {
                    self.process_due_markouts().await;
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        self.cancel_everything(CancelReason::Shutdown).await;
        info!("market maker stopped");
    }

    // ─────────────────────────────────────────────────
    // Quote cycle
    // ─────────────────────────────────────────────────

    async fn quote_cycle(&mut self, market: &str, forced: bool) {
        let now = Instant::now();

        if !self.risk.can_trade() || self.risk.market_paused(market) {
            self.cancel_market_quotes(market, CancelReason::RiskHalt).await;
            return;
        }

        let Some(state) = self.markets.get(market) else { return };
        if let Some(until) = state.paused_until {
            if now < until {
                return;
            }
        }
        if !forced {
            if let Some(last) = state.last_cycle_at {
                if now.saturating_duration_since(last) < self.cfg.min_requote_interval {
                    return;
                }
            }
        }

        let asset = state.spec.asset.clone();
        let complement = state.spec.complement.clone();

        // 1. Fresh book or no quotes at all.
        let Some(snap) = self.cache.get(&asset) else {
            self.cancel_market_quotes(market, CancelReason::StaleBook).await;
            return;
        };
        if snap.age(now) > self.cfg.staleness || !snap.has_two_sides() {
            self.cancel_market_quotes(market, CancelReason::StaleBook).await;
            return;
        }
        let mid = snap.mid_price;
        let micro = snap.micro_price;
        if mid <= Decimal::ZERO {
            return;
        }

        // 2. Price-jump filter: micro diverging from mid means the book is
        // about to move through us.
        if ((micro - mid) / mid).abs() > self.cfg.jump_threshold {
            warn!(market = %market, %mid, %micro, "price jump detected, pausing quotes");
            self.cancel_market_quotes(market, CancelReason::PriceJump).await;
            if let Some(state) = self.markets.get_mut(market) {
                state.paused_until = Some(now + self.cfg.jump_pause);
            }
            return;
        }

        // 3. Binary-sum sanity: YES + NO far from 1 means one leg is stale.
        if let Some(complement) = &complement {
            if let Some(comp_snap) = self.cache.get(complement) {
                let sum = mid + comp_snap.mid_price;
                if (sum - Decimal::ONE).abs() > self.cfg.binary_sum_tolerance {
                    warn!(market = %market, %sum, "binary sum out of tolerance, skipping market");
                    self.cancel_market_quotes(market, CancelReason::StaleBook).await;
                    return;
                }
            }
        }

        // 8. Toxic-flow detection before pricing so gamma reflects it.
        self.detect_toxic_flow(market, now);
        let Some(state) = self.markets.get(market) else { return };
        let toxic_active = matches!(state.toxic_until, Some(until) if now < until);
        let toxic_side = state.toxic_side;

        // 4. Reservation price.
        let mut skew = self
            .inventory
            .inventory_skew(&asset, mid, self.cfg.time_to_expiry_hours);
        if toxic_active {
            skew *= self.cfg.toxic_gamma_multiplier;
        }
        let reservation = mid - skew;

        // 5. Half-spread with adverse-selection and volatility widening.
        let adverse = self.adverse_multiplier(&asset);
        let vol_mult = self.volatility_multiplier(&asset);
        let half = (self.cfg.base_spread / dec!(2)) * adverse * vol_mult;
        let half = half
            .max(self.cfg.min_spread / dec!(2))
            .min(self.cfg.max_spread / dec!(2));

        // 6. Quotes on the tick grid inside the tradable band.
        let bid_price = clamp_price(
            floor_to_tick(reservation - half, self.cfg.price_tick),
            self.cfg.price_tick,
        );
        let ask_price = clamp_price(
            floor_to_tick(reservation + half, self.cfg.price_tick),
            self.cfg.price_tick,
        );

        // 7. Boundary hard-caps; toxic cooldown suspends the hit side.
        let mut quote_bid = mid <= self.cfg.boundary_high;
        let mut quote_ask = mid >= self.cfg.boundary_low;
        if toxic_active {
            match toxic_side {
                Some(Side::Buy) => quote_bid = false,
                Some(Side::Sell) => quote_ask = false,
                None => {}
            }
        }

        self.sync_side(market, Side::Buy, quote_bid, bid_price, mid).await;
        self.sync_side(market, Side::Sell, quote_ask, ask_price, mid).await;

        if let Some(state) = self.markets.get_mut(market) {
            state.last_cycle_at = Some(now);
        }
    }

    fn adverse_multiplier(&self, asset: &str) -> Decimal {
        let Some(position) = self.inventory.position(asset) else {
            return Decimal::ONE;
        };
        if position.fill_count < self.cfg.adverse_min_fills {
            return Decimal::ONE;
        }
        let Some(avg) = position.avg_markout_per_fill() else {
            return Decimal::ONE;
        };
        if avg >= self.cfg.adverse_markout_threshold {
            return Decimal::ONE;
        }
        // Scale 1.5 -> 2.0 with how far past the threshold the bleed runs.
        let threshold = self.cfg.adverse_markout_threshold;
        let excess = ((threshold - avg) / threshold.abs()).min(Decimal::ONE);
        dec!(1.5) + dec!(0.5) * excess
    }

    fn volatility_multiplier(&self, asset: &str) -> Decimal {
        let Some(baseline) = self.inventory.baseline_volatility() else {
            return Decimal::ONE;
        };
        let Some(current) = self.inventory.volatility(asset) else {
            return Decimal::ONE;
        };
        if baseline <= 0.0 {
            return Decimal::ONE;
        }
        let ratio = (current / baseline).clamp(1.0, self.cfg.volatility_mult_cap);
        Decimal::from_f64(ratio).unwrap_or(Decimal::ONE)
    }

    fn detect_toxic_flow(&mut self, market: &str, now: Instant) {
        let window = self.cfg.toxic_window;
        let needed = self.cfg.toxic_fill_count;
        let cooldown = self.cfg.toxic_cooldown;
        let Some(state) = self.markets.get_mut(market) else { return };

        while let Some((ts, _)) = state.recent_fills.front() {
            if now.saturating_duration_since(*ts) > window {
                state.recent_fills.pop_front();
            } else {
                break;
            }
        }
        if state.recent_fills.len() < needed {
            return;
        }
        let tail: Vec<Side> = state
            .recent_fills
            .iter()
            .rev()
            .take(needed)
            .map(|(_, side)| *side)
            .collect();
        let first = tail[0];
        if tail.iter().all(|s| *s == first) && state.toxic_until.map_or(true, |t| now >= t) {
            warn!(
                market = %market,
                side = first.as_str(),
                cooldown_s = cooldown.as_secs(),
                "toxic flow: consecutive same-side fills, cooling down",
            );
            state.toxic_until = Some(now + cooldown);
            state.toxic_side = Some(first);
        }
    }

    /// Bring one side's resting quote in line with the target price,
    /// honoring hysteresis to avoid book churn.
    async fn sync_side(&mut self, market: &str, side: Side, want: bool, price: Decimal, mid: Decimal) {
        let resting = {
            let Some(state) = self.markets.get(market) else { return };
            match side {
                Side::Buy => state.bid.clone(),
                Side::Sell => state.ask.clone(),
            }
        };

        if !want {
            if resting.is_some() {
                self.cancel_side(market, side, CancelReason::BoundaryCap).await;
            }
            return;
        }

        if let Some(resting) = &resting {
            let drift = (resting.price - price).abs() / self.cfg.price_tick;
            if drift < self.cfg.hysteresis_ticks {
                return;
            }
            self.cancel_side(market, side, CancelReason::Reprice).await;
        }

        // Buy-side exposure is gated; sells reduce inventory.
        if side == Side::Buy {
            let asset = match self.markets.get(market) {
                Some(s) => s.spec.asset.clone(),
                None => return,
            };
            let (ok, reason) = self.risk.allow_new_exposure(self.cfg.quote_size * price);
            if !ok {
                debug!(market = %market, %reason, "bid suppressed");
                return;
            }
            let (ok, reason) = self.inventory.check_limits(&asset, self.cfg.quote_size, price);
            if !ok {
                debug!(market = %market, %reason, "bid suppressed by inventory");
                return;
            }
        }

        self.place_quote(market, side, price, mid).await;
    }

    /// Post-only placement with a bounded price walk away from the mid on
    /// would-cross rejections.
    async fn place_quote(&mut self, market: &str, side: Side, price: Decimal, mid: Decimal) {
        let asset = match self.markets.get(market) {
            Some(s) => s.spec.asset.clone(),
            None => return,
        };
        let step = match side {
            Side::Buy => -self.cfg.price_tick,
            Side::Sell => self.cfg.price_tick,
        };

        let mut attempt_price = price;
        for attempt in 0..=self.cfg.post_only_retries {
            let intent = OrderIntent {
                asset: asset.clone(),
                side,
                size: self.cfg.quote_size,
                limit_price: attempt_price,
                tif: TimeInForce::PostOnly,
                client_nonce: uuid::Uuid::new_v4().to_string(),
            };
            self.limiter.acquire(1.0).await;
            let sent = Instant::now();
            let outcome = self.client.place_order(&intent).await;
            self.risk.record_round_trip(sent.elapsed());

            match outcome {
                Ok(PlaceOutcome::Accepted(order)) => {
                    debug!(
                        market = %market,
                        side = side.as_str(),
                        price = %attempt_price,
                        order_id = %order.order_id,
                        "quote resting",
                    );
                    self.orders.insert(&order.order_id);
                    if let Some(state) = self.markets.get_mut(market) {
                        let quote = RestingQuote { order_id: order.order_id, price: attempt_price };
                        match side {
                            Side::Buy => state.bid = Some(quote),
                            Side::Sell => state.ask = Some(quote),
                        }
                    }
                    return;
                }
                Ok(PlaceOutcome::Rejected { reason: RejectReason::PostOnlyWouldCross }) => {
                    attempt_price = clamp_price(attempt_price + step, self.cfg.price_tick);
                    debug!(
                        market = %market,
                        side = side.as_str(),
                        retry = attempt + 1,
                        walked_to = %attempt_price,
                        %mid,
                        "post-only would cross, walking",
                    );
                }
                Ok(PlaceOutcome::Rejected { reason }) => {
                    warn!(market = %market, side = side.as_str(), ?reason, "quote rejected");
                    return;
                }
                Err(err) => {
                    warn!(market = %market, side = side.as_str(), ?err, "quote placement errored");
                    return;
                }
            }
        }
        warn!(market = %market, side = side.as_str(), "post-only walk exhausted");
    }

    // ─────────────────────────────────────────────────
    // Fills & markout
    // ─────────────────────────────────────────────────

    async fn on_fill(&mut self, fill: FillEvent) {
        let Some(market) = self.asset_to_market.get(&fill.asset).cloned() else {
            return;
        };
        info!(
            market = %market,
            side = fill.side.as_str(),
            size = %fill.size,
            price = %fill.price,
            "maker fill",
        );

        // Opposite quote first: it is priced off a mid that no longer holds.
        self.cancel_side(&market, fill.side.opposite(), CancelReason::OppositeFill).await;

        // Our own slot for the filled side is gone too.
        if let Some(state) = self.markets.get_mut(&market) {
            let own = match fill.side {
                Side::Buy => state.bid.take(),
                Side::Sell => state.ask.take(),
            };
            if let Some(own) = own {
                self.orders.remove(&own.order_id);
            }
            state.recent_fills.push_back((fill.ts, fill.side));
            if state.recent_fills.len() > 32 {
                state.recent_fills.pop_front();
            }
        }

        let micro = self
            .cache
            .get(&fill.asset)
            .map(|s| s.micro_price)
            .unwrap_or(fill.price);
        self.inventory.record_fill(&fill, micro);

        self.pending_markouts.push_back(PendingMarkout {
            asset: fill.asset.clone(),
            due: fill.ts + self.cfg.markout_horizon,
            fill_price: fill.price,
            signed_size: fill.side.sign() * fill.size,
        });

        self.quote_cycle(&market, true).await;
    }

    /// markout = (micro at horizon after the fill - fill price) x signed size.
    async fn process_due_markouts(&mut self) {
        let now = Instant::now();
        while let Some(front) = self.pending_markouts.front() {
            if front.due > now {
                break;
            }
            let Some(entry) = self.pending_markouts.pop_front() else { break };
            let Some(snap) = self.cache.get(&entry.asset) else { continue };
            let markout = (snap.micro_price - entry.fill_price) * entry.signed_size;
            debug!(asset = %entry.asset, %markout, "markout sample");
            self.inventory.record_markout(&entry.asset, markout);
        }
    }

    // ─────────────────────────────────────────────────
    // Cancels
    // ─────────────────────────────────────────────────

    async fn cancel_side(&mut self, market: &str, side: Side, reason: CancelReason) {
        let quote = {
            let Some(state) = self.markets.get_mut(market) else { return };
            match side {
                Side::Buy => state.bid.take(),
                Side::Sell => state.ask.take(),
            }
        };
        if let Some(quote) = quote {
            debug!(market = %market, side = side.as_str(), ?reason, "cancelling quote");
            match self.client.cancel_order(&quote.order_id).await {
                // Remote first; the id leaves the registry only once the
                // exchange confirms, so a failed cancel is retried at the
                // next start-up instead of resting blind.
                Ok(()) => self.orders.remove(&quote.order_id),
                Err(err) => {
                    warn!(order_id = %quote.order_id, ?err, "quote cancel failed, id kept tracked");
                }
            }
        }
    }

    async fn cancel_market_quotes(&mut self, market: &str, reason: CancelReason) {
        self.cancel_side(market, Side::Buy, reason).await;
        self.cancel_side(market, Side::Sell, reason).await;
    }

    async fn cancel_everything(&mut self, reason: CancelReason) {
        warn!(?reason, "cancelling all maker quotes");
        let markets: Vec<String> = self.markets.keys().cloned().collect();
        for market in markets {
            self.cancel_market_quotes(&market, reason).await;
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::inventory::InventoryConfig;
    use crate::engine::messages::InventoryView;
    use crate::engine::risk::RiskConfig;
    use crate::engine::types::{BookLevel, BookSnapshot};
    use crate::exchange::mock::{MockExchange, Scripted};

    struct Harness {
        maker: MarketMaker,
        cache: Arc<MarketStateCache>,
        exchange: Arc<MockExchange>,
        inventory: Arc<InventoryManager>,
        risk: Arc<RiskController>,
        orders: Arc<OpenOrderTracker>,
    }

    fn harness_with(cfg: MakerConfig) -> Harness {
        let cache = Arc::new(MarketStateCache::new());
        let exchange = MockExchange::new();
        let inventory = Arc::new(InventoryManager::new(InventoryConfig::default()));
        let (_, inv_rx) = watch::channel(InventoryView::default());
        let risk = Arc::new(RiskController::new(RiskConfig::default(), inv_rx));
        let limiter = Arc::new(DualRateLimiter::new(1000.0, 1000.0, 1000.0, 1000.0));
        let orders = Arc::new(OpenOrderTracker::default());
        let maker = MarketMaker::new(
            cfg,
            vec![MakerMarket {
                market: "mkt".to_string(),
                asset: "yes".to_string(),
                complement: Some("no".to_string()),
            }],
            cache.clone(),
            inventory.clone(),
            risk.clone(),
            exchange.clone(),
            limiter,
            orders.clone(),
        );
        Harness { maker, cache, exchange, inventory, risk, orders }
    }

    fn harness() -> Harness {
        harness_with(MakerConfig::default())
    }

    fn book(asset: &str, bid: Decimal, ask: Decimal, bid_sz: Decimal, ask_sz: Decimal, seq: u64) -> BookSnapshot {
        BookSnapshot::new(
            asset.to_string(),
            vec![BookLevel { price: bid, size: bid_sz }],
            vec![BookLevel { price: ask, size: ask_sz }],
            seq,
            Instant::now(),
        )
    }

    fn seed_balanced(h: &Harness, seq: u64) {
        h.cache.upsert(book("yes", dec!(0.49), dec!(0.51), dec!(100), dec!(100), seq));
        h.cache.upsert(book("no", dec!(0.49), dec!(0.51), dec!(100), dec!(100), seq));
    }

    fn fill(side: Side, price: Decimal, ts: Instant) -> FillEvent {
        FillEvent {
            order_id: uuid::Uuid::new_v4().to_string(),
            trade_id: uuid::Uuid::new_v4().to_string(),
            asset: "yes".to_string(),
            market: "mkt".to_string(),
            side,
            price,
            size: dec!(5),
            fee_rate_bps: 0,
            ts,
        }
    }

    #[tokio::test]
    async fn test_quotes_both_sides_around_mid() {
        let mut h = harness();
        seed_balanced(&h, 1);
        h.maker.quote_cycle("mkt", true).await;

        let placed = h.exchange.placed.lock().clone();
        assert_eq!(placed.len(), 2);
        let bid = placed.iter().find(|i| i.side == Side::Buy).unwrap();
        let ask = placed.iter().find(|i| i.side == Side::Sell).unwrap();
        // Flat inventory: symmetric around mid 0.50 at half base spread.
        assert_eq!(bid.limit_price, dec!(0.492));
        assert_eq!(ask.limit_price, dec!(0.507));
        assert!(bid.tif == TimeInForce::PostOnly && ask.tif == TimeInForce::PostOnly);

        let state = h.maker.markets.get("mkt").unwrap();
        assert!(state.bid.is_some() && state.ask.is_some());
        // Both resting ids are registered for persistence.
        assert_eq!(h.orders.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_book_pulls_quotes() {
        let mut h = harness();
        seed_balanced(&h, 1);
        h.maker.quote_cycle("mkt", true).await;
        assert!(h.maker.markets.get("mkt").unwrap().bid.is_some());

        let mut stale = book("yes", dec!(0.49), dec!(0.51), dec!(100), dec!(100), 2);
        stale.updated_at = Instant::now() - Duration::from_millis(600);
        h.cache.upsert(stale);

        h.maker.quote_cycle("mkt", true).await;
        let state = h.maker.markets.get("mkt").unwrap();
        assert!(state.bid.is_none() && state.ask.is_none());
        assert_eq!(h.exchange.cancelled.lock().len(), 2);
        // Confirmed cancels leave the registry empty.
        assert!(h.orders.is_empty());
    }

    #[tokio::test]
    async fn test_price_jump_pauses_and_cancels() {
        let mut h = harness();
        seed_balanced(&h, 1);
        h.maker.quote_cycle("mkt", true).await;

        // Heavy ask-side depth drags micro far under mid: jump filter.
        h.cache.upsert(book("yes", dec!(0.49), dec!(0.51), dec!(1), dec!(500), 2));
        h.maker.quote_cycle("mkt", true).await;

        let state = h.maker.markets.get("mkt").unwrap();
        assert!(state.paused_until.is_some());
        assert!(state.bid.is_none() && state.ask.is_none());

        // While paused no new quotes go out.
        let placed_before = h.exchange.placed.lock().len();
        h.maker.quote_cycle("mkt", true).await;
        assert_eq!(h.exchange.placed.lock().len(), placed_before);
    }

    #[tokio::test]
    async fn test_binary_sum_violation_skips_market() {
        let mut h = harness();
        h.cache.upsert(book("yes", dec!(0.49), dec!(0.51), dec!(100), dec!(100), 1));
        // NO trading way off: 0.50 + 0.58 = 1.08.
        h.cache.upsert(book("no", dec!(0.57), dec!(0.59), dec!(100), dec!(100), 1));
        h.maker.quote_cycle("mkt", true).await;
        assert!(h.exchange.placed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_boundary_disables_buy_side_high() {
        let mut h = harness();
        h.cache.upsert(book("yes", dec!(0.985), dec!(0.995), dec!(100), dec!(100), 1));
        h.cache.upsert(book("no", dec!(0.005), dec!(0.015), dec!(100), dec!(100), 1));
        h.maker.quote_cycle("mkt", true).await;

        let placed = h.exchange.placed.lock().clone();
        assert!(placed.iter().all(|i| i.side == Side::Sell));
        assert!(!placed.is_empty());
    }

    #[tokio::test]
    async fn test_boundary_disables_sell_side_low() {
        let mut h = harness();
        h.cache.upsert(book("yes", dec!(0.005), dec!(0.015), dec!(100), dec!(100), 1));
        h.cache.upsert(book("no", dec!(0.985), dec!(0.995), dec!(100), dec!(100), 1));
        h.maker.quote_cycle("mkt", true).await;

        let placed = h.exchange.placed.lock().clone();
        assert!(placed.iter().all(|i| i.side == Side::Buy));
        assert!(!placed.is_empty());
    }

    #[tokio::test]
    async fn test_hysteresis_keeps_resting_quote() {
        let mut h = harness();
        seed_balanced(&h, 1);
        h.maker.quote_cycle("mkt", true).await;
        let placed_before = h.exchange.placed.lock().len();

        // Mid shifts one tick: under the 5-tick hysteresis, no churn.
        h.cache.upsert(book("yes", dec!(0.491), dec!(0.511), dec!(100), dec!(100), 2));
        h.maker.quote_cycle("mkt", true).await;
        assert_eq!(h.exchange.placed.lock().len(), placed_before);
        assert!(h.exchange.cancelled.lock().is_empty());

        // A real move replaces both quotes.
        h.cache.upsert(book("yes", dec!(0.53), dec!(0.55), dec!(100), dec!(100), 3));
        h.maker.quote_cycle("mkt", true).await;
        assert_eq!(h.exchange.placed.lock().len(), placed_before + 2);
        assert_eq!(h.exchange.cancelled.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_fill_cancels_opposite_side_first() {
        let mut h = harness();
        seed_balanced(&h, 1);
        h.maker.quote_cycle("mkt", true).await;
        let state = h.maker.markets.get("mkt").unwrap();
        let bid_id = state.bid.as_ref().unwrap().order_id.clone();
        let ask_id = state.ask.as_ref().unwrap().order_id.clone();

        // Our bid filled: the resting ask must be cancelled immediately.
        h.maker.on_fill(fill(Side::Buy, dec!(0.492), Instant::now())).await;
        assert_eq!(h.exchange.cancelled.lock().first(), Some(&ask_id));

        // Both old ids left the registry: the ask cancelled, the bid
        // filled. Whatever rests now is from the re-quote cycle.
        assert!(!h.orders.contains(&bid_id));
        assert!(!h.orders.contains(&ask_id));

        // Inventory saw the fill.
        let position = h.inventory.position("yes").unwrap();
        assert_eq!(position.shares, dec!(5));
    }

    #[tokio::test]
    async fn test_toxic_flow_suspends_picked_side() {
        let mut h = harness();
        seed_balanced(&h, 1);

        // Three consecutive fills of our asks (we sold) inside the window.
        let now = Instant::now();
        for _ in 0..3 {
            h.maker.on_fill(fill(Side::Sell, dec!(0.507), now)).await;
        }

        let state = h.maker.markets.get("mkt").unwrap();
        assert!(state.toxic_until.is_some());
        assert_eq!(state.toxic_side, Some(Side::Sell));

        // During cooldown only the bid side rests.
        h.exchange.placed.lock().clear();
        h.maker.quote_cycle("mkt", true).await;
        let placed = h.exchange.placed.lock().clone();
        assert!(placed.iter().all(|i| i.side == Side::Buy), "placed: {placed:?}");
    }

    #[tokio::test]
    async fn test_old_fills_outside_window_are_not_toxic() {
        let mut h = harness();
        seed_balanced(&h, 1);
        let old = Instant::now() - Duration::from_secs(20);
        for _ in 0..3 {
            h.maker.on_fill(fill(Side::Sell, dec!(0.507), old)).await;
        }
        h.maker.detect_toxic_flow("mkt", Instant::now());
        assert!(h.maker.markets.get("mkt").unwrap().toxic_until.is_none());
    }

    #[tokio::test]
    async fn test_adverse_multiplier_widens_spread() {
        let mut h = harness();
        seed_balanced(&h, 1);

        // Build a position with enough fills and a bleeding markout record.
        for i in 0..25 {
            let f = FillEvent {
                order_id: format!("o{i}"),
                trade_id: format!("t{i}"),
                asset: "yes".to_string(),
                market: "mkt".to_string(),
                side: Side::Buy,
                price: dec!(0.50),
                size: dec!(1),
                fee_rate_bps: 0,
                ts: Instant::now(),
            };
            h.inventory.record_fill(&f, dec!(0.50));
            h.inventory.record_markout("yes", dec!(-0.01));
        }
        assert_eq!(h.maker.adverse_multiplier("yes"), dec!(2.0));

        h.maker.quote_cycle("mkt", true).await;
        let placed = h.exchange.placed.lock().clone();
        let bid = placed.iter().find(|i| i.side == Side::Buy).unwrap();
        let ask = placed.iter().find(|i| i.side == Side::Sell).unwrap();
        // Base half-spread 0.0075 doubled to 0.015 (before skew).
        assert!(ask.limit_price - bid.limit_price >= dec!(0.028));
    }

    #[tokio::test]
    async fn test_adverse_multiplier_neutral_below_fill_gate() {
        let h = harness();
        for _ in 0..5 {
            h.inventory.record_trade("yes", "mkt", Side::Buy, dec!(1), dec!(0.50));
        }
        h.inventory.record_markout("yes", dec!(-0.05));
        assert_eq!(h.maker.adverse_multiplier("yes"), Decimal::ONE);
    }

    #[tokio::test]
    async fn test_post_only_walk_on_would_cross() {
        let mut h = harness();
        seed_balanced(&h, 1);
        h.exchange.script("yes", Scripted::Reject(RejectReason::PostOnlyWouldCross));

        h.maker.quote_cycle("mkt", true).await;
        let placed = h.exchange.placed.lock().clone();
        let bids: Vec<_> = placed.iter().filter(|i| i.side == Side::Buy).collect();
        // First attempt at 0.492 crossed; retry walked one tick down.
        assert_eq!(bids.len(), 2);
        assert_eq!(bids[0].limit_price, dec!(0.492));
        assert_eq!(bids[1].limit_price, dec!(0.491));
        let state = h.maker.markets.get("mkt").unwrap();
        assert_eq!(state.bid.as_ref().unwrap().price, dec!(0.491));
    }

    #[tokio::test]
    async fn test_markout_accrues_after_horizon() {
        let mut h = harness();
        seed_balanced(&h, 1);
        let ts = Instant::now() - Duration::from_secs(6);
        h.maker.on_fill(fill(Side::Buy, dec!(0.48), ts)).await;

        h.maker.process_due_markouts().await;
        let position = h.inventory.position("yes").unwrap();
        assert_eq!(position.markout_samples, 1);
        // micro 0.50 vs fill 0.48, long 5 shares.
        assert_eq!(position.total_markout_pnl, dec!(0.10));
    }

    #[tokio::test]
    async fn test_risk_halt_cancels_and_blocks_quotes() {
        let mut h = harness();
        seed_balanced(&h, 1);
        h.maker.quote_cycle("mkt", true).await;
        h.risk.trigger_kill_switch("test");

        h.maker.quote_cycle("mkt", true).await;
        let state = h.maker.markets.get("mkt").unwrap();
        assert!(state.bid.is_none() && state.ask.is_none());

        let placed = h.exchange.placed.lock().len();
        h.maker.quote_cycle("mkt", true).await;
        assert_eq!(h.exchange.placed.lock().len(), placed);
    }

    #[tokio::test]
    async fn test_requote_interval_throttles_book_updates() {
        let mut h = harness();
        seed_balanced(&h, 1);
        h.maker.quote_cycle("mkt", true).await;
        let placed = h.exchange.placed.lock().len();

        // An immediate unforced cycle is throttled even with a big move.
        h.cache.upsert(book("yes", dec!(0.60), dec!(0.62), dec!(100), dec!(100), 2));
        h.cache.upsert(book("no", dec!(0.37), dec!(0.39), dec!(100), dec!(100), 2));
        h.maker.quote_cycle("mkt", false).await;
        assert_eq!(h.exchange.placed.lock().len(), placed);
    }
}
