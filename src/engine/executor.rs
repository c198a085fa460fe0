//! Atomic basket executor — all-or-nothing execution of an arbitrage
//! opportunity across every outcome of one market.
//!
//! State machine:
//!   PRE_FLIGHT -> CONCURRENT_PLACEMENT -> FILL_MONITORING
//!     -> FILL_COMPLETION | ABORT
//!
//! Any pre-flight failure is terminal with zero orders placed. A mixed
//! placement round (some legs filled, some not) aborts: pending legs are
//! cancelled, filled legs are reversed at the best bid smallest-notional
//! first, and the result records the filled legs for operator audit.
//!
//! The executor never writes inventory. Fills land there exclusively via
//! the authenticated user channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use super::cache::MarketStateCache;
use super::messages::RiskEvent;
use super::orders::OpenOrderTracker;
use super::ratelimit::DualRateLimiter;
use super::risk::RiskController;
use super::types::{
    floor_to_tick, MarketType, Opportunity, OrderIntent, OrderState, Side, TimeInForce, SHARE_TICK,
};
use crate::engine::inventory::InventoryManager;
use crate::exchange::{ExchangeClient, PlaceOutcome};

// ─────────────────────────────────────────────────────────
// Configuration & result types
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-leg ask drift tolerated between sighting and pre-flight.
    pub max_slippage: Decimal,
    /// Residual depth required at pre-flight, per leg: size x this.
    pub depth_buffer: Decimal,
    /// Leg limit prices must still sum below `1 - fee_buffer`.
    pub fee_buffer: Decimal,
    pub staleness: Duration,
    /// Hard deadline for the whole placement round.
    pub placement_deadline: Duration,
    /// Consecutive failed baskets before the strategy cools down.
    pub max_consecutive_failures: u32,
    pub failure_cooldown: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_slippage: dec!(0.005),
            depth_buffer: dec!(1.2),
            fee_buffer: dec!(0.008),
            staleness: Duration::from_millis(500),
            placement_deadline: Duration::from_millis(2000),
            max_consecutive_failures: 3,
            failure_cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    PreFlight,
    ConcurrentPlacement,
    FillMonitoring,
    FillCompletion,
    Abort,
}

#[derive(Debug, Clone)]
pub struct LegResult {
    pub asset: String,
    pub name: String,
    pub intent: OrderIntent,
    pub order_id: Option<String>,
    pub state: OrderState,
    pub filled: Decimal,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub phase: ExecutionPhase,
    pub market: String,
    pub legs: Vec<LegResult>,
    /// Assets of legs that ended up filled while the basket aborted.
    pub partial_fills: Vec<String>,
    pub total_cost: Decimal,
    /// Shares the reversal pass could not unload at the bid.
    pub unreversed_shares: Decimal,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    fn failed(market: &str, phase: ExecutionPhase, error: String, started: Instant) -> Self {
        Self {
            success: false,
            phase,
            market: market.to_string(),
            legs: Vec::new(),
            partial_fills: Vec::new(),
            total_cost: Decimal::ZERO,
            unreversed_shares: Decimal::ZERO,
            error: Some(error),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Executor
// ─────────────────────────────────────────────────────────

pub struct BasketExecutor {
    cfg: ExecutorConfig,
    cache: Arc<MarketStateCache>,
    client: Arc<dyn ExchangeClient>,
    limiter: Arc<DualRateLimiter>,
    risk: Arc<RiskController>,
    inventory: Arc<InventoryManager>,
    /// Accepted leg ids live here until they go terminal, so a crash
    /// mid-basket leaves them in the persisted outstanding set.
    orders: Arc<OpenOrderTracker>,
    risk_tx: mpsc::Sender<RiskEvent>,
}

impl BasketExecutor {
    pub fn new(
        cfg: ExecutorConfig,
        cache: Arc<MarketStateCache>,
        client: Arc<dyn ExchangeClient>,
        limiter: Arc<DualRateLimiter>,
        risk: Arc<RiskController>,
        inventory: Arc<InventoryManager>,
        orders: Arc<OpenOrderTracker>,
        risk_tx: mpsc::Sender<RiskEvent>,
    ) -> Self {
        Self { cfg, cache, client, limiter, risk, inventory, orders, risk_tx }
    }

    /// Execute one opportunity to a terminal state.
    pub async fn execute(&self, opp: &Opportunity, target_shares: Option<Decimal>) -> ExecutionResult {
        let started = Instant::now();
        let market = opp.market.clone();

        let size = floor_to_tick(
            target_shares.map_or(opp.max_shares, |t| t.min(opp.max_shares)),
            SHARE_TICK,
        );

        // ── PRE_FLIGHT ──
        if let Err(reason) = self.pre_flight(opp, size) {
            warn!(market = %market, %reason, "pre-flight failure, no orders placed");
            return ExecutionResult::failed(&market, ExecutionPhase::PreFlight, reason, started);
        }

        // ── CONCURRENT_PLACEMENT ──
        info!(
            market = %market,
            legs = opp.outcomes.len(),
            %size,
            sum = %opp.sum_prices,
            "placing basket",
        );
        let mut legs = self.place_all_legs(opp, size).await;

        // ── FILL_MONITORING: cancel anything non-terminal at the deadline
        // and classify it unfilled. Terminal legs release their tracked
        // ids; an unconfirmed cancel keeps its id for restart cleanup. ──
        for leg in legs.iter_mut() {
            if !leg.state.is_terminal() {
                if let Some(order_id) = &leg.order_id {
                    match self.client.cancel_order(order_id).await {
                        Ok(()) => self.orders.remove(order_id),
                        Err(err) => {
                            warn!(order_id = %order_id, ?err, "cancel of non-terminal leg failed, id kept tracked");
                        }
                    }
                }
                leg.state = OrderState::Cancelled;
            } else if let Some(order_id) = &leg.order_id {
                self.orders.remove(order_id);
            }
        }

        let filled: Vec<usize> = (0..legs.len()).filter(|&i| legs[i].filled > Decimal::ZERO).collect();
        let complete = legs.iter().all(|l| l.state == OrderState::Filled && l.filled >= l.intent.size);

        if complete {
            let total_cost: Decimal = legs.iter().map(|l| l.filled * l.intent.limit_price).sum();
            info!(
                market = %market,
                %total_cost,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "basket complete",
            );
            return ExecutionResult {
                success: true,
                phase: ExecutionPhase::FillCompletion,
                market,
                legs,
                partial_fills: Vec::new(),
                total_cost,
                unreversed_shares: Decimal::ZERO,
                error: None,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
        }

        if filled.is_empty() {
            // Clean failure: nothing filled, no positions to unwind.
            return ExecutionResult {
                success: false,
                phase: ExecutionPhase::ConcurrentPlacement,
                market,
                legs,
                partial_fills: Vec::new(),
                total_cost: Decimal::ZERO,
                unreversed_shares: Decimal::ZERO,
                error: Some("no leg filled".to_string()),
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
        }

        // ── ABORT ──
        self.abort(market, legs, started).await
    }

    fn pre_flight(&self, opp: &Opportunity, size: Decimal) -> Result<(), String> {
        let now = Instant::now();
        if size <= Decimal::ZERO {
            return Err("zero basket size".to_string());
        }
        if opp.is_stale(now) {
            return Err(format!("opportunity expired: {}ms old", opp.age_ms(now)));
        }

        let notional: Decimal = opp.outcomes.iter().map(|o| o.ask_price * size).sum();
        let (allowed, reason) = self.risk.allow_new_exposure(notional);
        if !allowed {
            return Err(reason);
        }

        let mut sum_asks = Decimal::ZERO;
        for outcome in &opp.outcomes {
            let snap = self
                .cache
                .get(&outcome.asset)
                .ok_or_else(|| format!("no book for {}", outcome.asset))?;
            if snap.age(now) > self.cfg.staleness {
                return Err(format!("stale book for {}", outcome.asset));
            }
            let ceiling = outcome.ask_price * (Decimal::ONE + self.cfg.max_slippage);
            if snap.best_ask > ceiling {
                return Err(format!(
                    "ask slipped on {}: {} > {ceiling}",
                    outcome.asset, snap.best_ask
                ));
            }
            if snap.ask_size < size * self.cfg.depth_buffer {
                return Err(format!(
                    "depth decayed on {}: {} < {}",
                    outcome.asset,
                    snap.ask_size,
                    size * self.cfg.depth_buffer
                ));
            }
            let (ok, limit_reason) = self.inventory.check_limits(&outcome.asset, size, outcome.ask_price);
            if !ok {
                return Err(limit_reason);
            }
            sum_asks += outcome.ask_price;
        }

        let n = Decimal::from(opp.outcomes.len() as u64);
        let normalized = match opp.market_type {
            MarketType::Binary | MarketType::Multi => sum_asks,
            MarketType::NegRisk => sum_asks - (n - dec!(2)),
        };
        let threshold = Decimal::ONE - self.cfg.fee_buffer;
        if normalized >= threshold {
            return Err(format!("edge gone: sum {normalized} >= {threshold}"));
        }
        Ok(())
    }

    async fn place_all_legs(&self, opp: &Opportunity, size: Decimal) -> Vec<LegResult> {
        let placements = opp.outcomes.iter().map(|outcome| {
            let intent = OrderIntent {
                asset: outcome.asset.clone(),
                side: Side::Buy,
                size,
                limit_price: outcome.ask_price,
                tif: TimeInForce::Fok,
                client_nonce: uuid::Uuid::new_v4().to_string(),
            };
            let name = outcome.name.clone();
            async move {
                self.limiter.acquire(1.0).await;
                let sent = Instant::now();
                let outcome_result =
                    tokio::time::timeout(self.cfg.placement_deadline, self.client.place_order(&intent))
                        .await;
                self.risk.record_round_trip(sent.elapsed());

                let (order_id, state, filled) = match outcome_result {
                    Ok(Ok(PlaceOutcome::Accepted(order))) => {
                        self.orders.insert(&order.order_id);
                        (Some(order.order_id), order.state, order.filled_size)
                    }
                    Ok(Ok(PlaceOutcome::Rejected { reason })) => {
                        warn!(asset = %intent.asset, ?reason, "leg rejected");
                        (None, OrderState::Rejected, Decimal::ZERO)
                    }
                    Ok(Err(err)) => {
                        warn!(asset = %intent.asset, ?err, "leg placement errored");
                        (None, OrderState::Rejected, Decimal::ZERO)
                    }
                    Err(_) => {
                        warn!(asset = %intent.asset, "leg placement timed out");
                        (None, OrderState::Expired, Decimal::ZERO)
                    }
                };
                LegResult { asset: intent.asset.clone(), name, intent, order_id, state, filled }
            }
        });
        join_all(placements).await
    }

    /// Unwind filled legs at the current best bid, smallest notional first
    /// so gross exposure frees up fastest for a retry.
    async fn abort(&self, market: String, legs: Vec<LegResult>, started: Instant) -> ExecutionResult {
        let partial_fills: Vec<String> = legs
            .iter()
            .filter(|l| l.filled > Decimal::ZERO)
            .map(|l| l.asset.clone())
            .collect();
        error!(
            market = %market,
            filled_legs = ?partial_fills,
            "ATOMIC ABORT — reversing filled legs",
        );

        let mut to_reverse: Vec<&LegResult> =
            legs.iter().filter(|l| l.filled > Decimal::ZERO).collect();
        to_reverse.sort_by_key(|l| l.filled * l.intent.limit_price);

        let mut unreversed = Decimal::ZERO;
        for leg in to_reverse {
            unreversed += self.reverse_leg(leg).await;
        }

        let event = RiskEvent::PartialExecution {
            market: market.clone(),
            filled_legs: partial_fills.clone(),
            unreversed_shares: unreversed,
        };
        if self.risk_tx.send(event).await.is_err() {
            // Monitor loop gone (shutdown); escalate directly.
            self.risk.trigger_kill_switch("partial atomic execution");
        }

        let total_cost: Decimal = legs.iter().map(|l| l.filled * l.intent.limit_price).sum();
        ExecutionResult {
            success: false,
            phase: ExecutionPhase::Abort,
            market,
            legs,
            partial_fills,
            total_cost,
            unreversed_shares: unreversed,
            error: Some("partial execution reversed".to_string()),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Returns the share count that could not be reversed.
    async fn reverse_leg(&self, leg: &LegResult) -> Decimal {
        let Some(snap) = self.cache.get(&leg.asset) else {
            error!(asset = %leg.asset, "no book to reverse against");
            return leg.filled;
        };
        if snap.best_bid <= Decimal::ZERO || snap.bid_size <= Decimal::ZERO {
            error!(asset = %leg.asset, "no bid depth to reverse against");
            return leg.filled;
        }

        // Bounded loss: sell what the bid shows, never price below it.
        let sellable = floor_to_tick(leg.filled.min(snap.bid_size), SHARE_TICK);
        if sellable <= Decimal::ZERO {
            return leg.filled;
        }
        let intent = OrderIntent {
            asset: leg.asset.clone(),
            side: Side::Sell,
            size: sellable,
            limit_price: snap.best_bid,
            tif: TimeInForce::Fok,
            client_nonce: uuid::Uuid::new_v4().to_string(),
        };

        self.limiter.acquire(1.0).await;
        match self.client.place_order(&intent).await {
            Ok(PlaceOutcome::Accepted(order)) if order.filled_size > Decimal::ZERO => {
                warn!(
                    asset = %leg.asset,
                    reversed = %order.filled_size,
                    bid = %snap.best_bid,
                    "leg reversed at bid",
                );
                leg.filled - order.filled_size
            }
            other => {
                error!(asset = %leg.asset, ?other, "reversal order did not fill");
                leg.filled
            }
        }
    }

    /// Serial basket loop: one opportunity at a time, never starting a new
    /// basket before the previous reaches a terminal state.
    pub async fn run(self, mut opp_rx: mpsc::Receiver<Opportunity>, mut stop_rx: watch::Receiver<bool>) {
        info!("basket executor started");
        let mut consecutive_failures = 0u32;
        loop {
            tokio::select! {
                opp = opp_rx.recv() => {
                    let Some(opp) = opp else { break };
                    if opp.is_stale(Instant::now()) {
                        continue;
                    }
                    let result = self.execute(&opp, None).await;
                    if result.success {
                        consecutive_failures = 0;
                    } else {
                        consecutive_failures += 1;
                        if consecutive_failures >= self.cfg.max_consecutive_failures {
                            warn!(
                                failures = consecutive_failures,
                                secs = self.cfg.failure_cooldown.as_secs(),
                                "consecutive basket failures, cooling down",
                            );
                            tokio::time::sleep(self.cfg.failure_cooldown).await;
                            consecutive_failures = 0;
                        }
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("basket executor stopped");
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
