//! Risk controller — drawdown, limits, kill switch, circuit breaker.
//!
//! Trading state escalates monotonically; the only downgrade is the
//! circuit-breaker timer expiring back to ACTIVE. KILL_SWITCH is terminal
//! and requires operator intervention.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use super::messages::{InventoryView, RiskEvent};
use super::types::EquitySnapshot;

// ─────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingState {
    Active,
    Paused,
    CircuitBreaker,
    KillSwitch,
    Liquidation,
}

impl TradingState {
    fn severity(&self) -> u8 {
        match self {
            TradingState::Active => 0,
            TradingState::Paused => 1,
            TradingState::CircuitBreaker => 2,
            TradingState::KillSwitch => 3,
            TradingState::Liquidation => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradingState::Active => "ACTIVE",
            TradingState::Paused => "PAUSED",
            TradingState::CircuitBreaker => "CIRCUIT_BREAKER",
            TradingState::KillSwitch => "KILL_SWITCH",
            TradingState::Liquidation => "LIQUIDATION",
        }
    }
}

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub initial_capital: Decimal,
    /// Drawdown from peak that trips the kill switch.
    pub max_drawdown_pct: Decimal,
    /// Global notional cap across all positions.
    pub max_total_position: Decimal,
    /// Spread wider than this many ticks is abnormal.
    pub max_spread_ticks: Decimal,
    pub price_tick: Decimal,
    pub heartbeat_timeout: Duration,
    pub latency_kill_ms: u64,
    /// Consecutive breaches before the latency breaker trips.
    pub latency_breach_count: u32,
    pub circuit_breaker_duration: Duration,
    /// Rolling window of equity snapshots retained for reporting.
    pub equity_window: Duration,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            initial_capital: dec!(1000),
            max_drawdown_pct: dec!(0.05),
            max_total_position: dec!(50000),
            max_spread_ticks: dec!(50),
            price_tick: dec!(0.001),
            heartbeat_timeout: Duration::from_secs(30),
            latency_kill_ms: 500,
            latency_breach_count: 3,
            circuit_breaker_duration: Duration::from_secs(60),
            equity_window: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskStatus {
    pub state: TradingState,
    pub current_equity: Decimal,
    pub peak_equity: Decimal,
    pub drawdown_pct: Decimal,
    pub gross_exposure: Decimal,
    pub circuit_breaker_count: u32,
    pub paused_markets: usize,
}

// ─────────────────────────────────────────────────────────
// Controller
// ─────────────────────────────────────────────────────────

type CancelHandler = Box<dyn Fn() + Send + Sync>;

struct Inner {
    state: TradingState,
    peak_equity: Decimal,
    current_equity: Decimal,
    equity_history: VecDeque<EquitySnapshot>,
    heartbeats: HashMap<String, Instant>,
    breaker_count: u32,
    breaker_reset_at: Option<Instant>,
    latency_breaches: u32,
    /// Markets paused by a scoped circuit breaker, with expiry.
    paused_markets: HashMap<String, Instant>,
}

pub struct RiskController {
    cfg: RiskConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<TradingState>,
    inv_rx: watch::Receiver<InventoryView>,
    cancel_handlers: Mutex<Vec<(String, CancelHandler)>>,
}

impl RiskController {
    pub fn new(cfg: RiskConfig, inv_rx: watch::Receiver<InventoryView>) -> Self {
        info!(
            capital = %cfg.initial_capital,
            max_drawdown = %cfg.max_drawdown_pct,
            heartbeat_timeout_s = cfg.heartbeat_timeout.as_secs(),
            "risk controller initialized",
        );
        let (state_tx, _) = watch::channel(TradingState::Active);
        Self {
            inner: Mutex::new(Inner {
                state: TradingState::Active,
                peak_equity: cfg.initial_capital,
                current_equity: cfg.initial_capital,
                equity_history: VecDeque::new(),
                heartbeats: HashMap::new(),
                breaker_count: 0,
                breaker_reset_at: None,
                latency_breaches: 0,
                paused_markets: HashMap::new(),
            }),
            cfg,
            state_tx,
            inv_rx,
            cancel_handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> TradingState {
        self.inner.lock().state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TradingState> {
        self.state_tx.subscribe()
    }

    pub fn can_trade(&self) -> bool {
        self.state() == TradingState::Active
    }

    pub fn market_paused(&self, market: &str) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if let Some(until) = inner.paused_markets.get(market) {
            if now < *until {
                return true;
            }
            inner.paused_markets.remove(market);
        }
        false
    }

    /// Pause one market until its next healthy snapshot window.
    pub fn pause_market(&self, market: &str, duration: Duration) {
        warn!(market = %market, secs = duration.as_secs(), "market paused");
        self.inner
            .lock()
            .paused_markets
            .insert(market.to_string(), Instant::now() + duration);
    }

    /// Gate for new exposure: global state plus the total-notional cap.
    /// Per-market caps are enforced by the inventory manager.
    pub fn allow_new_exposure(&self, notional: Decimal) -> (bool, String) {
        let state = self.state();
        if state != TradingState::Active {
            return (false, format!("trading halted: {}", state.as_str()));
        }
        let gross = self.inv_rx.borrow().gross_exposure;
        if gross + notional > self.cfg.max_total_position {
            return (
                false,
                format!(
                    "global exposure limit: {} + {notional} > {}",
                    gross, self.cfg.max_total_position
                ),
            );
        }
        (true, String::new())
    }

    // ─────────────────────────────────────────────────
    // Equity & drawdown
    // ─────────────────────────────────────────────────

    /// Fold a fresh cash figure with the inventory view into an equity
    /// snapshot, advance the peak, and enforce the drawdown limit.
    pub fn update_equity(&self, cash: Decimal) -> EquitySnapshot {
        let view = *self.inv_rx.borrow();
        let now = Instant::now();
        let snapshot = EquitySnapshot {
            at: now,
            cash,
            position_value: view.position_value,
            unrealized_pnl: view.unrealized_pnl,
            realized_pnl: view.realized_pnl,
            total_equity: cash + view.position_value,
        };

        let trip = {
            let mut inner = self.inner.lock();
            inner.current_equity = snapshot.total_equity;
            if snapshot.total_equity > inner.peak_equity {
                inner.peak_equity = snapshot.total_equity;
            }
            inner.equity_history.push_back(snapshot);
            let cutoff = now.checked_sub(self.cfg.equity_window);
            while let Some(front) = inner.equity_history.front() {
                match cutoff {
                    Some(c) if front.at < c => {
                        inner.equity_history.pop_front();
                    }
                    _ => break,
                }
            }

            let peak = inner.peak_equity;
            peak > Decimal::ZERO
                && (peak - snapshot.total_equity) / peak >= self.cfg.max_drawdown_pct
        };

        if trip {
            let inner = self.inner.lock();
            let peak = inner.peak_equity;
            drop(inner);
            self.trigger_kill_switch(&format!(
                "drawdown: peak {peak} -> equity {}",
                snapshot.total_equity
            ));
        }
        snapshot
    }

    // ─────────────────────────────────────────────────
    // Connection health
    // ─────────────────────────────────────────────────

    pub fn record_heartbeat(&self, feed: &str) {
        self.inner.lock().heartbeats.insert(feed.to_string(), Instant::now());
    }

    /// Any feed silent past the timeout kills trading: quoting without
    /// market data is blind.
    pub fn check_connection_health(&self) {
        let silent: Vec<String> = {
            let inner = self.inner.lock();
            let now = Instant::now();
            inner
                .heartbeats
                .iter()
                .filter(|(_, last)| now.saturating_duration_since(**last) > self.cfg.heartbeat_timeout)
                .map(|(feed, _)| feed.clone())
                .collect()
        };
        if !silent.is_empty() {
            self.trigger_kill_switch(&format!("feed silent: {}", silent.join(",")));
        }
    }

    // ─────────────────────────────────────────────────
    // Spread sanity & latency
    // ─────────────────────────────────────────────────

    pub fn check_spread_sanity(&self, market: &str, bid: Decimal, ask: Decimal) -> (bool, String) {
        if bid <= Decimal::ZERO || ask <= Decimal::ZERO {
            let reason = format!("invalid prices: bid {bid} ask {ask}");
            self.pause_market(market, self.cfg.circuit_breaker_duration);
            return (false, reason);
        }
        if bid >= ask {
            let reason = format!("crossed book: bid {bid} >= ask {ask}");
            self.pause_market(market, self.cfg.circuit_breaker_duration);
            return (false, reason);
        }
        let spread_ticks = (ask - bid) / self.cfg.price_tick;
        if spread_ticks > self.cfg.max_spread_ticks {
            let reason = format!(
                "abnormal spread: {spread_ticks} ticks > {}",
                self.cfg.max_spread_ticks
            );
            self.pause_market(market, self.cfg.circuit_breaker_duration);
            return (false, reason);
        }
        (true, String::new())
    }

    /// Track order round-trips; a sustained run of breaches trips the
    /// global circuit breaker.
    pub fn record_round_trip(&self, rtt: Duration) {
        let trip = {
            let mut inner = self.inner.lock();
            if rtt.as_millis() as u64 > self.cfg.latency_kill_ms {
                inner.latency_breaches += 1;
                inner.latency_breaches >= self.cfg.latency_breach_count
            } else {
                inner.latency_breaches = 0;
                false
            }
        };
        if trip {
            self.trigger_circuit_breaker(&format!("sustained latency > {}ms", self.cfg.latency_kill_ms));
        }
    }

    // ─────────────────────────────────────────────────
    // Escalation
    // ─────────────────────────────────────────────────

    fn escalate(&self, next: TradingState) -> bool {
        let mut inner = self.inner.lock();
        if next.severity() <= inner.state.severity() {
            return false;
        }
        inner.state = next;
        drop(inner);
        self.state_tx.send_replace(next);
        true
    }

    pub fn trigger_kill_switch(&self, reason: &str) {
        if !self.escalate(TradingState::KillSwitch) {
            return;
        }
        error!(reason = %reason, "KILL SWITCH — cancelling all orders, trading halted");
        self.fire_cancel_handlers();
    }

    pub fn trigger_circuit_breaker(&self, reason: &str) {
        if !self.escalate(TradingState::CircuitBreaker) {
            return;
        }
        let mut inner = self.inner.lock();
        inner.breaker_count += 1;
        inner.breaker_reset_at = Some(Instant::now() + self.cfg.circuit_breaker_duration);
        let count = inner.breaker_count;
        drop(inner);
        warn!(
            reason = %reason,
            count,
            secs = self.cfg.circuit_breaker_duration.as_secs(),
            "circuit breaker tripped",
        );
        self.fire_cancel_handlers();
    }

    /// The one permitted downgrade: CIRCUIT_BREAKER back to ACTIVE once the
    /// timer elapses.
    pub fn maybe_reset_circuit_breaker(&self) {
        let reset = {
            let mut inner = self.inner.lock();
            match (inner.state, inner.breaker_reset_at) {
                (TradingState::CircuitBreaker, Some(at)) if Instant::now() >= at => {
                    inner.state = TradingState::Active;
                    inner.breaker_reset_at = None;
                    inner.latency_breaches = 0;
                    true
                }
                _ => false,
            }
        };
        if reset {
            info!("circuit breaker reset, trading active");
            self.state_tx.send_replace(TradingState::Active);
        }
    }

    /// Rehydration: the persisted peak survives restarts so a crash cannot
    /// reset the drawdown reference.
    pub fn restore_peak_equity(&self, peak: Decimal) {
        let mut inner = self.inner.lock();
        if peak > inner.peak_equity {
            inner.peak_equity = peak;
        }
    }

    pub fn register_cancel_handler<F>(&self, id: &str, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut handlers = self.cancel_handlers.lock();
        handlers.retain(|(existing, _)| existing != id);
        handlers.push((id.to_string(), Box::new(handler)));
    }

    fn fire_cancel_handlers(&self) {
        for (id, handler) in self.cancel_handlers.lock().iter() {
            warn!(handler = %id, "invoking cancel-all handler");
            handler();
        }
    }

    // ─────────────────────────────────────────────────
    // Events & monitoring
    // ─────────────────────────────────────────────────

    pub fn handle_event(&self, event: RiskEvent) {
        match event {
            RiskEvent::PartialExecution { market, filled_legs, unreversed_shares } => {
                error!(
                    market = %market,
                    legs = ?filled_legs,
                    %unreversed_shares,
                    "partial atomic execution — operator audit required",
                );
                self.trigger_kill_switch("partial atomic execution");
            }
            RiskEvent::AuthFailure { detail } => {
                self.trigger_kill_switch(&format!("auth failure: {detail}"));
            }
            RiskEvent::ProtocolInvariant { market, sum } => {
                warn!(market = %market, %sum, "binary sum out of tolerance");
                self.pause_market(&market, self.cfg.circuit_breaker_duration);
            }
            RiskEvent::LatencyBreach { rtt_ms } => {
                self.record_round_trip(Duration::from_millis(rtt_ms));
            }
        }
    }

    pub fn status(&self) -> RiskStatus {
        let inner = self.inner.lock();
        let drawdown = if inner.peak_equity > Decimal::ZERO {
            (inner.peak_equity - inner.current_equity) / inner.peak_equity
        } else {
            Decimal::ZERO
        };
        RiskStatus {
            state: inner.state,
            current_equity: inner.current_equity,
            peak_equity: inner.peak_equity,
            drawdown_pct: drawdown,
            gross_exposure: self.inv_rx.borrow().gross_exposure,
            circuit_breaker_count: inner.breaker_count,
            paused_markets: inner.paused_markets.len(),
        }
    }

    /// Monitor loop: breaker reset and connection health on a 1s cadence,
    /// critical events as they arrive.
    pub async fn run(
        self: std::sync::Arc<Self>,
        mut event_rx: mpsc::Receiver<RiskEvent>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        info!("risk monitor started");
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.maybe_reset_circuit_breaker();
                    self.check_connection_health();
                }
                event = event_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => break,
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("risk monitor stopped");
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn controller(cfg: RiskConfig) -> (RiskController, watch::Sender<InventoryView>) {
        let (inv_tx, inv_rx) = watch::channel(InventoryView::default());
        (RiskController::new(cfg, inv_rx), inv_tx)
    }

    #[test]
    fn test_drawdown_trips_kill_switch() {
        let cfg = RiskConfig { initial_capital: dec!(100), ..RiskConfig::default() };
        let (risk, _inv_tx) = controller(cfg);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        risk.register_cancel_handler("mm", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        // $100.00 peak, then equity drops to $94.99: 5.01% >= 5%.
        risk.update_equity(dec!(100.00));
        assert_eq!(risk.state(), TradingState::Active);
        risk.update_equity(dec!(94.99));

        assert_eq!(risk.state(), TradingState::KillSwitch);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!risk.can_trade());
        let (ok, reason) = risk.allow_new_exposure(dec!(1));
        assert!(!ok);
        assert!(reason.contains("KILL_SWITCH"));
    }

    #[test]
    fn test_drawdown_below_threshold_keeps_trading() {
        let cfg = RiskConfig { initial_capital: dec!(100), ..RiskConfig::default() };
        let (risk, _inv_tx) = controller(cfg);
        risk.update_equity(dec!(100.00));
        risk.update_equity(dec!(95.01));
        assert_eq!(risk.state(), TradingState::Active);
    }

    #[test]
    fn test_heartbeat_timeout_kills() {
        let cfg = RiskConfig {
            heartbeat_timeout: Duration::from_millis(0),
            ..RiskConfig::default()
        };
        let (risk, _inv_tx) = controller(cfg);
        risk.record_heartbeat("book");
        std::thread::sleep(Duration::from_millis(5));
        risk.check_connection_health();
        assert_eq!(risk.state(), TradingState::KillSwitch);
    }

    #[test]
    fn test_no_feeds_registered_is_healthy() {
        let (risk, _inv_tx) = controller(RiskConfig::default());
        risk.check_connection_health();
        assert_eq!(risk.state(), TradingState::Active);
    }

    #[test]
    fn test_spread_sanity_variants() {
        let (risk, _inv_tx) = controller(RiskConfig::default());

        let (ok, _) = risk.check_spread_sanity("m1", dec!(0.45), dec!(0.46));
        assert!(ok);

        // 70 ticks wide.
        let (ok, reason) = risk.check_spread_sanity("m2", dec!(0.40), dec!(0.47));
        assert!(!ok);
        assert!(reason.contains("abnormal spread"));
        assert!(risk.market_paused("m2"));

        let (ok, reason) = risk.check_spread_sanity("m3", dec!(0.50), dec!(0.49));
        assert!(!ok);
        assert!(reason.contains("crossed"));

        let (ok, reason) = risk.check_spread_sanity("m4", dec!(0), dec!(0.49));
        assert!(!ok);
        assert!(reason.contains("invalid"));

        // Spread breaker is market-scoped, not global.
        assert_eq!(risk.state(), TradingState::Active);
        assert!(!risk.market_paused("m1"));
    }

    #[test]
    fn test_circuit_breaker_resets_after_duration() {
        let cfg = RiskConfig {
            circuit_breaker_duration: Duration::from_millis(0),
            ..RiskConfig::default()
        };
        let (risk, _inv_tx) = controller(cfg);
        risk.trigger_circuit_breaker("test");
        assert_eq!(risk.state(), TradingState::CircuitBreaker);
        std::thread::sleep(Duration::from_millis(5));
        risk.maybe_reset_circuit_breaker();
        assert_eq!(risk.state(), TradingState::Active);
        assert_eq!(risk.status().circuit_breaker_count, 1);
    }

    #[test]
    fn test_kill_switch_is_not_downgraded() {
        let cfg = RiskConfig {
            circuit_breaker_duration: Duration::from_millis(0),
            ..RiskConfig::default()
        };
        let (risk, _inv_tx) = controller(cfg);
        risk.trigger_kill_switch("fatal");
        // Breaker cannot override, and reset must not revive trading.
        risk.trigger_circuit_breaker("later");
        std::thread::sleep(Duration::from_millis(5));
        risk.maybe_reset_circuit_breaker();
        assert_eq!(risk.state(), TradingState::KillSwitch);
    }

    #[test]
    fn test_latency_breaker_requires_sustained_breaches() {
        let (risk, _inv_tx) = controller(RiskConfig::default());
        risk.record_round_trip(Duration::from_millis(600));
        risk.record_round_trip(Duration::from_millis(700));
        assert_eq!(risk.state(), TradingState::Active);
        // A healthy sample resets the run.
        risk.record_round_trip(Duration::from_millis(50));
        risk.record_round_trip(Duration::from_millis(600));
        risk.record_round_trip(Duration::from_millis(600));
        assert_eq!(risk.state(), TradingState::Active);
        risk.record_round_trip(Duration::from_millis(600));
        assert_eq!(risk.state(), TradingState::CircuitBreaker);
    }

    #[test]
    fn test_global_exposure_cap() {
        let cfg = RiskConfig { max_total_position: dec!(100), ..RiskConfig::default() };
        let (risk, inv_tx) = controller(cfg);
        inv_tx
            .send(InventoryView { gross_exposure: dec!(90), ..InventoryView::default() })
            .unwrap();
        let (ok, _) = risk.allow_new_exposure(dec!(5));
        assert!(ok);
        let (ok, reason) = risk.allow_new_exposure(dec!(20));
        assert!(!ok);
        assert!(reason.contains("global exposure"));
    }

    #[test]
    fn test_partial_execution_event_kills() {
        let (risk, _inv_tx) = controller(RiskConfig::default());
        risk.handle_event(RiskEvent::PartialExecution {
            market: "m".into(),
            filled_legs: vec!["a".into()],
            unreversed_shares: dec!(3),
        });
        assert_eq!(risk.state(), TradingState::KillSwitch);
    }

    #[test]
    fn test_protocol_invariant_pauses_market_only() {
        let (risk, _inv_tx) = controller(RiskConfig::default());
        risk.handle_event(RiskEvent::ProtocolInvariant { market: "m".into(), sum: dec!(1.08) });
        assert!(risk.market_paused("m"));
        assert_eq!(risk.state(), TradingState::Active);
    }
}
