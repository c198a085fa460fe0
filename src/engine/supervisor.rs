//! Strategy supervisor — capital allocation and top-level lifecycle.
//!
//! Allocation: `mm = min(cap_mm, pct_mm x equity)`, same for arb, with a
//! reserve slice held back for fees and emergencies. A strategy only starts
//! when its allocation clears its minimum threshold.
//!
//! The supervisor owns the stop signal and the task handles, and it reacts
//! to risk-state escalation: a kill switch stops every strategy and
//! (configurably) cancels all resting orders on the way out.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::risk::{RiskController, TradingState};
use crate::exchange::ExchangeClient;

// ─────────────────────────────────────────────────────────
// Capital allocation
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AllocationConfig {
    pub mm_pct: Decimal,
    pub arb_pct: Decimal,
    pub reserve_pct: Decimal,
    pub mm_cap: Decimal,
    pub arb_cap: Decimal,
    pub mm_min: Decimal,
    pub arb_min: Decimal,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            mm_pct: dec!(0.78),
            arb_pct: dec!(0.20),
            reserve_pct: dec!(0.02),
            mm_cap: dec!(500),
            arb_cap: dec!(200),
            mm_min: dec!(50),
            arb_min: dec!(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub mm: Decimal,
    pub arb: Decimal,
    pub reserve: Decimal,
    pub mm_enabled: bool,
    pub arb_enabled: bool,
}

pub fn allocate(cfg: &AllocationConfig, equity: Decimal) -> Allocation {
    let mm = (cfg.mm_pct * equity).min(cfg.mm_cap);
    let arb = (cfg.arb_pct * equity).min(cfg.arb_cap);
    let reserve = cfg.reserve_pct * equity;
    Allocation {
        mm,
        arb,
        reserve,
        mm_enabled: mm >= cfg.mm_min,
        arb_enabled: arb >= cfg.arb_min,
    }
}

// ─────────────────────────────────────────────────────────
// Strategy capability
// ─────────────────────────────────────────────────────────

/// The lifecycle surface the supervisor drives. Strategies are values;
/// their run loops are tasks the implementation owns.
#[async_trait]
pub trait Strategy: Send {
    fn name(&self) -> &str;
    async fn start(&mut self) -> Result<()>;
    async fn stop(&mut self);
}

/// A strategy backed by one or more spawned tasks.
pub struct TaskStrategy {
    name: String,
    spawn: Option<Box<dyn FnOnce() -> Vec<JoinHandle<()>> + Send>>,
    handles: Vec<JoinHandle<()>>,
}

impl TaskStrategy {
    pub fn new<F>(name: &str, spawn: F) -> Self
    where
        F: FnOnce() -> Vec<JoinHandle<()>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            spawn: Some(Box::new(spawn)),
            handles: Vec::new(),
        }
    }
}

#[async_trait]
impl Strategy for TaskStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<()> {
        match self.spawn.take() {
            Some(spawn) => {
                self.handles = spawn();
                info!(strategy = %self.name, tasks = self.handles.len(), "strategy started");
                Ok(())
            }
            None => anyhow::bail!("strategy {} already started", self.name),
        }
    }

    async fn stop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
        info!(strategy = %self.name, "strategy stopped");
    }
}

// ─────────────────────────────────────────────────────────
// Supervisor
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub allocation: AllocationConfig,
    pub cancel_on_shutdown: bool,
}

pub struct StrategySupervisor {
    cfg: SupervisorConfig,
    risk: Arc<RiskController>,
    client: Arc<dyn ExchangeClient>,
    strategies: Vec<Box<dyn Strategy>>,
    stop_tx: watch::Sender<bool>,
}

impl StrategySupervisor {
    pub fn new(cfg: SupervisorConfig, risk: Arc<RiskController>, client: Arc<dyn ExchangeClient>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            cfg,
            risk,
            client,
            strategies: Vec::new(),
            stop_tx,
        }
    }

    /// Cooperative stop signal observed by every long-lived loop.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn register(&mut self, strategy: Box<dyn Strategy>) {
        self.strategies.push(strategy);
    }

    pub fn allocation(&self, equity: Decimal) -> Allocation {
        allocate(&self.cfg.allocation, equity)
    }

    /// Start every registered strategy whose allocation clears its floor.
    pub async fn start(&mut self, equity: Decimal) -> Result<Allocation> {
        let allocation = self.allocation(equity);
        info!(
            mm = %allocation.mm,
            arb = %allocation.arb,
            reserve = %allocation.reserve,
            mm_enabled = allocation.mm_enabled,
            arb_enabled = allocation.arb_enabled,
            "capital allocated",
        );

        for strategy in self.strategies.iter_mut() {
            let enabled = match strategy.name() {
                "market-making" => allocation.mm_enabled,
                "arbitrage" => allocation.arb_enabled,
                _ => true,
            };
            if enabled {
                strategy.start().await?;
            } else {
                warn!(strategy = %strategy.name(), "allocation below minimum, strategy disabled");
            }
        }
        Ok(allocation)
    }

    /// Escalations beyond PAUSED halt everything. The circuit breaker's own
    /// auto-reset brings quoting back without a restart, so strategies stay
    /// up for it; a kill switch does not come back.
    pub async fn handle_state_change(&mut self, state: TradingState) {
        match state {
            TradingState::KillSwitch | TradingState::Liquidation => {
                warn!(state = state.as_str(), "risk escalation, shutting strategies down");
                self.shutdown().await;
            }
            _ => {}
        }
    }

    /// Watch risk-state transitions until shutdown.
    pub async fn run(&mut self) {
        let mut state_rx = self.risk.subscribe_state();
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow();
                    self.handle_state_change(state).await;
                    if matches!(state, TradingState::KillSwitch | TradingState::Liquidation) {
                        break;
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub async fn shutdown(&mut self) {
        self.stop_tx.send_replace(true);
        for strategy in self.strategies.iter_mut() {
            strategy.stop().await;
        }
        if self.cfg.cancel_on_shutdown {
            if let Err(err) = self.client.cancel_all().await {
                warn!(?err, "cancel-all on shutdown failed");
            }
        }
        info!("supervisor shutdown complete");
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
