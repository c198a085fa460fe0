//! Arbitrage scanner — finds baskets whose normalized ask sum prices below
//! one dollar of guaranteed payout.
//!
//! Negative-risk markets are normalized before summing: buying all N NOs
//! pays N-1 at resolution, so the canonical all-YES sum is
//! `sum(asks) - (N - 2)`. With N = 2 that reduces to the plain binary sum,
//! letting one threshold gate every market type.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::cache::MarketStateCache;
use super::types::{MarketType, Opportunity, OutcomeQuote};

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Required edge below $1: opportunities need `sum < 1 - fee_buffer`.
    pub fee_buffer: Decimal,
    /// Taker fee applied per leg on notional.
    pub taker_fee: Decimal,
    /// Every outcome must show at least this much depth at the ask.
    pub min_depth_shares: Decimal,
    /// Depth divisor absorbing book decay between sight and action.
    pub safety_buffer: Decimal,
    /// Gross edge x max shares must clear this.
    pub min_profit_dollars: Decimal,
    pub staleness: Duration,
    /// Opportunities expire this long after discovery.
    pub max_age: Duration,
    pub scan_interval: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            fee_buffer: dec!(0.008),
            taker_fee: dec!(0.01),
            min_depth_shares: dec!(5),
            safety_buffer: dec!(1.2),
            min_profit_dollars: dec!(0.10),
            staleness: Duration::from_millis(500),
            max_age: Duration::from_millis(500),
            scan_interval: Duration::from_millis(500),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Market registry
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OutcomeSpec {
    pub asset: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct MarketSpec {
    pub market: String,
    pub market_type: MarketType,
    /// For NEG_RISK markets these are the NO-token assets.
    pub outcomes: Vec<OutcomeSpec>,
}

// ─────────────────────────────────────────────────────────
// Scanner
// ─────────────────────────────────────────────────────────

pub struct ArbScanner {
    cfg: ScannerConfig,
    markets: Vec<MarketSpec>,
    cache: Arc<MarketStateCache>,
}

impl ArbScanner {
    pub fn new(cfg: ScannerConfig, markets: Vec<MarketSpec>, cache: Arc<MarketStateCache>) -> Self {
        info!(
            markets = markets.len(),
            threshold = %(Decimal::ONE - cfg.fee_buffer),
            "arb scanner initialized",
        );
        Self { cfg, markets, cache }
    }

    /// All assets the scanner needs streamed.
    pub fn subscribed_assets(&self) -> Vec<String> {
        self.markets
            .iter()
            .flat_map(|m| m.outcomes.iter().map(|o| o.asset.clone()))
            .collect()
    }

    /// One scan pass: every market that currently prices below the
    /// threshold, best net edge first.
    pub fn scan(&self) -> Vec<Opportunity> {
        let now = Instant::now();
        let mut found: Vec<Opportunity> = self
            .markets
            .iter()
            .filter_map(|market| self.evaluate(market, now))
            .collect();

        found.sort_by(|a, b| {
            b.net_edge_per_share
                .cmp(&a.net_edge_per_share)
                // Smaller baskets attract less competition.
                .then(a.basket_notional().cmp(&b.basket_notional()))
                .then(a.discovered_at.cmp(&b.discovered_at))
        });
        found
    }

    fn evaluate(&self, market: &MarketSpec, now: Instant) -> Option<Opportunity> {
        let mut outcomes = Vec::with_capacity(market.outcomes.len());
        let mut sum_asks = Decimal::ZERO;
        let mut min_depth: Option<Decimal> = None;

        for outcome in &market.outcomes {
            let snap = self.cache.get(&outcome.asset)?;
            if snap.age(now) > self.cfg.staleness {
                debug!(market = %market.market, asset = %outcome.asset, "skip: stale book");
                return None;
            }
            if snap.best_ask <= Decimal::ZERO || snap.ask_size < self.cfg.min_depth_shares {
                debug!(market = %market.market, asset = %outcome.asset, "skip: missing depth");
                return None;
            }
            sum_asks += snap.best_ask;
            min_depth = Some(min_depth.map_or(snap.ask_size, |d| d.min(snap.ask_size)));
            outcomes.push(OutcomeQuote {
                asset: outcome.asset.clone(),
                name: outcome.name.clone(),
                ask_price: snap.best_ask,
                ask_depth: snap.ask_size,
            });
        }

        let n = Decimal::from(outcomes.len() as u64);
        let sum_prices = match market.market_type {
            MarketType::Binary | MarketType::Multi => sum_asks,
            MarketType::NegRisk => sum_asks - (n - dec!(2)),
        };

        let threshold = Decimal::ONE - self.cfg.fee_buffer;
        if sum_prices >= threshold {
            return None;
        }

        let gross = Decimal::ONE - sum_prices;
        let avg_ask = sum_asks / n;
        let net = gross - n * self.cfg.taker_fee * avg_ask;

        let max_shares = (min_depth? / self.cfg.safety_buffer).floor();
        if max_shares <= Decimal::ZERO {
            return None;
        }
        if gross * max_shares <= self.cfg.min_profit_dollars {
            debug!(market = %market.market, %gross, %max_shares, "skip: below profit floor");
            return None;
        }

        Some(Opportunity {
            market: market.market.clone(),
            market_type: market.market_type,
            outcomes,
            sum_prices,
            gross_edge_per_share: gross,
            net_edge_per_share: net,
            max_shares,
            discovered_at: now,
            max_age: self.cfg.max_age,
        })
    }

    /// Scan loop: pushes the best current opportunity toward the executor.
    /// A full channel means a basket is in flight; the opportunity is
    /// dropped and rediscovered next pass if it survives.
    pub async fn run(self, opp_tx: mpsc::Sender<Opportunity>, mut stop_rx: watch::Receiver<bool>) {
        info!(interval_ms = self.cfg.scan_interval.as_millis() as u64, "arb scan loop started");
        let mut ticker = tokio::time::interval(self.cfg.scan_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for opp in self.scan() {
                        match opp_tx.try_send(opp) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => break,
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
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
        info!("arb scan loop stopped");
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
