//! Typed tunables with environment overrides.
//!
//! Every parameter is range-checked at start-up; an out-of-range value is a
//! hard failure, never a silent clamp.

use std::time::Duration;

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::cache::DEFAULT_STALENESS;
use super::executor::ExecutorConfig;
use super::inventory::InventoryConfig;
use super::maker::MakerConfig;
use super::risk::RiskConfig;
use super::scanner::ScannerConfig;
use super::stream::StreamConfig;
use super::types::PRICE_TICK;

#[derive(Debug, Clone)]
pub struct Settings {
    // Capital allocation
    pub mm_allocation_pct: Decimal,
    pub arb_allocation_pct: Decimal,
    pub reserve_pct: Decimal,
    pub mm_capital_cap: Decimal,
    pub arb_capital_cap: Decimal,
    pub mm_min_capital: Decimal,
    pub arb_min_capital: Decimal,

    // Risk
    pub initial_capital: Decimal,
    pub max_drawdown_pct: Decimal,
    pub max_position_per_market: Decimal,
    pub max_gross_exposure: Decimal,
    pub max_spread_ticks: Decimal,
    pub heartbeat_timeout_secs: u64,
    pub latency_kill_ms: u64,

    // Market making
    pub gamma: f64,
    pub base_spread: Decimal,
    pub min_spread: Decimal,
    pub max_spread: Decimal,
    pub quote_size: Decimal,

    // Market data
    pub staleness_ms: u64,

    // Arbitrage
    pub fee_buffer: Decimal,
    pub taker_fee: Decimal,
    pub min_profit_dollars: Decimal,

    // Rate limiting (requests/sec, burst)
    pub rate_burst_per_sec: f64,
    pub rate_burst_capacity: f64,
    pub rate_sustained_per_sec: f64,
    pub rate_sustained_capacity: f64,

    // Endpoints & persistence
    pub ws_url: String,
    pub rest_url: String,
    pub wallet_address: String,
    pub persistence_interval_secs: u64,
    pub state_path: String,
    pub cancel_on_shutdown: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mm_allocation_pct: dec!(0.78),
            arb_allocation_pct: dec!(0.20),
            reserve_pct: dec!(0.02),
            mm_capital_cap: dec!(500),
            arb_capital_cap: dec!(200),
            mm_min_capital: dec!(50),
            arb_min_capital: dec!(10),

            initial_capital: dec!(1000),
            max_drawdown_pct: dec!(0.05),
            max_position_per_market: dec!(5000),
            max_gross_exposure: dec!(50000),
            max_spread_ticks: dec!(50),
            heartbeat_timeout_secs: 30,
            latency_kill_ms: 500,

            gamma: 0.2,
            base_spread: dec!(0.015),
            min_spread: dec!(0.005),
            max_spread: dec!(0.05),
            quote_size: dec!(10),

            staleness_ms: DEFAULT_STALENESS.as_millis() as u64,

            fee_buffer: dec!(0.008),
            taker_fee: dec!(0.01),
            min_profit_dollars: dec!(0.10),

            rate_burst_per_sec: 10.0,
            rate_burst_capacity: 20.0,
            rate_sustained_per_sec: 4.0,
            rate_sustained_capacity: 100.0,

            ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws".to_string(),
            rest_url: "https://clob.polymarket.com".to_string(),
            wallet_address: String::new(),
            persistence_interval_secs: 60,
            state_path: "pm_engine_state.json".to_string(),
            cancel_on_shutdown: true,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, current: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        if let Ok(parsed) = raw.parse() {
            *current = parsed;
        }
    }
}

fn env_bool(key: &str, current: &mut bool) {
    if let Ok(raw) = std::env::var(key) {
        *current = raw == "1" || raw.eq_ignore_ascii_case("true");
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let mut s = Self::default();
        env_parse("PM_MM_ALLOCATION_PCT", &mut s.mm_allocation_pct);
        env_parse("PM_ARB_ALLOCATION_PCT", &mut s.arb_allocation_pct);
        env_parse("PM_RESERVE_PCT", &mut s.reserve_pct);
        env_parse("PM_MM_CAPITAL_CAP", &mut s.mm_capital_cap);
        env_parse("PM_ARB_CAPITAL_CAP", &mut s.arb_capital_cap);
        env_parse("PM_MM_MIN_CAPITAL", &mut s.mm_min_capital);
        env_parse("PM_ARB_MIN_CAPITAL", &mut s.arb_min_capital);

        env_parse("PM_INITIAL_CAPITAL", &mut s.initial_capital);
        env_parse("PM_MAX_DRAWDOWN_PCT", &mut s.max_drawdown_pct);
        env_parse("PM_MAX_POSITION_PER_MARKET", &mut s.max_position_per_market);
        env_parse("PM_MAX_GROSS_EXPOSURE", &mut s.max_gross_exposure);
        env_parse("PM_MAX_SPREAD_TICKS", &mut s.max_spread_ticks);
        env_parse("PM_HEARTBEAT_TIMEOUT_SECS", &mut s.heartbeat_timeout_secs);
        env_parse("PM_LATENCY_KILL_MS", &mut s.latency_kill_ms);

        env_parse("PM_GAMMA", &mut s.gamma);
        env_parse("PM_BASE_SPREAD", &mut s.base_spread);
        env_parse("PM_MIN_SPREAD", &mut s.min_spread);
        env_parse("PM_MAX_SPREAD", &mut s.max_spread);
        env_parse("PM_QUOTE_SIZE", &mut s.quote_size);

        env_parse("PM_STALENESS_MS", &mut s.staleness_ms);

        env_parse("PM_FEE_BUFFER", &mut s.fee_buffer);
        env_parse("PM_TAKER_FEE", &mut s.taker_fee);
        env_parse("PM_MIN_PROFIT_DOLLARS", &mut s.min_profit_dollars);

        env_parse("PM_RATE_BURST_PER_SEC", &mut s.rate_burst_per_sec);
        env_parse("PM_RATE_BURST_CAPACITY", &mut s.rate_burst_capacity);
        env_parse("PM_RATE_SUSTAINED_PER_SEC", &mut s.rate_sustained_per_sec);
        env_parse("PM_RATE_SUSTAINED_CAPACITY", &mut s.rate_sustained_capacity);

        env_parse("PM_WS_URL", &mut s.ws_url);
        env_parse("PM_REST_URL", &mut s.rest_url);
        env_parse("PM_WALLET_ADDRESS", &mut s.wallet_address);
        env_parse("PM_PERSISTENCE_INTERVAL_SECS", &mut s.persistence_interval_secs);
        env_parse("PM_STATE_PATH", &mut s.state_path);
        env_bool("PM_CANCEL_ON_SHUTDOWN", &mut s.cancel_on_shutdown);

        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<()> {
        let total_alloc = self.mm_allocation_pct + self.arb_allocation_pct + self.reserve_pct;
        if total_alloc > Decimal::ONE {
            bail!("capital allocation sums to {total_alloc}, above 100%");
        }
        if self.mm_allocation_pct < Decimal::ZERO || self.arb_allocation_pct < Decimal::ZERO {
            bail!("allocation percentages must be non-negative");
        }
        if self.initial_capital <= Decimal::ZERO {
            bail!("initial capital must be positive");
        }
        if self.max_drawdown_pct <= Decimal::ZERO || self.max_drawdown_pct > dec!(0.5) {
            bail!("max drawdown {} outside (0, 0.5]", self.max_drawdown_pct);
        }
        if self.max_position_per_market <= Decimal::ZERO || self.max_gross_exposure <= Decimal::ZERO {
            bail!("position caps must be positive");
        }
        if self.max_position_per_market > self.max_gross_exposure {
            bail!("per-market cap exceeds gross exposure cap");
        }
        if !(0.05..=1.0).contains(&self.gamma) {
            bail!("gamma {} outside [0.05, 1.0]", self.gamma);
        }
        if self.min_spread <= Decimal::ZERO
            || self.min_spread > self.base_spread
            || self.base_spread > self.max_spread
        {
            bail!(
                "spreads must satisfy 0 < min {} <= base {} <= max {}",
                self.min_spread,
                self.base_spread,
                self.max_spread
            );
        }
        if self.quote_size <= Decimal::ZERO {
            bail!("quote size must be positive");
        }
        if !(100..=5000).contains(&self.staleness_ms) {
            bail!("staleness {}ms outside [100, 5000]", self.staleness_ms);
        }
        if self.fee_buffer <= Decimal::ZERO || self.fee_buffer >= dec!(0.05) {
            bail!("fee buffer {} outside (0, 0.05)", self.fee_buffer);
        }
        if self.taker_fee < Decimal::ZERO || self.taker_fee > dec!(0.05) {
            bail!("taker fee {} outside [0, 0.05]", self.taker_fee);
        }
        if !(100..=2000).contains(&self.latency_kill_ms) {
            bail!("latency kill {}ms outside [100, 2000]", self.latency_kill_ms);
        }
        if self.heartbeat_timeout_secs == 0 || self.heartbeat_timeout_secs > 120 {
            bail!("heartbeat timeout {}s outside [1, 120]", self.heartbeat_timeout_secs);
        }
        if self.rate_burst_per_sec <= 0.0 || self.rate_sustained_per_sec <= 0.0 {
            bail!("rate limits must be positive");
        }
        if self.persistence_interval_secs == 0 {
            bail!("persistence interval must be positive");
        }
        Ok(())
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }

    // ─────────────────────────────────────────────────
    // Component config builders
    // ─────────────────────────────────────────────────

    pub fn risk_config(&self) -> RiskConfig {
        RiskConfig {
            initial_capital: self.initial_capital,
            max_drawdown_pct: self.max_drawdown_pct,
            max_total_position: self.max_gross_exposure,
            max_spread_ticks: self.max_spread_ticks,
            price_tick: PRICE_TICK,
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            latency_kill_ms: self.latency_kill_ms,
            ..RiskConfig::default()
        }
    }

    pub fn inventory_config(&self) -> InventoryConfig {
        InventoryConfig {
            max_position_per_market: self.max_position_per_market,
            max_gross_exposure: self.max_gross_exposure,
            gamma_base: self.gamma,
            ..InventoryConfig::default()
        }
    }

    pub fn maker_config(&self) -> MakerConfig {
        MakerConfig {
            quote_size: self.quote_size,
            base_spread: self.base_spread,
            min_spread: self.min_spread,
            max_spread: self.max_spread,
            staleness: self.staleness(),
            ..MakerConfig::default()
        }
    }

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            fee_buffer: self.fee_buffer,
            taker_fee: self.taker_fee,
            min_profit_dollars: self.min_profit_dollars,
            staleness: self.staleness(),
            ..ScannerConfig::default()
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            fee_buffer: self.fee_buffer,
            staleness: self.staleness(),
            ..ExecutorConfig::default()
        }
    }

    pub fn stream_config(&self, markets: Vec<String>, assets: Vec<String>) -> StreamConfig {
        StreamConfig {
            ws_url: self.ws_url.clone(),
            markets,
            assets,
            idle_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            ..StreamConfig::default()
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_allocation_sum_above_one_fails() {
        let s = Settings {
            mm_allocation_pct: dec!(0.80),
            arb_allocation_pct: dec!(0.25),
            ..Settings::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_gamma_out_of_range_fails() {
        let s = Settings { gamma: 1.5, ..Settings::default() };
        assert!(s.validate().is_err());
        let s = Settings { gamma: 0.01, ..Settings::default() };
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_inverted_spreads_fail() {
        let s = Settings {
            min_spread: dec!(0.05),
            base_spread: dec!(0.01),
            ..Settings::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_drawdown_bounds() {
        let s = Settings { max_drawdown_pct: dec!(0), ..Settings::default() };
        assert!(s.validate().is_err());
        let s = Settings { max_drawdown_pct: dec!(0.6), ..Settings::default() };
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_staleness_bounds() {
        let s = Settings { staleness_ms: 50, ..Settings::default() };
        assert!(s.validate().is_err());
        let s = Settings { staleness_ms: 10_000, ..Settings::default() };
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_per_market_cap_must_fit_gross() {
        let s = Settings {
            max_position_per_market: dec!(100_000),
            max_gross_exposure: dec!(50_000),
            ..Settings::default()
        };
        assert!(s.validate().is_err());
    }
}
