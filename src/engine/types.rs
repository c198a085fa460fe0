use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Minimum price increment on the CLOB.
pub const PRICE_TICK: Decimal = dec!(0.001);
/// Minimum share increment.
pub const SHARE_TICK: Decimal = dec!(0.01);
/// A position with fewer shares than this is flat.
pub const FLAT_TOLERANCE: Decimal = dec!(0.01);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for BUY, -1 for SELL.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
    /// Fill-or-kill: cancelled immediately unless fully fillable.
    Fok,
    Gtc,
    /// Rejected by the exchange if it would cross the spread.
    PostOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    New,
    Partial,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderState::New | OrderState::Partial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketType {
    Binary,
    Multi,
    /// Inverse market: buying all NOs of the set is equivalent to
    /// selling exactly one YES.
    NegRisk,
}

// ─────────────────────────────────────────────────────────
// Tick arithmetic
// ─────────────────────────────────────────────────────────

/// Quantize toward zero to a tick grid. Used at every price/size boundary;
/// edge comparisons near 1.0 must never see binary-float residue.
pub fn floor_to_tick(value: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return value;
    }
    (value / tick).trunc() * tick
}

/// Clamp a quote into the tradable band [tick, 1 - tick].
pub fn clamp_price(price: Decimal, tick: Decimal) -> Decimal {
    price.max(tick).min(Decimal::ONE - tick)
}

// ─────────────────────────────────────────────────────────
// Order book snapshot
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Immutable top-of-book snapshot for one asset. Mid and micro are computed
/// once by the publisher so every reader sees a consistent tuple.
#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub asset: String,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub mid_price: Decimal,
    pub micro_price: Decimal,
    pub updated_at: Instant,
    /// Exchange sequence number; the cache rejects non-increasing values.
    pub seq: u64,
}

impl BookSnapshot {
    pub fn new(
        asset: String,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
        seq: u64,
        now: Instant,
    ) -> Self {
        let best_bid = bids.first().map(|l| l.price).unwrap_or(Decimal::ZERO);
        let bid_size = bids.first().map(|l| l.size).unwrap_or(Decimal::ZERO);
        let best_ask = asks.first().map(|l| l.price).unwrap_or(Decimal::ZERO);
        let ask_size = asks.first().map(|l| l.size).unwrap_or(Decimal::ZERO);

        let mid_price = (best_bid + best_ask) / dec!(2);
        let depth = bid_size + ask_size;
        // Size-weighted mid; degrades to plain mid on an empty book.
        let micro_price = if depth > Decimal::ZERO {
            (bid_size * best_ask + ask_size * best_bid) / depth
        } else {
            mid_price
        };

        Self {
            asset,
            best_bid,
            best_ask,
            bid_size,
            ask_size,
            bids,
            asks,
            mid_price,
            micro_price,
            updated_at: now,
            seq,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.updated_at)
    }

    pub fn has_two_sides(&self) -> bool {
        self.best_bid > Decimal::ZERO && self.best_ask > Decimal::ZERO
    }

    pub fn spread_ticks(&self, tick: Decimal) -> Decimal {
        if tick <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.best_ask - self.best_bid) / tick
    }
}

// ─────────────────────────────────────────────────────────
// Orders
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub asset: String,
    pub side: Side,
    pub size: Decimal,
    pub limit_price: Decimal,
    pub tif: TimeInForce,
    pub client_nonce: String,
}

impl OrderIntent {
    pub fn notional(&self) -> Decimal {
        self.size * self.limit_price
    }
}

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: String,
    pub intent: OrderIntent,
    pub placed_at: Instant,
    pub filled_size: Decimal,
    pub state: OrderState,
}

impl PlacedOrder {
    pub fn is_fully_filled(&self) -> bool {
        self.state == OrderState::Filled && self.filled_size >= self.intent.size
    }
}

// ─────────────────────────────────────────────────────────
// Arbitrage opportunity
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OutcomeQuote {
    pub asset: String,
    pub name: String,
    pub ask_price: Decimal,
    pub ask_depth: Decimal,
}

/// A complete basket whose normalized ask sum prices below one dollar of
/// guaranteed payout. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub market: String,
    pub market_type: MarketType,
    pub outcomes: Vec<OutcomeQuote>,
    /// Normalized sum of outcome asks (canonical all-YES basket).
    pub sum_prices: Decimal,
    pub gross_edge_per_share: Decimal,
    pub net_edge_per_share: Decimal,
    pub max_shares: Decimal,
    pub discovered_at: Instant,
    pub max_age: Duration,
}

impl Opportunity {
    pub fn age_ms(&self, now: Instant) -> u128 {
        now.saturating_duration_since(self.discovered_at).as_millis()
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.discovered_at) > self.max_age
    }

    /// Total cost of the basket at sighted prices.
    pub fn basket_notional(&self) -> Decimal {
        self.outcomes
            .iter()
            .map(|o| o.ask_price * self.max_shares)
            .sum()
    }

    pub fn expected_profit(&self) -> Decimal {
        self.net_edge_per_share * self.max_shares
    }
}

// ─────────────────────────────────────────────────────────
// Equity
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct EquitySnapshot {
    pub at: Instant,
    pub cash: Decimal,
    pub position_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub total_equity: Decimal,
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
