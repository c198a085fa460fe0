//! Channel message types for the actor fabric.
//!
//! Stream events fan out from the stream manager; fills are the single
//! source of truth for inventory and are never dropped. Risk events are the
//! escalation path into the risk controller.

use std::time::Instant;

use rust_decimal::Decimal;

use super::types::{BookSnapshot, Side};

// ─────────────────────────────────────────────────────────
// Stream events (WebSocket → cache / inventory / maker)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedChannel {
    Book,
    User,
}

impl FeedChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedChannel::Book => "book",
            FeedChannel::User => "user",
        }
    }
}

/// Parsed inbound stream message. One variant per wire event shape.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Book(BookSnapshot),
    Fill(FillEvent),
    Heartbeat { channel: FeedChannel, ts: Instant },
    Status { market: String, status: String },
}

/// An execution report for one of our orders, as delivered on the
/// authenticated user channel. `order_id` + `trade_id` identify a fill
/// uniquely; replays after reconnect are dropped by the dedup cache.
#[derive(Debug, Clone)]
pub struct FillEvent {
    pub order_id: String,
    pub trade_id: String,
    pub asset: String,
    pub market: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub fee_rate_bps: u32,
    pub ts: Instant,
}

// ─────────────────────────────────────────────────────────
// Market-maker mailbox
// ─────────────────────────────────────────────────────────

/// Why quotes are being pulled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    StaleBook,
    PriceJump,
    ToxicFlow,
    OppositeFill,
    Reprice,
    BoundaryCap,
    Disconnect,
    RiskHalt,
    Shutdown,
}

/// Messages delivered to the market-making engine's mailbox.
#[derive(Debug, Clone)]
pub enum MakerMsg {
    /// A fresh snapshot landed in the cache for this asset. Losing one of
    /// these is safe: the cache already holds the newest book.
    BookUpdate { asset: String },
    /// Our order filled. Dispatched synchronously ahead of any book update.
    Fill(FillEvent),
    /// Pull every resting quote, e.g. on disconnect or risk halt.
    CancelAll(CancelReason),
}

// ─────────────────────────────────────────────────────────
// Inventory view (watch broadcast)
// ─────────────────────────────────────────────────────────

/// Compact read-only snapshot of inventory totals, broadcast after every
/// trade and mark update so readers never touch the position lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct InventoryView {
    pub gross_exposure: Decimal,
    pub net_exposure: Decimal,
    pub position_value: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub open_positions: usize,
}

impl InventoryView {
    pub fn total_pnl(&self) -> Decimal {
        self.realized_pnl + self.unrealized_pnl
    }
}

// ─────────────────────────────────────────────────────────
// Risk events (components → risk controller)
// ─────────────────────────────────────────────────────────

/// Critical events that may escalate the global trading state.
#[derive(Debug, Clone)]
pub enum RiskEvent {
    /// An atomic basket left a residual position behind. Requires audit.
    PartialExecution {
        market: String,
        filled_legs: Vec<String>,
        unreversed_shares: Decimal,
    },
    /// Credentials rejected even after a refresh attempt.
    AuthFailure { detail: String },
    /// Binary price sum drifted outside tolerance on a market.
    ProtocolInvariant { market: String, sum: Decimal },
    /// Order round-trip exceeded the latency kill threshold.
    LatencyBreach { rtt_ms: u64 },
}
