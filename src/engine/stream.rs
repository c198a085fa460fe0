//! Stream manager — one authenticated WebSocket, two logical channels.
//!
//! `book` events become immutable snapshots in the market-state cache (the
//! cache is the latest-wins store, so the maker is only nudged and a lost
//! nudge is harmless). `user` fills are the single source of truth for
//! inventory; they are deduplicated across reconnects and never dropped —
//! the read loop blocks rather than lose one.
//!
//! On any transport close, read error, or idle timeout the registered
//! disconnect handlers fire BEFORE the reconnect attempt, so strategies can
//! flash-cancel resting orders instead of quoting blind through the gap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::cache::MarketStateCache;
use super::inventory::InventoryManager;
use super::messages::{FeedChannel, FillEvent, MakerMsg, RiskEvent, StreamEvent};
use super::risk::RiskController;
use super::types::{BookLevel, BookSnapshot, Side};
use crate::exchange::SecretStore;

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub ws_url: String,
    pub markets: Vec<String>,
    /// Union of assets requested by the scanner and the maker.
    pub assets: Vec<String>,
    /// Outbound PING cadence; must stay well under the risk heartbeat
    /// timeout.
    pub ping_interval: Duration,
    /// No inbound traffic for this long counts as a dead connection.
    pub idle_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws".to_string(),
            markets: Vec::new(),
            assets: Vec::new(),
            ping_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Fill dedup across reconnects
// ─────────────────────────────────────────────────────────

/// Bounded TTL cache keyed on order+trade id so replayed events after a
/// reconnect are not applied twice.
struct DedupCache {
    seen_at: HashMap<String, Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl DedupCache {
    fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            seen_at: HashMap::with_capacity(max_entries.min(4096)),
            ttl,
            max_entries,
        }
    }

    /// Returns true the first time a key is seen within the TTL.
    fn remember(&mut self, key: String) -> bool {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.ttl);
        if let Some(cutoff) = cutoff {
            self.seen_at.retain(|_, ts| *ts >= cutoff);
        }
        if self.seen_at.contains_key(&key) {
            return false;
        }
        self.seen_at.insert(key, now);
        while self.seen_at.len() > self.max_entries {
            let oldest = self
                .seen_at
                .iter()
                .min_by_key(|(_, ts)| *ts)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => self.seen_at.remove(&key),
                None => break,
            };
        }
        true
    }
}

// ─────────────────────────────────────────────────────────
// Wire parsing (one small hand-written parser per variant)
// ─────────────────────────────────────────────────────────

fn field_decimal(value: &Value, field: &str) -> Option<rust_decimal::Decimal> {
    let v = value.get(field)?;
    if let Some(s) = v.as_str() {
        return s.parse().ok();
    }
    v.as_f64().and_then(rust_decimal::Decimal::from_f64_retain)
}

fn field_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(|v| v.as_str())
}

fn parse_levels(value: &Value, field: &str) -> Vec<BookLevel> {
    let Some(levels) = value.get(field).and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    levels
        .iter()
        .filter_map(|lvl| {
            Some(BookLevel {
                price: field_decimal(lvl, "price")?,
                size: field_decimal(lvl, "size")?,
            })
        })
        .filter(|lvl| lvl.price > rust_decimal::Decimal::ZERO)
        .collect()
}

fn parse_book(value: &Value, now: Instant) -> Option<StreamEvent> {
    let asset = field_str(value, "asset_id")?.to_string();
    let mut bids = parse_levels(value, "bids");
    let mut asks = parse_levels(value, "asks");
    // Best price first; the wire does not guarantee ordering.
    bids.sort_by(|a, b| b.price.cmp(&a.price));
    asks.sort_by(|a, b| a.price.cmp(&b.price));

    let seq = value
        .get("seq")
        .and_then(|v| v.as_u64())
        .or_else(|| value.get("timestamp").and_then(|v| v.as_u64()))
        .or_else(|| field_str(value, "timestamp").and_then(|s| s.parse().ok()))?;

    Some(StreamEvent::Book(BookSnapshot::new(asset, bids, asks, seq, now)))
}

fn parse_fill(value: &Value, now: Instant) -> Option<StreamEvent> {
    let asset = field_str(value, "asset_id")?.to_string();
    let side = match field_str(value, "side")? {
        s if s.eq_ignore_ascii_case("buy") => Side::Buy,
        s if s.eq_ignore_ascii_case("sell") => Side::Sell,
        other => {
            debug!(side = %other, "fill with unknown side dropped");
            return None;
        }
    };
    let price = field_decimal(value, "price")?;
    let size = field_decimal(value, "size")?;
    if price <= rust_decimal::Decimal::ZERO || size <= rust_decimal::Decimal::ZERO {
        return None;
    }
    Some(StreamEvent::Fill(FillEvent {
        order_id: field_str(value, "order_id")?.to_string(),
        trade_id: field_str(value, "id")
            .or_else(|| field_str(value, "trade_id"))
            .unwrap_or_default()
            .to_string(),
        asset,
        market: field_str(value, "market").unwrap_or_default().to_string(),
        side,
        price,
        size,
        fee_rate_bps: value.get("fee_rate_bps").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        ts: now,
    }))
}

/// Parse one wire message into a typed stream event.
pub fn parse_stream_event(value: &Value, now: Instant) -> Option<StreamEvent> {
    let event_type = field_str(value, "event_type").or_else(|| field_str(value, "type"))?;
    match event_type.to_ascii_lowercase().as_str() {
        "book" | "price_change" => parse_book(value, now),
        "trade" | "fill" => parse_fill(value, now),
        "pong" | "heartbeat" => Some(StreamEvent::Heartbeat { channel: FeedChannel::Book, ts: now }),
        "market_status" | "status" | "error" => Some(StreamEvent::Status {
            market: field_str(value, "market").unwrap_or_default().to_string(),
            status: field_str(value, "status")
                .or_else(|| field_str(value, "message"))
                .unwrap_or_default()
                .to_string(),
        }),
        other => {
            debug!(event_type = %other, "unhandled stream event");
            None
        }
    }
}

// ─────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────

pub struct StreamManager {
    cfg: StreamConfig,
    secrets: Arc<dyn SecretStore>,
    cache: Arc<MarketStateCache>,
    inventory: Arc<InventoryManager>,
    risk: Arc<RiskController>,
    maker_tx: mpsc::Sender<MakerMsg>,
}

impl StreamManager {
    pub fn new(
        cfg: StreamConfig,
        secrets: Arc<dyn SecretStore>,
        cache: Arc<MarketStateCache>,
        inventory: Arc<InventoryManager>,
        risk: Arc<RiskController>,
        maker_tx: mpsc::Sender<MakerMsg>,
    ) -> Self {
        Self { cfg, secrets, cache, inventory, risk, maker_tx }
    }

    /// Dispatch one parsed event into the fabric.
    async fn handle_event(&self, event: StreamEvent, dedup: &mut DedupCache) {
        match event {
            StreamEvent::Book(snapshot) => {
                self.risk.record_heartbeat(FeedChannel::Book.as_str());
                let asset = snapshot.asset.clone();
                if self.cache.upsert(snapshot) {
                    // Latest-wins: a dropped nudge is fine, the cache
                    // already holds the newest book.
                    let _ = self.maker_tx.try_send(MakerMsg::BookUpdate { asset });
                }
            }
            StreamEvent::Fill(fill) => {
                self.risk.record_heartbeat(FeedChannel::User.as_str());
                let key = format!("{}:{}", fill.order_id, fill.trade_id);
                if !dedup.remember(key) {
                    debug!(order_id = %fill.order_id, "replayed fill dropped");
                    return;
                }
                let micro = self
                    .cache
                    .get(&fill.asset)
                    .map(|s| s.micro_price)
                    .unwrap_or(fill.price);
                self.inventory.record_fill(&fill, micro);
                // Fills must never be lost: block until the mailbox drains.
                if self.maker_tx.send(MakerMsg::Fill(fill)).await.is_err() {
                    warn!("maker mailbox closed, fill dispatch skipped");
                }
            }
            StreamEvent::Heartbeat { channel, .. } => {
                self.risk.record_heartbeat(channel.as_str());
            }
            StreamEvent::Status { market, status } => {
                let lowered = status.to_ascii_lowercase();
                if lowered.contains("unauthorized") || lowered.contains("invalid api") {
                    // Try a credential rotation first; a dead store is fatal.
                    warn!("stream auth rejected, rotating credentials");
                    if self.secrets.refresh().is_err() {
                        self.risk.handle_event(RiskEvent::AuthFailure { detail: status });
                    }
                    return;
                }
                debug!(market = %market, status = %status, "market status");
            }
        }
    }

    fn subscribe_payload(&self) -> Value {
        let creds = self.secrets.api_credentials();
        json!({
            "type": "subscribe",
            "channels": ["book", "user"],
            "markets": self.cfg.markets,
            "assets_ids": self.cfg.assets,
            "initial_dump": true,
            "auth": {
                "apiKey": creds.key,
                "secret": creds.secret.expose_secret(),
                "passphrase": creds.passphrase.expose_secret(),
            },
        })
    }

    /// The flash-cancel hook: handlers run before any reconnect attempt.
    fn on_disconnect(&self) {
        self.cache.trigger_disconnect_handlers();
    }

    async fn connect_and_listen(&self, dedup: &mut DedupCache, stop_rx: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(url = %self.cfg.ws_url, assets = self.cfg.assets.len(), "connecting stream");
        let connect = tokio::time::timeout(Duration::from_secs(10), connect_async(&self.cfg.ws_url)).await;
        let (ws, response) = match connect {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => anyhow::bail!("ws connect error: {err:?}"),
            Err(_) => anyhow::bail!("ws connect timeout"),
        };
        info!(status = ?response.status(), "stream connected");
        let (mut write, mut read) = ws.split();

        write
            .send(Message::Text(self.subscribe_payload().to_string()))
            .await?;

        // Keepalive PINGs on a fixed cadence.
        let mut ping = tokio::time::interval(self.cfg.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if write.send(Message::Text("PING".to_string())).await.is_err() {
                        anyhow::bail!("ping write failed");
                    }
                }
                msg = tokio::time::timeout(self.cfg.idle_timeout, read.next()) => {
                    let msg = match msg {
                        Ok(Some(msg)) => msg,
                        Ok(None) => anyhow::bail!("stream ended"),
                        Err(_) => anyhow::bail!("stream idle past {}s", self.cfg.idle_timeout.as_secs()),
                    };
                    match msg {
                        Ok(Message::Text(text)) => {
                            let now = Instant::now();
                            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                                continue;
                            };
                            // Batched events arrive as arrays.
                            let values = match value {
                                Value::Array(items) => items,
                                single => vec![single],
                            };
                            for value in &values {
                                if let Some(event) = parse_stream_event(value, now) {
                                    self.handle_event(event, dedup).await;
                                }
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            warn!(?frame, "stream closed by server");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(err) => anyhow::bail!("stream read error: {err:?}"),
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Receive loop with reconnection. Dedup state survives reconnects so
    /// replayed fills stay idempotent.
    pub async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let mut dedup = DedupCache::new(Duration::from_secs(15 * 60), 50_000);
        loop {
            if *stop_rx.borrow() {
                break;
            }
            match self.connect_and_listen(&mut dedup, &mut stop_rx).await {
                Ok(()) => info!("stream session ended"),
                Err(err) => warn!(?err, "stream error"),
            }
            if *stop_rx.borrow() {
                break;
            }

            // Flash-cancel BEFORE any reconnect attempt.
            self.on_disconnect();

            info!(delay_s = self.cfg.reconnect_delay.as_secs(), "reconnecting stream");
            tokio::time::sleep(self.cfg.reconnect_delay).await;
        }
        info!("stream manager stopped");
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
