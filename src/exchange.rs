//! Exchange client and secret-store seams.
//!
//! The core consumes these interfaces; signing, retry/backoff, and transport
//! details live behind them. Order rejections are result variants, not
//! errors: "would cross" is a branch the maker's price walker takes, never
//! an exception path.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::engine::types::{BookLevel, BookSnapshot, OrderIntent, OrderState, PlacedOrder, TimeInForce};

// ─────────────────────────────────────────────────────────
// Placement outcomes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Post-only order priced through the opposite side.
    PostOnlyWouldCross,
    /// Fill-or-kill order could not be fully matched.
    Unfillable,
    InsufficientBalance,
    Other(String),
}

#[derive(Debug, Clone)]
pub enum PlaceOutcome {
    Accepted(PlacedOrder),
    Rejected { reason: RejectReason },
}

#[derive(Debug, Clone)]
pub struct PositionRecord {
    pub asset: String,
    pub market: String,
    pub shares: Decimal,
    pub avg_price: Decimal,
}

// ─────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn place_order(&self, intent: &OrderIntent) -> Result<PlaceOutcome>;
    async fn cancel_order(&self, order_id: &str) -> Result<()>;
    async fn cancel_all(&self) -> Result<()>;
    async fn get_order_book(&self, asset: &str, depth: usize) -> Result<BookSnapshot>;
    async fn get_balance(&self) -> Result<Decimal>;
    async fn get_positions(&self) -> Result<Vec<PositionRecord>>;
}

#[derive(Clone)]
pub struct ApiCredentials {
    pub key: String,
    pub secret: SecretString,
    pub passphrase: SecretString,
}

/// Synchronous credential source. Credentials may be rotated mid-run;
/// callers re-read after `refresh` instead of caching.
pub trait SecretStore: Send + Sync {
    fn wallet_private_key(&self) -> SecretString;
    fn api_credentials(&self) -> ApiCredentials;
    fn refresh(&self) -> Result<()>;
}

/// Environment-backed secret store.
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn wallet_private_key(&self) -> SecretString {
        SecretString::from(std::env::var("PM_PRIVATE_KEY").unwrap_or_default())
    }

    fn api_credentials(&self) -> ApiCredentials {
        ApiCredentials {
            key: std::env::var("PM_API_KEY").unwrap_or_default(),
            secret: SecretString::from(std::env::var("PM_API_SECRET").unwrap_or_default()),
            passphrase: SecretString::from(std::env::var("PM_API_PASSPHRASE").unwrap_or_default()),
        }
    }

    fn refresh(&self) -> Result<()> {
        // Env vars are re-read on every access; nothing to invalidate.
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Thin REST adapter
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
struct PostOrderRequest {
    asset_id: String,
    side: String,
    price: String,
    size: String,
    #[serde(rename = "orderType")]
    order_type: String,
    #[serde(rename = "postOnly")]
    post_only: bool,
    #[serde(rename = "clientId")]
    client_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderID")]
    order_id: String,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    status: String,
    #[serde(default)]
    error_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireLevel {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct WireBook {
    #[serde(default)]
    bids: Vec<WireLevel>,
    #[serde(default)]
    asks: Vec<WireLevel>,
    #[serde(default)]
    seq: u64,
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    asset_id: String,
    #[serde(default)]
    market: String,
    size: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
}

/// Minimal authenticated REST surface. Request signing is delegated to the
/// gateway configured at `rest_url`; this adapter only shapes payloads.
pub struct HttpExchangeClient {
    rest_url: String,
    api_key: String,
    wallet_address: String,
    client: reqwest::Client,
}

impl HttpExchangeClient {
    pub fn new(rest_url: &str, api_key: &str, wallet_address: &str) -> Self {
        Self {
            rest_url: rest_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            wallet_address: wallet_address.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn classify_rejection(response: &OrderResponse) -> RejectReason {
        let msg = response.error_msg.clone().unwrap_or_default().to_lowercase();
        if msg.contains("cross") || msg.contains("post only") || msg.contains("post-only") {
            RejectReason::PostOnlyWouldCross
        } else if msg.contains("fok") || msg.contains("not filled") || msg.contains("unmatched") {
            RejectReason::Unfillable
        } else if msg.contains("balance") || msg.contains("allowance") {
            RejectReason::InsufficientBalance
        } else {
            RejectReason::Other(msg)
        }
    }
}

#[async_trait]
impl ExchangeClient for HttpExchangeClient {
    async fn place_order(&self, intent: &OrderIntent) -> Result<PlaceOutcome> {
        let body = PostOrderRequest {
            asset_id: intent.asset.clone(),
            side: intent.side.as_str().to_string(),
            price: intent.limit_price.to_string(),
            size: intent.size.to_string(),
            order_type: match intent.tif {
                TimeInForce::Fok => "FOK".to_string(),
                TimeInForce::Gtc => "GTC".to_string(),
                TimeInForce::PostOnly => "GTC".to_string(),
            },
            post_only: intent.tif == TimeInForce::PostOnly,
            client_id: intent.client_nonce.clone(),
        };

        let resp: OrderResponse = self
            .client
            .post(format!("{}/order", self.rest_url))
            .header("POLY-API-KEY", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("place_order request failed")?
            .json()
            .await
            .context("place_order response unparsable")?;

        if !resp.success {
            return Ok(PlaceOutcome::Rejected {
                reason: Self::classify_rejection(&resp),
            });
        }

        let state = match resp.status.to_lowercase().as_str() {
            "matched" => OrderState::Filled,
            "live" => OrderState::New,
            _ => OrderState::New,
        };
        let filled = if state == OrderState::Filled { intent.size } else { Decimal::ZERO };
        Ok(PlaceOutcome::Accepted(PlacedOrder {
            order_id: resp.order_id,
            intent: intent.clone(),
            placed_at: std::time::Instant::now(),
            filled_size: filled,
            state,
        }))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.client
            .delete(format!("{}/order", self.rest_url))
            .header("POLY-API-KEY", &self.api_key)
            .json(&serde_json::json!({ "orderID": order_id }))
            .send()
            .await
            .context("cancel_order request failed")?
            .error_for_status()
            .context("cancel_order rejected")?;
        Ok(())
    }

    async fn cancel_all(&self) -> Result<()> {
        self.client
            .delete(format!("{}/orders", self.rest_url))
            .header("POLY-API-KEY", &self.api_key)
            .send()
            .await
            .context("cancel_all request failed")?
            .error_for_status()
            .context("cancel_all rejected")?;
        Ok(())
    }

    async fn get_order_book(&self, asset: &str, depth: usize) -> Result<BookSnapshot> {
        let book: WireBook = self
            .client
            .get(format!("{}/book", self.rest_url))
            .query(&[("token_id", asset)])
            .send()
            .await
            .context("get_order_book request failed")?
            .json()
            .await
            .context("get_order_book response unparsable")?;

        let parse_levels = |levels: Vec<WireLevel>| -> Vec<BookLevel> {
            levels
                .into_iter()
                .filter_map(|l| {
                    Some(BookLevel {
                        price: l.price.parse().ok()?,
                        size: l.size.parse().ok()?,
                    })
                })
                .take(depth)
                .collect()
        };

        Ok(BookSnapshot::new(
            asset.to_string(),
            parse_levels(book.bids),
            parse_levels(book.asks),
            book.seq,
            std::time::Instant::now(),
        ))
    }

    async fn get_balance(&self) -> Result<Decimal> {
        let value: serde_json::Value = self
            .client
            .get(format!("{}/balance", self.rest_url))
            .header("POLY-API-KEY", &self.api_key)
            .send()
            .await
            .context("get_balance request failed")?
            .json()
            .await
            .context("get_balance response unparsable")?;
        value
            .get("balance")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .context("balance field missing")
    }

    async fn get_positions(&self) -> Result<Vec<PositionRecord>> {
        let wire: Vec<WirePosition> = self
            .client
            .get(format!("{}/positions", self.rest_url))
            .query(&[("user", self.wallet_address.as_str())])
            .send()
            .await
            .context("get_positions request failed")?
            .json()
            .await
            .context("get_positions response unparsable")?;

        Ok(wire
            .into_iter()
            .filter_map(|p| {
                Some(PositionRecord {
                    asset: p.asset_id,
                    market: p.market,
                    shares: p.size.parse().ok()?,
                    avg_price: p.avg_price.parse().unwrap_or(Decimal::ZERO),
                })
            })
            .collect())
    }
}

// ─────────────────────────────────────────────────────────
// Scriptable exchange for tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
pub mod mock {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::engine::types::Side;

    /// Next placement result for an asset.
    #[derive(Debug, Clone)]
    pub enum Scripted {
        /// Accepted and fully filled at the limit price.
        Fill,
        /// Accepted, rests unfilled (GTC/post-only path).
        Rest,
        /// Accepted with a partial fill of the given size.
        Partial(Decimal),
        Reject(RejectReason),
    }

    #[derive(Default)]
    pub struct MockExchange {
        pub placed: Mutex<Vec<OrderIntent>>,
        pub cancelled: Mutex<Vec<String>>,
        pub cancel_all_calls: Mutex<usize>,
        scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
        books: Mutex<HashMap<String, BookSnapshot>>,
        balance: Mutex<Decimal>,
        positions: Mutex<Vec<PositionRecord>>,
    }

    impl MockExchange {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn script(&self, asset: &str, outcome: Scripted) {
            self.scripts
                .lock()
                .entry(asset.to_string())
                .or_default()
                .push_back(outcome);
        }

        pub fn set_book(&self, snapshot: BookSnapshot) {
            self.books.lock().insert(snapshot.asset.clone(), snapshot);
        }

        pub fn set_balance(&self, balance: Decimal) {
            *self.balance.lock() = balance;
        }

        pub fn set_positions(&self, positions: Vec<PositionRecord>) {
            *self.positions.lock() = positions;
        }

        pub fn placed_for(&self, asset: &str) -> Vec<OrderIntent> {
            self.placed
                .lock()
                .iter()
                .filter(|i| i.asset == asset)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl ExchangeClient for MockExchange {
        async fn place_order(&self, intent: &OrderIntent) -> Result<PlaceOutcome> {
            self.placed.lock().push(intent.clone());
            let scripted = self
                .scripts
                .lock()
                .get_mut(&intent.asset)
                .and_then(|q| q.pop_front())
                .unwrap_or(Scripted::Fill);

            let order_id = uuid::Uuid::new_v4().to_string();
            let outcome = match scripted {
                Scripted::Fill => PlaceOutcome::Accepted(PlacedOrder {
                    order_id,
                    intent: intent.clone(),
                    placed_at: std::time::Instant::now(),
                    filled_size: intent.size,
                    state: OrderState::Filled,
                }),
                Scripted::Rest => PlaceOutcome::Accepted(PlacedOrder {
                    order_id,
                    intent: intent.clone(),
                    placed_at: std::time::Instant::now(),
                    filled_size: Decimal::ZERO,
                    state: OrderState::New,
                }),
                Scripted::Partial(size) => PlaceOutcome::Accepted(PlacedOrder {
                    order_id,
                    intent: intent.clone(),
                    placed_at: std::time::Instant::now(),
                    filled_size: size,
                    state: OrderState::Partial,
                }),
                Scripted::Reject(reason) => PlaceOutcome::Rejected { reason },
            };
            Ok(outcome)
        }

        async fn cancel_order(&self, order_id: &str) -> Result<()> {
            self.cancelled.lock().push(order_id.to_string());
            Ok(())
        }

        async fn cancel_all(&self) -> Result<()> {
            *self.cancel_all_calls.lock() += 1;
            Ok(())
        }

        async fn get_order_book(&self, asset: &str, _depth: usize) -> Result<BookSnapshot> {
            self.books
                .lock()
                .get(asset)
                .cloned()
                .context("no book scripted for asset")
        }

        async fn get_balance(&self) -> Result<Decimal> {
            Ok(*self.balance.lock())
        }

        async fn get_positions(&self) -> Result<Vec<PositionRecord>> {
            Ok(self.positions.lock().clone())
        }
    }

    #[tokio::test]
    async fn test_mock_scripts_in_order() {
        let exch = MockExchange::new();
        exch.script("a", Scripted::Reject(RejectReason::PostOnlyWouldCross));
        exch.script("a", Scripted::Fill);

        let intent = OrderIntent {
            asset: "a".into(),
            side: Side::Buy,
            size: Decimal::ONE,
            limit_price: Decimal::new(5, 1),
            tif: TimeInForce::PostOnly,
            client_nonce: "n".into(),
        };
        match exch.place_order(&intent).await.unwrap() {
            PlaceOutcome::Rejected { reason } => {
                assert_eq!(reason, RejectReason::PostOnlyWouldCross)
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        match exch.place_order(&intent).await.unwrap() {
            PlaceOutcome::Accepted(order) => assert!(order.is_fully_filled()),
            other => panic!("expected fill, got {other:?}"),
        }
    }
}
