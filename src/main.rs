//! Engine entry point: wire the actor fabric and run until ctrl-c or a
//! kill-switch escalation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use pm_engine::engine::cache::MarketStateCache;
use pm_engine::engine::executor::BasketExecutor;
use pm_engine::engine::inventory::InventoryManager;
use pm_engine::engine::maker::{MakerMarket, MarketMaker};
use pm_engine::engine::messages::{CancelReason, MakerMsg, RiskEvent};
use pm_engine::engine::orders::OpenOrderTracker;
use pm_engine::engine::persistence;
use pm_engine::engine::ratelimit::DualRateLimiter;
use pm_engine::engine::risk::{RiskController, TradingState};
use pm_engine::engine::scanner::{ArbScanner, MarketSpec, OutcomeSpec};
use pm_engine::engine::settings::Settings;
use pm_engine::engine::stream::StreamManager;
use pm_engine::engine::supervisor::{
    AllocationConfig, StrategySupervisor, SupervisorConfig, TaskStrategy,
};
use pm_engine::engine::types::MarketType;
use pm_engine::exchange::{EnvSecretStore, ExchangeClient, HttpExchangeClient, SecretStore};

/// One binary market configured from the environment.
struct ConfiguredMarket {
    market_id: String,
    yes_asset: String,
    no_asset: String,
}

fn configured_market() -> Result<ConfiguredMarket> {
    Ok(ConfiguredMarket {
        market_id: std::env::var("PM_MARKET_ID").context("PM_MARKET_ID not set")?,
        yes_asset: std::env::var("PM_YES_ASSET_ID").context("PM_YES_ASSET_ID not set")?,
        no_asset: std::env::var("PM_NO_ASSET_ID").context("PM_NO_ASSET_ID not set")?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;
    let market = configured_market()?;
    info!(market = %market.market_id, "starting prediction-market engine");

    // ── Shared infrastructure ──
    let secrets: Arc<dyn SecretStore> = Arc::new(EnvSecretStore);
    let creds = secrets.api_credentials();
    let client: Arc<dyn ExchangeClient> = Arc::new(HttpExchangeClient::new(
        &settings.rest_url,
        &creds.key,
        &settings.wallet_address,
    ));
    let cache = Arc::new(MarketStateCache::new());
    let inventory = Arc::new(InventoryManager::new(settings.inventory_config()));
    let risk = Arc::new(RiskController::new(settings.risk_config(), inventory.subscribe()));
    let limiter = Arc::new(DualRateLimiter::new(
        settings.rate_burst_per_sec,
        settings.rate_burst_capacity,
        settings.rate_sustained_per_sec,
        settings.rate_sustained_capacity,
    ));
    let open_orders = Arc::new(OpenOrderTracker::default());

    // ── Rehydrate persisted state, exchange as truth ──
    let state_path = PathBuf::from(&settings.state_path);
    if state_path.exists() {
        match persistence::load(&state_path) {
            Ok(saved) => {
                let exchange_positions = match client.get_positions().await {
                    Ok(positions) => positions,
                    Err(err) => {
                        warn!(?err, "position fetch failed, trusting persisted state only");
                        saved
                            .positions
                            .iter()
                            .map(|p| pm_engine::exchange::PositionRecord {
                                asset: p.asset.clone(),
                                market: p.market.clone(),
                                shares: p.shares,
                                avg_price: p.avg_entry_price,
                            })
                            .collect()
                    }
                };
                inventory.restore(persistence::reconcile(&saved, &exchange_positions), saved.realized_pnl);
                risk.restore_peak_equity(saved.peak_equity);

                // Orders the previous run left resting would quote blind
                // off dead state; cancel them before any strategy starts.
                for order_id in &saved.outstanding_order_ids {
                    warn!(order_id = %order_id, "cancelling order left resting by previous run");
                    if let Err(err) = client.cancel_order(order_id).await {
                        warn!(order_id = %order_id, ?err, "stale order cancel failed");
                    }
                }
                info!(
                    positions = exchange_positions.len(),
                    stale_orders = saved.outstanding_order_ids.len(),
                    "state rehydrated",
                );
            }
            Err(err) => warn!(?err, "persisted state unreadable, starting fresh"),
        }
    }

    // ── Strategy components ──
    let scanner_markets = vec![MarketSpec {
        market: market.market_id.clone(),
        market_type: MarketType::Binary,
        outcomes: vec![
            OutcomeSpec { asset: market.yes_asset.clone(), name: "Yes".to_string() },
            OutcomeSpec { asset: market.no_asset.clone(), name: "No".to_string() },
        ],
    }];
    let maker_markets = vec![MakerMarket {
        market: market.market_id.clone(),
        asset: market.yes_asset.clone(),
        complement: Some(market.no_asset.clone()),
    }];

    let scanner = ArbScanner::new(settings.scanner_config(), scanner_markets, cache.clone());
    let maker = MarketMaker::new(
        settings.maker_config(),
        maker_markets,
        cache.clone(),
        inventory.clone(),
        risk.clone(),
        client.clone(),
        limiter.clone(),
        open_orders.clone(),
    );

    let mut assets = scanner.subscribed_assets();
    assets.extend(maker.subscribed_assets());
    assets.sort();
    assets.dedup();

    let (maker_tx, maker_rx) = mpsc::channel::<MakerMsg>(512);
    let (opp_tx, opp_rx) = mpsc::channel(1);
    let (risk_event_tx, risk_event_rx) = mpsc::channel::<RiskEvent>(64);

    let executor = BasketExecutor::new(
        settings.executor_config(),
        cache.clone(),
        client.clone(),
        limiter.clone(),
        risk.clone(),
        inventory.clone(),
        open_orders.clone(),
        risk_event_tx,
    );

    // Flash-cancel hooks: fired on stream disconnect and on risk
    // escalation, both ahead of any further trading.
    let hook = maker_tx.clone();
    cache.register_disconnect_handler("market-maker", move || {
        let _ = hook.try_send(MakerMsg::CancelAll(CancelReason::Disconnect));
    });
    let hook = maker_tx.clone();
    risk.register_cancel_handler("market-maker", move || {
        let _ = hook.try_send(MakerMsg::CancelAll(CancelReason::RiskHalt));
    });

    // ── Supervisor & long-lived tasks ──
    let mut supervisor = StrategySupervisor::new(
        SupervisorConfig {
            allocation: AllocationConfig {
                mm_pct: settings.mm_allocation_pct,
                arb_pct: settings.arb_allocation_pct,
                reserve_pct: settings.reserve_pct,
                mm_cap: settings.mm_capital_cap,
                arb_cap: settings.arb_capital_cap,
                mm_min: settings.mm_min_capital,
                arb_min: settings.arb_min_capital,
            },
            cancel_on_shutdown: settings.cancel_on_shutdown,
        },
        risk.clone(),
        client.clone(),
    );
    let stop_rx = supervisor.stop_signal();

    let stream = StreamManager::new(
        settings.stream_config(vec![market.market_id.clone()], assets.clone()),
        secrets,
        cache.clone(),
        inventory.clone(),
        risk.clone(),
        maker_tx.clone(),
    );
    tokio::spawn(stream.run(stop_rx.clone()));
    tokio::spawn(risk.clone().run(risk_event_rx, stop_rx.clone()));
    let outstanding: persistence::OutstandingOrders = {
        let tracker = open_orders.clone();
        Arc::new(move || tracker.ids())
    };
    tokio::spawn(persistence::run_persistence_loop(
        state_path,
        Duration::from_secs(settings.persistence_interval_secs),
        inventory.clone(),
        risk.clone(),
        cache.clone(),
        outstanding,
        stop_rx.clone(),
    ));

    // Mark/equity loop: fold fresh mids into unrealized P&L and run the
    // drawdown check on a fixed cadence.
    {
        let cache = cache.clone();
        let inventory = inventory.clone();
        let risk = risk.clone();
        let client = client.clone();
        let assets = assets.clone();
        let mut stop_rx = stop_rx.clone();
        let initial_cash = settings.initial_capital;
        tokio::spawn(async move {
            let mut cash = initial_cash;
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Ok(balance) = client.get_balance().await {
                            cash = balance;
                        }
                        let marks: HashMap<String, Decimal> = assets
                            .iter()
                            .filter_map(|asset| Some((asset.clone(), cache.get(asset)?.mid_price)))
                            .collect();
                        if !marks.is_empty() {
                            inventory.update_marks(&marks);
                        }
                        risk.update_equity(cash);
                        inventory.purge_flat(Duration::from_secs(300));
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    {
        let stop_rx = stop_rx.clone();
        supervisor.register(Box::new(TaskStrategy::new("market-making", move || {
            vec![tokio::spawn(maker.run(maker_rx, stop_rx))]
        })));
    }
    {
        let scan_stop = stop_rx.clone();
        let exec_stop = stop_rx.clone();
        supervisor.register(Box::new(TaskStrategy::new("arbitrage", move || {
            vec![
                tokio::spawn(scanner.run(opp_tx, scan_stop)),
                tokio::spawn(executor.run(opp_rx, exec_stop)),
            ]
        })));
    }

    let equity = client.get_balance().await.unwrap_or(settings.initial_capital);
    supervisor.start(equity).await?;
    info!(%equity, "engine running");

    let mut state_rx = risk.subscribe_state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
        }
        _ = async {
            loop {
                if state_rx.changed().await.is_err() {
                    break;
                }
                let state = *state_rx.borrow();
                if matches!(state, TradingState::KillSwitch | TradingState::Liquidation) {
                    break;
                }
            }
        } => {
            warn!("risk escalation, shutting down");
        }
    }
    supervisor.shutdown().await;
    Ok(())
}
