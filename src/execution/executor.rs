use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::api::ExchangeApi;
use crate::core::Config;
use crate::monitoring::Notifier;

use super::orders::{EntryRequest, OrderManager};
use super::positions::PositionManager;
use super::risk::RiskManager;
use super::safety::SafetyManager;
use super::sync::OrderSyncManager;
use super::tracker::{PositionSide, TradeStatus, TradeTracker};

/// Composes the execution sub-managers and owns the one canonical "is this
/// symbol busy" predicate that entry gating, reconciliation and the delayed
/// trailing task all share.
pub struct OrderExecutor {
    pub tracker: Arc<TradeTracker>,
    pub positions: Arc<PositionManager>,
    pub risk: Arc<RiskManager>,
    pub safety: Arc<SafetyManager>,
    pub orders: OrderManager,
    pub sync: OrderSyncManager,
}

impl OrderExecutor {
    pub fn new(client: Arc<dyn ExchangeApi>, config: Config, notifier: Notifier) -> Self {
        let tracker = Arc::new(TradeTracker::load(&config.storage.tracker_path));
        let positions = Arc::new(PositionManager::new(client.clone(), config.coins.clone()));
        let risk = Arc::new(RiskManager::new(client.clone(), config.risk.clone()));
        let safety = Arc::new(SafetyManager::new(
            client.clone(),
            tracker.clone(),
            notifier.clone(),
            config.safety.clone(),
            config.coins.clone(),
        ));
        let orders = OrderManager::new(
            client.clone(),
            tracker.clone(),
            risk.clone(),
            notifier.clone(),
            config.trading.clone(),
            config.coins.clone(),
        );
        let sync = OrderSyncManager::new(client, tracker.clone(), positions.clone(), notifier);

        Self {
            tracker,
            positions,
            risk,
            safety,
            orders,
            sync,
        }
    }

    /// A symbol is busy iff the exchange holds a position for it, or the
    /// tracker has an entry that is still on its way to one.
    pub async fn is_symbol_busy(&self, symbol: &str) -> bool {
        if self.positions.has_position(symbol).await {
            return true;
        }
        matches!(
            self.tracker.status(symbol).await,
            TradeStatus::WaitingEntry | TradeStatus::Pending
        )
    }

    /// Entry gate + delegation. A second signal for a busy symbol is
    /// rejected here, before anything touches the exchange.
    pub async fn execute_entry(&self, request: &EntryRequest) -> Result<()> {
        if self.is_symbol_busy(&request.symbol).await {
            tracing::info!(
                "⏸️ {} already has an active or pending trade, skipping entry",
                request.symbol
            );
            return Ok(());
        }
        self.orders.execute_entry(request).await
    }

    pub async fn sync_positions(&self) -> Result<usize> {
        self.positions.sync().await
    }

    pub async fn sync_pending_orders(&self) -> Result<()> {
        self.sync.sync_pending_orders().await
    }

    pub async fn check_trailing_on_price(&self, symbol: &str, price: f64) -> Result<()> {
        self.safety.check_trailing_on_price(symbol, price).await
    }

    /// One pass of the safety sweep: reconcile pending orders, rebuild the
    /// position cache, then protect every position that is not yet secured
    /// (including positions opened manually, which get adopted).
    pub async fn run_safety_cycle(&self) -> Result<()> {
        self.sync_pending_orders().await?;
        self.sync_positions().await?;

        for position in self.positions.open_positions().await {
            let symbol = position.symbol.clone();
            let status = self.tracker.status(&symbol).await;
            if !matches!(
                status,
                TradeStatus::None | TradeStatus::Pending | TradeStatus::WaitingEntry
            ) {
                continue;
            }

            tracing::info!(
                "🛡️ Found unsecured position: {}. Installing safety orders...",
                symbol
            );

            // PROCESSING keeps a concurrent sweep from double-installing.
            let stamped = self
                .tracker
                .update(&symbol, |e| e.status = TradeStatus::Processing)
                .await;
            if stamped {
                self.tracker.save().await;
            }

            if let Err(e) = self.safety.install_safety_orders(&symbol, &position).await {
                tracing::error!(
                    "❌ Safety install failed for {}: {} (will retry next cycle)",
                    symbol,
                    e
                );
                if stamped {
                    self.tracker
                        .update(&symbol, |e| e.status = TradeStatus::Pending)
                        .await;
                    self.tracker.save().await;
                }
            }
        }

        Ok(())
    }
}

/// Periodic fallback path for everything the event stream might miss:
/// expired/ghost orders and unprotected positions.
pub async fn safety_monitor_loop(
    executor: Arc<OrderExecutor>,
    interval: Duration,
    error_sleep: Duration,
) {
    tracing::info!("🛡️ Safety monitor started");
    loop {
        match executor.run_safety_cycle().await {
            Ok(()) => tokio::time::sleep(interval).await,
            Err(e) => {
                tracing::error!("Safety loop error: {}", e);
                tokio::time::sleep(error_sleep).await;
            }
        }
    }
}

/// Delayed native-trailing handoff, spawned per entry fill. The delay keeps
/// the trailing order from racing the fill confirmation on the exchange;
/// the position may close during the window, hence the re-validation.
pub async fn activate_native_trailing_delayed(
    executor: Arc<OrderExecutor>,
    symbol: String,
    side: PositionSide,
    quantity: f64,
    activation_price: Option<f64>,
    delay: Duration,
    callback_rate: f64,
) {
    tracing::info!(
        "⏳ Waiting {}s to activate native trailing for {}...",
        delay.as_secs(),
        symbol
    );
    tokio::time::sleep(delay).await;

    if !executor.is_symbol_busy(&symbol).await {
        tracing::warn!(
            "⚠️ Position {} closed before native trailing activation",
            symbol
        );
        return;
    }

    if let Err(e) = executor
        .safety
        .install_native_trailing_stop(&symbol, side, quantity, callback_rate, activation_price)
        .await
    {
        tracing::error!("❌ Native trailing activation failed for {}: {}", symbol, e);
    }
}
