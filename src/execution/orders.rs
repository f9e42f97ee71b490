use anyhow::{Context, Result};
use std::sync::Arc;

use crate::api::{fmt_decimal, ExchangeApi, OrderRequest};
use crate::core::config::{CoinConfig, TradingConfig};
use crate::monitoring::Notifier;

use super::risk::RiskManager;
use super::tracker::{PositionSide, TradeStatus, TradeTracker, TrackerEntry};
use super::{now_ts, round_to};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrderType {
    Market,
    Limit,
}

impl EntryOrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryOrderType::Market => "MARKET",
            EntryOrderType::Limit => "LIMIT",
        }
    }
}

/// Signal tuple handed over by the strategy engine. The provenance fields
/// ride along untouched and end up in the journal.
#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub symbol: String,
    pub side: PositionSide,
    pub order_type: EntryOrderType,
    pub price: Option<f64>,
    pub amount_usdt: f64,
    pub leverage: u32,
    pub strategy_tag: String,
    pub atr_value: f64,
    pub signal_reason: Option<String>,
    pub technical_data: serde_json::Value,
    pub config_snapshot: serde_json::Value,
}

/// Submits entry orders and keeps the tracker consistent around submission:
/// limit orders are recorded after submission (the id only exists then),
/// market orders are recorded before and rolled back if the submit throws.
pub struct OrderManager {
    client: Arc<dyn ExchangeApi>,
    tracker: Arc<TradeTracker>,
    risk: Arc<RiskManager>,
    notifier: Notifier,
    trading: TradingConfig,
    coins: Vec<CoinConfig>,
}

impl OrderManager {
    pub fn new(
        client: Arc<dyn ExchangeApi>,
        tracker: Arc<TradeTracker>,
        risk: Arc<RiskManager>,
        notifier: Notifier,
        trading: TradingConfig,
        coins: Vec<CoinConfig>,
    ) -> Self {
        Self {
            client,
            tracker,
            risk,
            notifier,
            trading,
            coins,
        }
    }

    fn precisions(&self, symbol: &str) -> (u32, u32) {
        self.coins
            .iter()
            .find(|c| c.symbol == symbol)
            .map(|c| (c.price_precision, c.quantity_precision))
            .unwrap_or((4, 3))
    }

    pub async fn execute_entry(&self, request: &EntryRequest) -> Result<()> {
        let symbol = request.symbol.as_str();

        if self.risk.is_under_cooldown(symbol).await {
            let remaining = self
                .risk
                .remaining_cooldown(symbol)
                .await
                .unwrap_or_default();
            tracing::info!(
                "🛑 {} is in cooldown ({}s remaining), skipping entry",
                symbol,
                remaining.as_secs()
            );
            return Ok(());
        }

        // Leverage/margin setup is idempotent on the exchange side; "already
        // set" style answers are not failures.
        if let Err(e) = self.client.set_leverage(symbol, request.leverage).await {
            if !e.is_no_change() {
                tracing::warn!("⚠️ Leverage setup skipped for {}: {}", symbol, e);
            }
        }
        if let Err(e) = self
            .client
            .set_margin_type(symbol, &self.trading.default_margin_type)
            .await
        {
            if !e.is_no_change() {
                tracing::warn!("⚠️ Margin setup skipped for {}: {}", symbol, e);
            }
        }

        let price_exec = match request.price {
            Some(price) if price > 0.0 => price,
            _ => self
                .client
                .fetch_mark_price(symbol)
                .await
                .context("fetching execution price")?,
        };

        let (price_precision, quantity_precision) = self.precisions(symbol);
        let qty = round_to(
            (request.amount_usdt * request.leverage as f64) / price_exec,
            quantity_precision,
        );

        tracing::info!(
            "🚀 EXECUTING: {} | {} | ${:.2} | x{} | ATR: {:.4}",
            symbol,
            request.side,
            request.amount_usdt,
            request.leverage,
            request.atr_value
        );

        match request.order_type {
            EntryOrderType::Limit => self.execute_limit(request, price_exec, qty, price_precision, quantity_precision).await,
            EntryOrderType::Market => self.execute_market(request, price_exec, qty, quantity_precision).await,
        }
    }

    async fn execute_limit(
        &self,
        request: &EntryRequest,
        price_exec: f64,
        qty: f64,
        price_precision: u32,
        quantity_precision: u32,
    ) -> Result<()> {
        let symbol = request.symbol.as_str();

        // Submission first: the order id only exists after the exchange acks.
        let order = self
            .client
            .place_order(&OrderRequest::limit(
                symbol,
                request.side.entry_order_side(),
                fmt_decimal(qty, quantity_precision),
                fmt_decimal(price_exec, price_precision),
            ))
            .await
            .context("limit order submission")?;

        let now = now_ts();
        self.tracker
            .set(
                symbol,
                TrackerEntry {
                    status: TradeStatus::WaitingEntry,
                    entry_id: Some(order.order_id.to_string()),
                    created_at: now,
                    expires_at: Some(now + self.trading.limit_order_expiry_secs),
                    side: Some(request.side),
                    entry_price: price_exec,
                    order_type: Some(request.order_type.as_str().to_string()),
                    atr_value: request.atr_value,
                    strategy: request.strategy_tag.clone(),
                    signal_reason: request.signal_reason.clone(),
                    technical_data: request.technical_data.clone(),
                    config_snapshot: request.config_snapshot.clone(),
                    ..Default::default()
                },
            )
            .await;
        self.tracker.save().await;

        self.notifier
            .send(&format!(
                "⏳ <b>LIMIT PLACED ({})</b>\n{} {} @ {:.4}\n(SL sizing by ATR: {:.4})",
                request.strategy_tag, symbol, request.side, price_exec, request.atr_value
            ))
            .await;

        Ok(())
    }

    async fn execute_market(
        &self,
        request: &EntryRequest,
        price_exec: f64,
        qty: f64,
        quantity_precision: u32,
    ) -> Result<()> {
        let symbol = request.symbol.as_str();

        // Record first: a market fill event can arrive faster than our own
        // submit call returns, and the handler must find the entry.
        let now = now_ts();
        self.tracker
            .set(
                symbol,
                TrackerEntry {
                    status: TradeStatus::Pending,
                    created_at: now,
                    filled_at: Some(now),
                    side: Some(request.side),
                    entry_price: price_exec,
                    order_type: Some(request.order_type.as_str().to_string()),
                    atr_value: request.atr_value,
                    strategy: request.strategy_tag.clone(),
                    signal_reason: request.signal_reason.clone(),
                    technical_data: request.technical_data.clone(),
                    config_snapshot: request.config_snapshot.clone(),
                    ..Default::default()
                },
            )
            .await;
        self.tracker.save().await;

        match self
            .client
            .place_order(&OrderRequest::market(
                symbol,
                request.side.entry_order_side(),
                fmt_decimal(qty, quantity_precision),
            ))
            .await
        {
            Ok(_) => {
                self.notifier
                    .send(&format!(
                        "✅ <b>MARKET FILLED</b>\n{} {} (Size: ${:.2})",
                        symbol,
                        request.side,
                        request.amount_usdt * request.leverage as f64
                    ))
                    .await;
                Ok(())
            }
            Err(e) => {
                // The order never happened, so the record must vanish too.
                tracing::error!(
                    "❌ Market order failed for {}, rolling back tracker...",
                    symbol
                );
                self.tracker.delete(symbol).await;
                self.tracker.save().await;
                Err(e).context("market order submission")
            }
        }
    }
}
