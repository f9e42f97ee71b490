use std::sync::Arc;
use std::time::Duration;

use crate::api::{OrderUpdate, UserStreamEvent};
use crate::core::Config;
use crate::monitoring::{Notifier, TradeJournal, TradeRecord};

use super::executor::{activate_native_trailing_delayed, OrderExecutor};
use super::safety::trailing_activation_price;
use super::tracker::{PositionSide, TrackerEntry};
use super::now_ts;

/// Closing order type -> journal exit classification. Unknown types pass
/// through unchanged.
pub fn classify_exit_type(order_type: &str) -> String {
    match order_type {
        "STOP_MARKET" => "STOP_LOSS".to_string(),
        "TAKE_PROFIT_MARKET" => "TAKE_PROFIT".to_string(),
        "TRAILING_STOP_MARKET" => "TRAILING_STOP".to_string(),
        "MARKET" => "MANUAL".to_string(),
        "LIMIT" => "LIMIT".to_string(),
        other => other.to_string(),
    }
}

fn iso_ts(ts: f64) -> String {
    if ts <= 0.0 {
        return String::new();
    }
    chrono::DateTime::from_timestamp(ts as i64, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// Dispatches exchange order-lifecycle events into tracker transitions,
/// cooldowns and journal writes. This is the primary, lowest-latency path;
/// the polling loops only cover for events this handler never sees.
pub struct OrderUpdateHandler {
    executor: Arc<OrderExecutor>,
    journal: Option<Arc<TradeJournal>>,
    notifier: Notifier,
    config: Config,
}

impl OrderUpdateHandler {
    pub fn new(
        executor: Arc<OrderExecutor>,
        journal: Option<Arc<TradeJournal>>,
        notifier: Notifier,
        config: Config,
    ) -> Self {
        Self {
            executor,
            journal,
            notifier,
            config,
        }
    }

    pub async fn handle_event(&self, event: UserStreamEvent) {
        match event {
            UserStreamEvent::OrderTradeUpdate(update) => self.on_order_update(update).await,
            UserStreamEvent::AccountUpdate => {
                if let Err(e) = self.executor.sync_positions().await {
                    tracing::warn!("Position sync after account update failed: {}", e);
                }
            }
            UserStreamEvent::ListenKeyExpired => {
                tracing::warn!("⚠️ Listen key expired, user stream needs a reconnect");
            }
        }
    }

    async fn on_order_update(&self, update: OrderUpdate) {
        match update.status.as_str() {
            "CANCELED" => self.on_entry_terminal(&update, "CANCELLED").await,
            "EXPIRED" => self.on_entry_terminal(&update, "TIMEOUT").await,
            "FILLED" => {
                tracing::info!(
                    "⚡ Order filled: {} {} @ {} | RP: {}",
                    update.symbol,
                    update.side,
                    update.avg_price,
                    update.realized_pnl
                );
                if update.realized_pnl != 0.0 {
                    self.on_position_close(&update).await;
                } else {
                    self.on_entry_fill(&update).await;
                }
            }
            _ => return,
        }

        // The cache must reflect reality before the next safety pass runs.
        if let Err(e) = self.executor.sync_positions().await {
            tracing::warn!("Position sync after order event failed: {}", e);
        }
    }

    /// CANCELED / EXPIRED events only matter when they hit our own tracked
    /// entry order; a cancelled safety order or anything else is just noise.
    async fn on_entry_terminal(&self, update: &OrderUpdate, result: &str) {
        let symbol = update.symbol.as_str();
        let order_id = update.order_id.to_string();

        let Some(entry) = self.executor.tracker.get(symbol).await else {
            tracing::debug!("🔔 Order {} (non-tracked): {} {}", result, symbol, order_id);
            return;
        };
        if entry.entry_id.as_deref() != Some(order_id.as_str()) {
            tracing::debug!("🔔 Order {} (non-entry): {} {}", result, symbol, order_id);
            return;
        }

        tracing::info!("🗑️ Entry order {}: {} (ID: {})", result, symbol, order_id);

        self.write_journal(self.non_filled_record(symbol, &entry, result))
            .await;

        self.executor.tracker.delete(symbol).await;
        self.executor.tracker.save().await;

        let (emoji, title) = if result == "TIMEOUT" {
            ("⏰", "ORDER EXPIRED")
        } else {
            ("🗑️", "ORDER CANCELED")
        };
        self.notifier
            .send(&format!(
                "{} <b>{}</b>\nOrder {} removed.\nTracker cleaned & logged to journal.",
                emoji, title, symbol
            ))
            .await;
    }

    /// A fill with non-zero realized PnL is a position close: cooldown,
    /// classification, journal, tracker cleanup.
    async fn on_position_close(&self, update: &OrderUpdate) {
        let symbol = update.symbol.as_str();
        let pnl = update.realized_pnl;
        let price = update.avg_price;

        // Asymmetric: a loss parks the symbol for longer than a win.
        let cooldown = if pnl > 0.0 {
            Duration::from_secs(self.config.trading.cooldown_if_profit_secs)
        } else {
            Duration::from_secs(self.config.trading.cooldown_if_loss_secs)
        };
        self.executor.risk.set_cooldown(symbol, cooldown).await;

        let size_closed_usdt = update.qty * price;
        let leverage = self.config.coin_leverage(symbol);
        let margin_used = if leverage > 0 {
            size_closed_usdt / leverage as f64
        } else {
            size_closed_usdt
        };
        let roi_percent = if margin_used > 0.0 {
            (pnl / margin_used) * 100.0
        } else {
            0.0
        };

        let entry = self
            .executor
            .tracker
            .get(symbol)
            .await
            .unwrap_or_default();
        let exit_type = classify_exit_type(&update.order_type);

        let (emoji, title) = if pnl > 0.0 {
            ("💰", "TAKE PROFIT HIT")
        } else {
            ("🛑", "STOP LOSS HIT")
        };
        let roi_icon = if roi_percent > 0.0 { "🔥" } else { "🩸" };
        self.notifier
            .send(&format!(
                "{} <b>{}</b>\n✨ <b>{}</b>\n🏷️ Type: {}\n📏 Size: ${:.2}\n💵 Price: {}\n💸 PnL: <b>{:+.2}</b>\n{} ROI: <b>{:+.2}%</b>",
                emoji, title, symbol, update.order_type, size_closed_usdt, price, pnl, roi_icon, roi_percent
            ))
            .await;

        // Side of the position, not of the closing order: a SELL closes a LONG.
        let side = entry
            .side
            .unwrap_or_else(|| {
                if update.side == "SELL" {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                }
            });

        let record = TradeRecord {
            symbol: symbol.to_string(),
            side: side.to_string(),
            entry_type: entry.order_type.clone().unwrap_or_else(|| "MARKET".to_string()),
            entry_price: entry.entry_price,
            exit_price: price,
            size_usdt: size_closed_usdt,
            pnl_usdt: pnl,
            roi_percent,
            fee: update.commission,
            result: if pnl > 0.0 { "WIN" } else { "LOSS" }.to_string(),
            exit_type,
            strategy_tag: entry.strategy.clone(),
            signal_reason: entry.signal_reason.clone().unwrap_or_default(),
            setup_at: iso_ts(entry.created_at),
            filled_at: iso_ts(entry.filled_at.unwrap_or(0.0)),
            closed_at: iso_ts(now_ts()),
            trailing_was_active: entry.trailing_active,
            trailing_sl_final: entry.trailing_sl,
            trailing_high: entry.trailing_high,
            trailing_low: entry.trailing_low,
            activation_price: entry.activation_price,
            sl_price_initial: entry.sl_price_initial,
            technical_data: entry.technical_data.to_string(),
            config_snapshot: entry.config_snapshot.to_string(),
        };
        self.write_journal(record).await;

        self.executor.tracker.delete(symbol).await;
        self.executor.tracker.save().await;
        tracing::info!("🗑️ Tracker cleaned for {}", symbol);
    }

    /// A limit entry filled (realized PnL = 0). The projected SL/TP here are
    /// for the notification only; SafetyManager installs the authoritative
    /// ones on its next pass.
    async fn on_entry_fill(&self, update: &OrderUpdate) {
        if update.order_type != "LIMIT" {
            return;
        }

        let symbol = update.symbol.as_str();
        let price_filled = update.avg_price;
        let qty_filled = update.qty;
        let side = PositionSide::from_entry_order_side(&update.side);
        let size_usdt = qty_filled * price_filled;

        let updated = self
            .executor
            .tracker
            .update(symbol, |e| {
                e.status = super::tracker::TradeStatus::Pending;
                e.filled_at = Some(now_ts());
            })
            .await;
        if updated {
            self.executor.tracker.save().await;
        }

        let atr_value = self
            .executor
            .tracker
            .get(symbol)
            .await
            .map(|e| e.atr_value)
            .unwrap_or(0.0);

        let safety = &self.config.safety;
        let mut tp_str = "-".to_string();
        let mut sl_str = "-".to_string();
        let mut rr_str = "-".to_string();
        let mut projected_tp = None;

        if atr_value > 0.0 {
            let dist_sl = atr_value * safety.atr_multiplier_sl;
            let dist_tp = atr_value * safety.atr_multiplier_tp;
            let (sl_price, tp_price) = match side {
                PositionSide::Long => (price_filled - dist_sl, price_filled + dist_tp),
                PositionSide::Short => (price_filled + dist_sl, price_filled - dist_tp),
            };
            tp_str = format!("{:.4}", tp_price);
            sl_str = format!("{:.4}", sl_price);
            if dist_sl > 0.0 {
                rr_str = format!("1:{:.2}", dist_tp / dist_sl);
            }
            projected_tp = Some(tp_price);
        }

        let mut trailing_note = String::new();
        if safety.use_native_trailing {
            trailing_note = format!(
                "\n⏳ <b>Native trailing:</b> activating in {}s...",
                safety.trailing_activation_delay_secs
            );
            let activation_price = projected_tp.map(|tp| {
                trailing_activation_price(
                    price_filled,
                    tp,
                    side,
                    safety.trailing_activation_threshold,
                )
            });
            // Fire-and-forget with its own error boundary; it re-validates
            // the position after the delay and must never be awaited here.
            tokio::spawn(activate_native_trailing_delayed(
                self.executor.clone(),
                symbol.to_string(),
                side,
                qty_filled,
                activation_price,
                Duration::from_secs(safety.trailing_activation_delay_secs),
                safety.trailing_callback_rate,
            ));
        }

        self.notifier
            .send(&format!(
                "✅ <b>LIMIT ENTRY FILLED</b>\n✨ <b>{}</b>\n🚀 Side: {}\n📏 Size: ${:.2}\n💵 Price: {}\n\n🎯 <b>Safety orders:</b>\n• TP: {}\n• SL: {}\n• R:R: {}{}",
                symbol, side, size_usdt, price_filled, tp_str, sl_str, rr_str, trailing_note
            ))
            .await;
    }

    fn non_filled_record(&self, symbol: &str, entry: &TrackerEntry, result: &str) -> TradeRecord {
        TradeRecord {
            symbol: symbol.to_string(),
            side: entry.side.map(|s| s.to_string()).unwrap_or_else(|| "UNKNOWN".to_string()),
            entry_type: entry.order_type.clone().unwrap_or_else(|| "LIMIT".to_string()),
            entry_price: entry.entry_price,
            exit_price: 0.0,
            size_usdt: 0.0,
            pnl_usdt: 0.0,
            roi_percent: 0.0,
            fee: 0.0,
            result: result.to_string(),
            exit_type: "NONE".to_string(),
            strategy_tag: entry.strategy.clone(),
            signal_reason: entry.signal_reason.clone().unwrap_or_default(),
            setup_at: iso_ts(entry.created_at),
            filled_at: String::new(),
            closed_at: iso_ts(now_ts()),
            trailing_was_active: false,
            trailing_sl_final: 0.0,
            trailing_high: 0.0,
            trailing_low: 0.0,
            activation_price: 0.0,
            sl_price_initial: 0.0,
            technical_data: entry.technical_data.to_string(),
            config_snapshot: entry.config_snapshot.to_string(),
        }
    }

    async fn write_journal(&self, record: TradeRecord) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.log_trade(&record).await {
                tracing::warn!("⚠️ Journal write failed for {}: {}", record.symbol, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_classification() {
        assert_eq!(classify_exit_type("STOP_MARKET"), "STOP_LOSS");
        assert_eq!(classify_exit_type("TAKE_PROFIT_MARKET"), "TAKE_PROFIT");
        assert_eq!(classify_exit_type("TRAILING_STOP_MARKET"), "TRAILING_STOP");
        assert_eq!(classify_exit_type("MARKET"), "MANUAL");
        assert_eq!(classify_exit_type("LIMIT"), "LIMIT");
        assert_eq!(classify_exit_type("LIQUIDATION"), "LIQUIDATION");
    }

    #[test]
    fn test_iso_ts() {
        assert_eq!(iso_ts(0.0), "");
        assert!(iso_ts(1_700_000_000.0).starts_with("2023-11-14T"));
    }
}
