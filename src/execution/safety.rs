use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use crate::api::{fmt_decimal, ExchangeApi, OrderRequest};
use crate::core::config::{CoinConfig, SafetyConfig};
use crate::monitoring::Notifier;

use super::positions::PositionSnapshot;
use super::tracker::{PositionSide, TradeStatus, TradeTracker, TrackerEntry};
use super::now_ts;

/// SL/TP distances for a position. Prefers the ATR snapshot taken at entry
/// time; falls back to fixed percentages for positions with no snapshot
/// (opened manually, or recovered after a crash).
pub fn compute_safety_prices(
    entry_price: f64,
    side: PositionSide,
    atr_value: f64,
    config: &SafetyConfig,
) -> (f64, f64) {
    if atr_value > 0.0 {
        let dist_sl = atr_value * config.atr_multiplier_sl;
        let dist_tp = atr_value * config.atr_multiplier_tp;
        match side {
            PositionSide::Long => (entry_price - dist_sl, entry_price + dist_tp),
            PositionSide::Short => (entry_price + dist_sl, entry_price - dist_tp),
        }
    } else {
        match side {
            PositionSide::Long => (
                entry_price * (1.0 - config.default_sl_percent),
                entry_price * (1.0 + config.default_tp_percent),
            ),
            PositionSide::Short => (
                entry_price * (1.0 + config.default_sl_percent),
                entry_price * (1.0 - config.default_tp_percent),
            ),
        }
    }
}

/// Price at which trailing protection kicks in: entry plus the given
/// fraction of the distance toward TP.
pub fn trailing_activation_price(
    entry_price: f64,
    tp_price: f64,
    side: PositionSide,
    fraction: f64,
) -> f64 {
    let dist = (tp_price - entry_price).abs() * fraction;
    match side {
        PositionSide::Long => entry_price + dist,
        PositionSide::Short => entry_price - dist,
    }
}

/// Callback rate as a percent, clamped to what the exchange accepts.
pub fn clamp_callback_rate(callback_rate: f64, min_rate: f64, max_rate: f64) -> f64 {
    let rate_percent = (callback_rate * 100.0 * 10.0).round() / 10.0;
    rate_percent.clamp(min_rate, max_rate)
}

/// Installs stop-loss/take-profit protection on open positions and runs the
/// trailing-stop ratchet (software or exchange-native).
pub struct SafetyManager {
    client: Arc<dyn ExchangeApi>,
    tracker: Arc<TradeTracker>,
    notifier: Notifier,
    config: SafetyConfig,
    coins: Vec<CoinConfig>,
    /// One install at a time, across all symbols.
    install_lock: Mutex<()>,
    trailing_last_write: RwLock<HashMap<String, Instant>>,
}

impl SafetyManager {
    pub fn new(
        client: Arc<dyn ExchangeApi>,
        tracker: Arc<TradeTracker>,
        notifier: Notifier,
        config: SafetyConfig,
        coins: Vec<CoinConfig>,
    ) -> Self {
        Self {
            client,
            tracker,
            notifier,
            config,
            coins,
            install_lock: Mutex::new(()),
            trailing_last_write: RwLock::new(HashMap::new()),
        }
    }

    fn price_precision(&self, symbol: &str) -> u32 {
        self.coins
            .iter()
            .find(|c| c.symbol == symbol)
            .map(|c| c.price_precision)
            .unwrap_or(4)
    }

    fn quantity_precision(&self, symbol: &str) -> u32 {
        self.coins
            .iter()
            .find(|c| c.symbol == symbol)
            .map(|c| c.quantity_precision)
            .unwrap_or(3)
    }

    /// Install SL + TP for an open position. Idempotent: any pre-existing
    /// orders on the symbol are cancelled first, so a retry never stacks
    /// duplicate safety orders.
    pub async fn install_safety_orders(
        &self,
        symbol: &str,
        position: &PositionSnapshot,
    ) -> Result<()> {
        let _guard = self.install_lock.lock().await;

        if let Err(e) = self.client.cancel_all_open_orders(symbol).await {
            tracing::debug!("Cancel old orders for {}: {}", symbol, e);
        }

        let entry_price = position.entry_price;
        let side = position.side;
        let atr_value = self
            .tracker
            .get(symbol)
            .await
            .map(|e| e.atr_value)
            .unwrap_or(0.0);

        let (sl_price, tp_price) =
            compute_safety_prices(entry_price, side, atr_value, &self.config);
        if atr_value > 0.0 {
            tracing::info!(
                "🛡️ Safety calc (ATR {:.4}): {} SL {:.4} | TP {:.4}",
                atr_value,
                symbol,
                sl_price,
                tp_price
            );
        }

        let precision = self.price_precision(symbol);
        let closing_side = side.closing_order_side();

        let sl_order = self
            .client
            .place_order(&OrderRequest::stop_market_close(
                symbol,
                closing_side,
                fmt_decimal(sl_price, precision),
            ))
            .await
            .context("stop-loss leg")?;

        let tp_order = match self
            .client
            .place_order(&OrderRequest::take_profit_market_close(
                symbol,
                closing_side,
                fmt_decimal(tp_price, precision),
            ))
            .await
        {
            Ok(order) => order,
            Err(e) => {
                // Partial protection: the SL is live, the TP is not. Surface
                // it and let the safety loop retry; never auto-flatten.
                tracing::error!(
                    "❌ TP leg failed for {} after SL was placed: {}",
                    symbol,
                    e
                );
                self.notifier
                    .send(&format!(
                        "⚠️ <b>PARTIAL SAFETY</b>\n{}\nSL placed @ {:.4}, TP failed: {}",
                        symbol, sl_price, e
                    ))
                    .await;
                return Err(e).context("take-profit leg");
            }
        };

        let sl_order_id = sl_order.order_id.to_string();
        let tp_order_id = tp_order.order_id.to_string();

        if self.tracker.exists(symbol).await {
            self.tracker
                .update(symbol, |entry| {
                    entry.status = TradeStatus::Secured;
                    entry.entry_price = entry_price;
                    entry.side = Some(side);
                    entry.sl_price_initial = sl_price;
                    entry.tp_price = tp_price;
                    entry.sl_order_id = Some(sl_order_id.clone());
                    entry.tp_order_id = Some(tp_order_id.clone());
                    entry.trailing_active = false;
                })
                .await;
        } else {
            // Position opened outside the bot; adopt it so it stays protected.
            self.tracker
                .set(
                    symbol,
                    TrackerEntry {
                        status: TradeStatus::Secured,
                        created_at: now_ts(),
                        side: Some(side),
                        entry_price,
                        sl_price_initial: sl_price,
                        tp_price,
                        sl_order_id: Some(sl_order_id),
                        tp_order_id: Some(tp_order_id),
                        strategy: "MANUAL".to_string(),
                        ..Default::default()
                    },
                )
                .await;
        }
        self.tracker.save().await;

        tracing::info!(
            "✅ Safety orders installed: {} | SL {:.4} | TP {:.4}",
            symbol,
            sl_price,
            tp_price
        );
        self.notifier
            .send(&format!(
                "🛡️ <b>POSITION SECURED</b>\n{} {}\nSL: {:.4}\nTP: {:.4}",
                symbol, side, sl_price, tp_price
            ))
            .await;

        Ok(())
    }

    /// Per-tick entry point for the software trailing stop. No-op when the
    /// ratchet is exchange-native or the symbol is not in `SECURED`.
    pub async fn check_trailing_on_price(&self, symbol: &str, current_price: f64) -> Result<()> {
        if !self.config.enable_trailing_stop || self.config.use_native_trailing {
            return Ok(());
        }

        let Some(entry) = self.tracker.get(symbol).await else {
            return Ok(());
        };
        if entry.status != TradeStatus::Secured {
            return Ok(());
        }

        if !entry.trailing_active {
            self.maybe_activate_trailing(symbol, &entry, current_price)
                .await
        } else {
            self.update_trailing_sl(symbol, current_price).await.map(|_| ())
        }
    }

    async fn maybe_activate_trailing(
        &self,
        symbol: &str,
        entry: &TrackerEntry,
        current_price: f64,
    ) -> Result<()> {
        let Some(side) = entry.side else {
            return Ok(());
        };
        if entry.entry_price <= 0.0 || entry.tp_price <= 0.0 {
            return Ok(());
        }

        let activation = trailing_activation_price(
            entry.entry_price,
            entry.tp_price,
            side,
            self.config.trailing_activation_threshold,
        );
        let reached = match side {
            PositionSide::Long => current_price >= activation,
            PositionSide::Short => current_price <= activation,
        };
        if !reached {
            return Ok(());
        }

        self.activate_trailing_mode(symbol, current_price).await
    }

    /// Switch the symbol into trailing mode. The initial stop is whichever
    /// of the two candidates locks in more favorable price: the callback
    /// percentage off the current extreme, or the minimum-profit floor off
    /// entry.
    pub async fn activate_trailing_mode(&self, symbol: &str, current_price: f64) -> Result<()> {
        let Some(entry) = self.tracker.get(symbol).await else {
            return Ok(());
        };
        let side = entry.side.unwrap_or(PositionSide::Long);
        let entry_price = entry.entry_price;

        let new_sl = match side {
            PositionSide::Long => {
                let callback_sl = current_price * (1.0 - self.config.trailing_callback_rate);
                let min_profit_sl = entry_price * (1.0 + self.config.trailing_min_profit_lock);
                callback_sl.max(min_profit_sl)
            }
            PositionSide::Short => {
                let callback_sl = current_price * (1.0 + self.config.trailing_callback_rate);
                let min_profit_sl = entry_price * (1.0 - self.config.trailing_min_profit_lock);
                callback_sl.min(min_profit_sl)
            }
        };

        self.tracker
            .update(symbol, |e| {
                e.trailing_active = true;
                e.trailing_sl = new_sl;
                match side {
                    PositionSide::Long => e.trailing_high = current_price,
                    PositionSide::Short => e.trailing_low = current_price,
                }
            })
            .await;
        self.tracker.save().await;

        tracing::info!(
            "🔄 Trailing mode ACTIVATED for {} @ {:.4} | SL: {:.4}",
            symbol,
            current_price,
            new_sl
        );
        self.notifier
            .send(&format!(
                "🔄 <b>TRAILING ACTIVE</b>\n{}\nPrice: {:.4}\nInitial SL: {:.4} (locked)",
                symbol, current_price, new_sl
            ))
            .await;

        self.amend_sl_order(symbol, new_sl, side).await
    }

    /// One ratchet step. The watermark and the candidate stop are recomputed
    /// on every tick; only the exchange write is throttled, so a throttled
    /// tick is deferred, not lost. Returns true when the stop was moved on
    /// the exchange.
    pub async fn update_trailing_sl(&self, symbol: &str, current_price: f64) -> Result<bool> {
        let Some(entry) = self.tracker.get(symbol).await else {
            return Ok(false);
        };
        if !entry.trailing_active {
            return Ok(false);
        }

        let side = entry.side.unwrap_or(PositionSide::Long);
        let current_sl = entry.trailing_sl;

        let (watermark, candidate_sl) = match side {
            PositionSide::Long => {
                let high = entry.trailing_high.max(current_price);
                (high, high * (1.0 - self.config.trailing_callback_rate))
            }
            PositionSide::Short => {
                let low = if entry.trailing_low > 0.0 {
                    entry.trailing_low.min(current_price)
                } else {
                    current_price
                };
                (low, low * (1.0 + self.config.trailing_callback_rate))
            }
        };

        // Watermark advances unconditionally; the throttle below only gates
        // the exchange write.
        self.tracker
            .update(symbol, |e| match side {
                PositionSide::Long => e.trailing_high = watermark,
                PositionSide::Short => e.trailing_low = watermark,
            })
            .await;

        let more_favorable = match side {
            PositionSide::Long => candidate_sl > current_sl,
            PositionSide::Short => candidate_sl < current_sl,
        };
        if !more_favorable {
            return Ok(false);
        }

        {
            let mut last_write = self.trailing_last_write.write().await;
            let interval = Duration::from_secs(self.config.trailing_update_interval_secs);
            if let Some(last) = last_write.get(symbol) {
                if last.elapsed() < interval {
                    return Ok(false);
                }
            }
            last_write.insert(symbol.to_string(), Instant::now());
        }

        self.tracker
            .update(symbol, |e| e.trailing_sl = candidate_sl)
            .await;
        self.tracker.save().await;

        tracing::info!(
            "📈 Trailing SL updated {}: {:.4} -> {:.4}",
            symbol,
            current_sl,
            candidate_sl
        );
        self.amend_sl_order(symbol, candidate_sl, side).await?;

        Ok(true)
    }

    /// Cancel-and-replace of the live stop order. The fast path cancels by
    /// the remembered id; if that id has drifted (missed fill/cancel event),
    /// the fallback sweeps every open stop-type order on the symbol.
    pub async fn amend_sl_order(
        &self,
        symbol: &str,
        new_sl_price: f64,
        side: PositionSide,
    ) -> Result<()> {
        let sl_order_id = self.tracker.get(symbol).await.and_then(|e| e.sl_order_id);
        let mut use_fallback = sl_order_id.is_none();

        if let Some(order_id) = &sl_order_id {
            if let Err(e) = self.client.cancel_order(symbol, order_id).await {
                tracing::warn!(
                    "⚠️ Fast cancel failed for {} ({}): {}. Falling back.",
                    symbol,
                    order_id,
                    e
                );
                use_fallback = true;
            }
        }

        if use_fallback {
            match self.client.fetch_open_orders(symbol).await {
                Ok(orders) => {
                    for order in orders.iter().filter(|o| o.order_type == "STOP_MARKET") {
                        if let Err(e) = self
                            .client
                            .cancel_order(symbol, &order.order_id.to_string())
                            .await
                        {
                            tracing::warn!(
                                "Failed to cancel old SL {} on {}: {}",
                                order.order_id,
                                symbol,
                                e
                            );
                        }
                    }
                }
                Err(e) => tracing::warn!("Open-orders sweep failed for {}: {}", symbol, e),
            }
        }

        let new_order = self
            .client
            .place_order(&OrderRequest::stop_market_close(
                symbol,
                side.closing_order_side(),
                fmt_decimal(new_sl_price, self.price_precision(symbol)),
            ))
            .await
            .context("replacement stop order")?;

        if self.tracker.exists(symbol).await {
            self.tracker
                .update(symbol, |e| e.sl_order_id = Some(new_order.order_id.to_string()))
                .await;
            self.tracker.save().await;
        }

        Ok(())
    }

    /// Hand the ratchet to the exchange's own trailing order type. Installed
    /// a short delay after the fill is observed (see the delayed task in
    /// executor.rs); by the time this runs the position may already be gone,
    /// which callers guard against.
    pub async fn install_native_trailing_stop(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        callback_rate: f64,
        activation_price: Option<f64>,
    ) -> Result<()> {
        let rate_percent = clamp_callback_rate(
            callback_rate,
            self.config.native_trailing_min_rate,
            self.config.native_trailing_max_rate,
        );

        let activation = activation_price
            .map(|price| fmt_decimal(price, self.price_precision(symbol)));
        tracing::info!(
            "📤 Sending native trailing stop: {} | Rate: {}%{}",
            symbol,
            rate_percent,
            activation
                .as_deref()
                .map(|p| format!(" | Activation: {}", p))
                .unwrap_or_default()
        );

        let request = OrderRequest::trailing_stop(
            symbol,
            side.closing_order_side(),
            fmt_decimal(quantity, self.quantity_precision(symbol)),
            rate_percent,
            activation,
        );

        let order = match self.client.place_order(&request).await {
            Ok(order) => order,
            Err(e) => {
                tracing::error!("❌ Failed to install native trailing for {}: {}", symbol, e);
                self.notifier
                    .send(&format!("⚠️ <b>NATIVE TRAILING ERROR</b>\n{}: {}", symbol, e))
                    .await;
                return Err(e.into());
            }
        };

        let order_id = order.order_id.to_string();
        tracing::info!("✅ Native trailing stop active: {} (ID: {})", symbol, order_id);

        if self.tracker.exists(symbol).await {
            self.tracker
                .update(symbol, |e| {
                    e.status = TradeStatus::SecuredNative;
                    e.native_trailing_id = Some(order_id.clone());
                    e.trailing_active = true;
                    if let Some(price) = activation_price {
                        e.activation_price = price;
                    }
                })
                .await;
            self.tracker.save().await;
        }

        Ok(())
    }
}
