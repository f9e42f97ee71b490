use anyhow::Result;
use std::sync::Arc;

use crate::api::ExchangeApi;
use crate::monitoring::Notifier;

use super::positions::PositionManager;
use super::tracker::{TradeStatus, TradeTracker};
use super::now_ts;

/// Reconciliation for unfilled entries. The event stream is not guaranteed
/// to deliver every terminal event: an order cancelled through the mobile
/// app, or a dropped websocket message, must still be detected and resolved
/// within one cycle of this manager.
pub struct OrderSyncManager {
    client: Arc<dyn ExchangeApi>,
    tracker: Arc<TradeTracker>,
    positions: Arc<PositionManager>,
    notifier: Notifier,
}

impl OrderSyncManager {
    pub fn new(
        client: Arc<dyn ExchangeApi>,
        tracker: Arc<TradeTracker>,
        positions: Arc<PositionManager>,
        notifier: Notifier,
    ) -> Self {
        Self {
            client,
            tracker,
            positions,
            notifier,
        }
    }

    /// Walk every WAITING_ENTRY symbol and repair drift. A failure on one
    /// symbol never stops the others; the tracker is persisted once at the
    /// end if anything changed.
    pub async fn sync_pending_orders(&self) -> Result<()> {
        let symbols = self
            .tracker
            .symbols_with_status(TradeStatus::WaitingEntry)
            .await;
        if symbols.is_empty() {
            return Ok(());
        }

        let mut changed = false;
        for symbol in symbols {
            match self.check_symbol(&symbol).await {
                Ok(symbol_changed) => changed |= symbol_changed,
                Err(e) => tracing::error!("⚠️ Sync pending error for {}: {}", symbol, e),
            }
        }

        if changed {
            self.tracker.save().await;
        }
        Ok(())
    }

    /// Returns true when the tracker was modified for this symbol.
    async fn check_symbol(&self, symbol: &str) -> Result<bool> {
        let open_orders = self.client.fetch_open_orders(symbol).await?;
        let open_order_ids: Vec<String> =
            open_orders.iter().map(|o| o.order_id.to_string()).collect();

        // Re-read after the fetch: the fill event may have raced us.
        let Some(entry) = self.tracker.get(symbol).await else {
            return Ok(false);
        };
        if entry.status != TradeStatus::WaitingEntry {
            return Ok(false);
        }
        let tracked_id = entry.entry_id.clone().unwrap_or_default();

        // Expiry first. The cancel is best-effort: even if the exchange call
        // fails, the point is that WE stop believing in this order.
        if let Some(expires_at) = entry.expires_at {
            if now_ts() > expires_at {
                tracing::info!("⏰ Limit order {} expired after timeout. Cancelling...", symbol);
                if let Err(e) = self.client.cancel_order(symbol, &tracked_id).await {
                    tracing::warn!(
                        "⚠️ Failed to cancel expired order {} (might be already gone): {}",
                        symbol,
                        e
                    );
                }
                self.tracker.delete(symbol).await;
                self.notifier
                    .send(&format!(
                        "⏰ <b>ORDER EXPIRED</b>\nLimit order {} cancelled after timeout.\nTracker cleaned.",
                        symbol
                    ))
                    .await;
                return Ok(true);
            }
        }

        if open_order_ids.contains(&tracked_id) {
            // Still resting on the book.
            return Ok(false);
        }

        // Vanished from the open-orders list: filled or cancelled out-of-band.
        if self.positions.has_position(symbol).await {
            tracing::info!(
                "✅ Order {} found filled during sync. Queuing for safety orders (PENDING).",
                symbol
            );
            self.tracker
                .update(symbol, |e| {
                    e.status = TradeStatus::Pending;
                    e.last_check = now_ts();
                })
                .await;
            Ok(true)
        } else {
            tracing::info!(
                "🗑️ Found stale/cancelled order for {}. Removing from tracker.",
                symbol
            );
            self.tracker.delete(symbol).await;
            self.notifier
                .send(&format!(
                    "🗑️ <b>ORDER SYNC</b>\nOrder for {} was cancelled out-of-band.\nTracker cleaned.",
                    symbol
                ))
                .await;
            Ok(true)
        }
    }
}
