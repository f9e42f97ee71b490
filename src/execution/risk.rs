use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::api::ExchangeApi;
use crate::core::config::RiskConfig;

/// Position sizing from account risk policy, plus the per-symbol cooldown
/// circuit breaker that guards against revenge-trading a symbol right after
/// a close.
pub struct RiskManager {
    client: Arc<dyn ExchangeApi>,
    config: RiskConfig,
    cooldowns: RwLock<HashMap<String, Instant>>,
}

impl RiskManager {
    pub fn new(client: Arc<dyn ExchangeApi>, config: RiskConfig) -> Self {
        Self {
            client,
            config,
            cooldowns: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_available_balance(&self) -> Result<f64> {
        Ok(self.client.fetch_balance_usdt().await?)
    }

    /// Entry size as a percentage of available balance. Returns `None` when
    /// dynamic sizing is off (callers fall back to the per-coin static
    /// amount). A result below the exchange minimum notional is clamped UP
    /// to that minimum: a signal is never skipped just because the ideal
    /// size rounds too small.
    pub async fn calculate_dynamic_amount_usdt(
        &self,
        symbol: &str,
        leverage: u32,
    ) -> Result<Option<f64>> {
        if !self.config.use_dynamic_size {
            return Ok(None);
        }

        let balance = self.get_available_balance().await?;
        if balance <= 0.0 {
            return Ok(None);
        }

        let risk_amount = balance * (self.config.risk_percent_per_trade / 100.0);

        tracing::debug!(
            "📊 Dynamic sizing {}: balance=${:.2}, risk=${:.2}, leverage={}x",
            symbol,
            balance,
            risk_amount,
            leverage
        );

        if risk_amount < self.config.min_order_usdt {
            return Ok(Some(self.config.min_order_usdt));
        }

        Ok(Some(risk_amount))
    }

    pub async fn set_cooldown(&self, symbol: &str, duration: Duration) {
        let until = Instant::now() + duration;
        self.cooldowns
            .write()
            .await
            .insert(symbol.to_string(), until);
        tracing::info!(
            "❄️ Cooldown set for {} ({}s)",
            symbol,
            duration.as_secs()
        );
    }

    pub async fn is_under_cooldown(&self, symbol: &str) -> bool {
        let mut cooldowns = self.cooldowns.write().await;
        match cooldowns.get(symbol) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                cooldowns.remove(symbol);
                false
            }
            None => false,
        }
    }

    pub async fn remaining_cooldown(&self, symbol: &str) -> Option<Duration> {
        self.cooldowns
            .read()
            .await
            .get(symbol)
            .and_then(|until| until.checked_duration_since(Instant::now()))
    }
}
