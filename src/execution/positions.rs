use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::api::ExchangeApi;
use crate::core::config::CoinConfig;

use super::tracker::PositionSide;
use super::base_currency;

#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub contracts: f64,
    pub side: PositionSide,
    pub entry_price: f64,
}

/// Mirror of the exchange's open positions, keyed by base currency. The
/// cache is rebuilt wholesale on every sync, never patched, so a closed
/// position is guaranteed to disappear even when its close event was missed.
pub struct PositionManager {
    client: Arc<dyn ExchangeApi>,
    coins: Vec<CoinConfig>,
    cache: RwLock<HashMap<String, PositionSnapshot>>,
}

impl PositionManager {
    pub fn new(client: Arc<dyn ExchangeApi>, coins: Vec<CoinConfig>) -> Self {
        Self {
            client,
            coins,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch all open positions and replace the cache in full. Returns the
    /// number of open positions.
    pub async fn sync(&self) -> Result<usize> {
        let positions = self.client.fetch_positions().await?;

        let mut new_cache = HashMap::new();
        for position in positions {
            if position.position_amt.abs() < f64::EPSILON {
                continue;
            }
            let side = if position.position_amt > 0.0 {
                PositionSide::Long
            } else {
                PositionSide::Short
            };
            new_cache.insert(
                base_currency(&position.symbol).to_string(),
                PositionSnapshot {
                    symbol: position.symbol.clone(),
                    contracts: position.position_amt.abs(),
                    side,
                    entry_price: position.entry_price,
                },
            );
        }

        let count = new_cache.len();
        *self.cache.write().await = new_cache;
        Ok(count)
    }

    pub async fn get_position(&self, base: &str) -> Option<PositionSnapshot> {
        self.cache.read().await.get(base).cloned()
    }

    pub async fn has_position(&self, symbol: &str) -> bool {
        self.cache
            .read()
            .await
            .contains_key(base_currency(symbol))
    }

    pub async fn open_positions(&self) -> Vec<PositionSnapshot> {
        self.cache.read().await.values().cloned().collect()
    }

    /// Portfolio-level exposure cap input: open positions whose configured
    /// category matches. Unconfigured symbols count as no category.
    pub async fn get_open_positions_count_by_category(&self, target_category: &str) -> usize {
        let cache = self.cache.read().await;
        cache
            .values()
            .filter(|position| {
                self.coins
                    .iter()
                    .find(|c| c.symbol == position.symbol)
                    .map(|c| c.category == target_category)
                    .unwrap_or(false)
            })
            .count()
    }
}
