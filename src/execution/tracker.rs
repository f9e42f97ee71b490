use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens this position.
    pub fn entry_order_side(&self) -> &'static str {
        match self {
            PositionSide::Long => "BUY",
            PositionSide::Short => "SELL",
        }
    }

    /// Order side that reduces/closes this position.
    pub fn closing_order_side(&self) -> &'static str {
        match self {
            PositionSide::Long => "SELL",
            PositionSide::Short => "BUY",
        }
    }

    pub fn from_entry_order_side(side: &str) -> Self {
        if side.eq_ignore_ascii_case("BUY") {
            PositionSide::Long
        } else {
            PositionSide::Short
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Per-symbol lifecycle. Transitions only move forward; reconciliation may
/// delete an entry early or reset it to an earlier status, never strand it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    #[default]
    None,
    /// Limit entry resting on the book, not yet filled.
    WaitingEntry,
    /// Filled (or market-submitted) and waiting for safety orders.
    Pending,
    /// Safety install in flight for this symbol.
    Processing,
    /// SL/TP live on the exchange; software trailing may be active.
    Secured,
    /// Protection handed off to an exchange-native trailing order.
    SecuredNative,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TrackerEntry {
    pub status: TradeStatus,
    pub entry_id: Option<String>,
    pub created_at: f64,
    pub filled_at: Option<f64>,
    pub expires_at: Option<f64>,
    pub side: Option<PositionSide>,
    pub entry_price: f64,
    /// Type of the ENTRY order. The closing order type arrives later with
    /// the close event and must not overwrite this.
    pub order_type: Option<String>,
    /// Volatility snapshot taken at signal time; safety sizing keeps using
    /// it even after the live feed has moved on.
    pub atr_value: f64,
    pub sl_price_initial: f64,
    pub tp_price: f64,
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub trailing_active: bool,
    pub trailing_sl: f64,
    pub trailing_high: f64,
    pub trailing_low: f64,
    pub activation_price: f64,
    pub native_trailing_id: Option<String>,
    // Opaque provenance, passed through to the journal untouched.
    pub strategy: String,
    pub signal_reason: Option<String>,
    pub technical_data: serde_json::Value,
    pub config_snapshot: serde_json::Value,
    pub last_check: f64,
}

/// Durable per-symbol trade state, the single source of truth for "what
/// state is this symbol's trade in". Every mutation is followed by a
/// `save()` call at the call site, so a crash leaves the file consistent
/// with the last attempted action.
pub struct TradeTracker {
    path: PathBuf,
    entries: RwLock<HashMap<String, TrackerEntry>>,
}

impl TradeTracker {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, TrackerEntry>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    tracing::error!("Failed to parse tracker file {:?}: {}", path, e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        if !entries.is_empty() {
            tracing::info!("📂 Tracker loaded: {} active symbol(s)", entries.len());
        }

        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    pub async fn get(&self, symbol: &str) -> Option<TrackerEntry> {
        self.entries.read().await.get(symbol).cloned()
    }

    pub async fn set(&self, symbol: &str, entry: TrackerEntry) {
        self.entries.write().await.insert(symbol.to_string(), entry);
    }

    /// Apply a partial update in place. Returns false if the entry vanished,
    /// which callers must treat as "another task already resolved this".
    pub async fn update<F>(&self, symbol: &str, apply: F) -> bool
    where
        F: FnOnce(&mut TrackerEntry),
    {
        let mut entries = self.entries.write().await;
        match entries.get_mut(symbol) {
            Some(entry) => {
                apply(entry);
                true
            }
            None => false,
        }
    }

    pub async fn delete(&self, symbol: &str) -> bool {
        self.entries.write().await.remove(symbol).is_some()
    }

    pub async fn exists(&self, symbol: &str) -> bool {
        self.entries.read().await.contains_key(symbol)
    }

    pub async fn status(&self, symbol: &str) -> TradeStatus {
        self.entries
            .read()
            .await
            .get(symbol)
            .map(|e| e.status)
            .unwrap_or(TradeStatus::None)
    }

    pub async fn symbols_with_status(&self, status: TradeStatus) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.status == status)
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    /// Full-dump persist. Idempotent, last-write-wins; the write itself runs
    /// on a blocking thread so the event loop never stalls on disk I/O.
    pub async fn save(&self) {
        let entries = self.entries.read().await.clone();
        let path = self.path.clone();

        let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let json = serde_json::to_string_pretty(&entries)?;
            std::fs::write(&path, json)?;
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("⚠️ Failed to save tracker: {}", e),
            Err(e) => tracing::error!("⚠️ Tracker save task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_tracker_path() -> PathBuf {
        std::env::temp_dir().join(format!("tracker_test_{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_crud_and_status() {
        let tracker = TradeTracker::load(temp_tracker_path());

        assert!(!tracker.exists("BTCUSDT").await);
        assert_eq!(tracker.status("BTCUSDT").await, TradeStatus::None);

        tracker
            .set(
                "BTCUSDT",
                TrackerEntry {
                    status: TradeStatus::WaitingEntry,
                    entry_id: Some("42".to_string()),
                    ..Default::default()
                },
            )
            .await;

        assert!(tracker.exists("BTCUSDT").await);
        assert_eq!(tracker.status("BTCUSDT").await, TradeStatus::WaitingEntry);
        assert_eq!(
            tracker.symbols_with_status(TradeStatus::WaitingEntry).await,
            vec!["BTCUSDT".to_string()]
        );

        let updated = tracker
            .update("BTCUSDT", |e| e.status = TradeStatus::Pending)
            .await;
        assert!(updated);
        assert_eq!(tracker.status("BTCUSDT").await, TradeStatus::Pending);

        assert!(tracker.delete("BTCUSDT").await);
        assert!(!tracker.delete("BTCUSDT").await);
        assert!(!tracker.update("BTCUSDT", |e| e.trailing_active = true).await);
    }

    #[tokio::test]
    async fn test_save_and_reload_roundtrip() {
        let path = temp_tracker_path();

        let tracker = TradeTracker::load(&path);
        tracker
            .set(
                "ETHUSDT",
                TrackerEntry {
                    status: TradeStatus::Secured,
                    side: Some(PositionSide::Short),
                    entry_price: 3000.0,
                    atr_value: 25.0,
                    sl_price_initial: 3025.0,
                    tp_price: 2925.0,
                    strategy: "pullback".to_string(),
                    ..Default::default()
                },
            )
            .await;
        tracker.save().await;

        let reloaded = TradeTracker::load(&path);
        let entry = reloaded.get("ETHUSDT").await.expect("entry survives reload");
        assert_eq!(entry.status, TradeStatus::Secured);
        assert_eq!(entry.side, Some(PositionSide::Short));
        assert!((entry.tp_price - 2925.0).abs() < 1e-9);
        assert_eq!(entry.strategy, "pullback");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_status_serialization_format() {
        let json = serde_json::to_string(&TradeStatus::WaitingEntry).unwrap();
        assert_eq!(json, "\"WAITING_ENTRY\"");
        let json = serde_json::to_string(&TradeStatus::SecuredNative).unwrap();
        assert_eq!(json, "\"SECURED_NATIVE\"");
    }
}
