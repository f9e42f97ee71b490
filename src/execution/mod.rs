pub mod executor;
pub mod order_updates;
pub mod orders;
pub mod positions;
pub mod risk;
pub mod safety;
pub mod sync;
pub mod tracker;

pub use executor::OrderExecutor;
pub use order_updates::OrderUpdateHandler;
pub use orders::{EntryOrderType, EntryRequest, OrderManager};
pub use positions::{PositionManager, PositionSnapshot};
pub use risk::RiskManager;
pub use safety::SafetyManager;
pub use sync::OrderSyncManager;
pub use tracker::{PositionSide, TradeStatus, TradeTracker, TrackerEntry};

/// Unix timestamp in fractional seconds, the unit the tracker persists.
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// "BTCUSDT" -> "BTC". The position cache is keyed by base currency.
pub fn base_currency(symbol: &str) -> &str {
    symbol.strip_suffix("USDT").unwrap_or(symbol)
}

/// Round to a fixed number of decimals, exchange-filter style.
pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}
