use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Binance futures sends most numbers as JSON strings.
pub mod str_f64 {
    use serde::{Deserialize, Deserializer};

    pub fn de<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<f64>().map_err(serde::de::Error::custom)
    }
}

/// Render a value with a fixed number of decimals, the futures-API
/// equivalent of ccxt's `price_to_precision`.
pub fn fmt_decimal(value: f64, precision: u32) -> String {
    format!("{:.*}", precision as usize, value)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetBalance {
    pub asset: String,
    #[serde(deserialize_with = "str_f64::de")]
    pub balance: f64,
    #[serde(deserialize_with = "str_f64::de")]
    pub available_balance: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    /// Signed quantity: positive = long, negative = short.
    #[serde(deserialize_with = "str_f64::de")]
    pub position_amt: f64,
    #[serde(deserialize_with = "str_f64::de")]
    pub entry_price: f64,
    #[serde(default, deserialize_with = "str_f64::de")]
    pub mark_price: f64,
    #[serde(default, deserialize_with = "str_f64::de")]
    pub un_realized_profit: f64,
    #[serde(default)]
    pub leverage: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub order_id: i64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: String,
    pub status: String,
    #[serde(default, deserialize_with = "str_f64::de")]
    pub price: f64,
    #[serde(default, deserialize_with = "str_f64::de")]
    pub stop_price: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub symbol: String,
    pub status: String,
    pub client_order_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PremiumIndex {
    pub symbol: String,
    #[serde(deserialize_with = "str_f64::de")]
    pub mark_price: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenKeyResponse {
    pub listen_key: String,
}

/// Outbound order. Quantities and prices are pre-formatted strings so the
/// per-coin precision is applied once, at the call site that knows it.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub quantity: Option<String>,
    pub price: Option<String>,
    pub stop_price: Option<String>,
    pub close_position: bool,
    pub reduce_only: bool,
    pub callback_rate: Option<String>,
    pub activation_price: Option<String>,
    pub time_in_force: Option<String>,
    pub working_type: Option<String>,
    pub new_client_order_id: String,
}

impl OrderRequest {
    fn base(symbol: &str, side: &str, order_type: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: side.to_string(),
            order_type: order_type.to_string(),
            quantity: None,
            price: None,
            stop_price: None,
            close_position: false,
            reduce_only: false,
            callback_rate: None,
            activation_price: None,
            time_in_force: None,
            working_type: None,
            new_client_order_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn market(symbol: &str, side: &str, quantity: String) -> Self {
        Self {
            quantity: Some(quantity),
            ..Self::base(symbol, side, "MARKET")
        }
    }

    pub fn limit(symbol: &str, side: &str, quantity: String, price: String) -> Self {
        Self {
            quantity: Some(quantity),
            price: Some(price),
            time_in_force: Some("GTC".to_string()),
            ..Self::base(symbol, side, "LIMIT")
        }
    }

    /// Stop-loss leg: close the whole position when the mark price trips.
    pub fn stop_market_close(symbol: &str, side: &str, stop_price: String) -> Self {
        Self {
            stop_price: Some(stop_price),
            close_position: true,
            working_type: Some("MARK_PRICE".to_string()),
            ..Self::base(symbol, side, "STOP_MARKET")
        }
    }

    /// Take-profit leg: close-position semantics on the last traded price.
    pub fn take_profit_market_close(symbol: &str, side: &str, stop_price: String) -> Self {
        Self {
            stop_price: Some(stop_price),
            close_position: true,
            working_type: Some("CONTRACT_PRICE".to_string()),
            ..Self::base(symbol, side, "TAKE_PROFIT_MARKET")
        }
    }

    /// Exchange-managed trailing stop. `callback_rate` is a percent already
    /// clamped to the venue's permitted range.
    pub fn trailing_stop(
        symbol: &str,
        side: &str,
        quantity: String,
        callback_rate: f64,
        activation_price: Option<String>,
    ) -> Self {
        Self {
            quantity: Some(quantity),
            reduce_only: true,
            callback_rate: Some(format!("{:.1}", callback_rate)),
            activation_price,
            working_type: Some("MARK_PRICE".to_string()),
            ..Self::base(symbol, side, "TRAILING_STOP_MARKET")
        }
    }

    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("symbol", self.symbol.clone()),
            ("side", self.side.clone()),
            ("type", self.order_type.clone()),
            ("newClientOrderId", self.new_client_order_id.clone()),
        ];
        if let Some(quantity) = &self.quantity {
            params.push(("quantity", quantity.clone()));
        }
        if let Some(price) = &self.price {
            params.push(("price", price.clone()));
        }
        if let Some(stop_price) = &self.stop_price {
            params.push(("stopPrice", stop_price.clone()));
        }
        if self.close_position {
            params.push(("closePosition", "true".to_string()));
        }
        if self.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        if let Some(callback_rate) = &self.callback_rate {
            params.push(("callbackRate", callback_rate.clone()));
        }
        if let Some(activation_price) = &self.activation_price {
            params.push(("activationPrice", activation_price.clone()));
        }
        if let Some(time_in_force) = &self.time_in_force {
            params.push(("timeInForce", time_in_force.clone()));
        }
        if let Some(working_type) = &self.working_type {
            params.push(("workingType", working_type.clone()));
        }
        params
    }
}

/// One `ORDER_TRADE_UPDATE` payload (the inner `o` object).
#[derive(Debug, Clone, Deserialize)]
pub struct OrderUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "i")]
    pub order_id: i64,
    #[serde(rename = "X")]
    pub status: String,
    #[serde(rename = "o")]
    pub order_type: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "ap", default, deserialize_with = "str_f64::de")]
    pub avg_price: f64,
    #[serde(rename = "q", default, deserialize_with = "str_f64::de")]
    pub qty: f64,
    #[serde(rename = "rp", default, deserialize_with = "str_f64::de")]
    pub realized_pnl: f64,
    #[serde(rename = "n", default, deserialize_with = "str_f64::de")]
    pub commission: f64,
}

#[derive(Debug, Clone)]
pub enum UserStreamEvent {
    OrderTradeUpdate(OrderUpdate),
    AccountUpdate,
    ListenKeyExpired,
}

#[derive(Debug, Clone)]
pub struct PriceTick {
    pub symbol: String,
    pub price: f64,
}
