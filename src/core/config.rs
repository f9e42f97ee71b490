use anyhow::Result;
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub binance: BinanceConfig,
    pub trading: TradingConfig,
    pub risk: RiskConfig,
    pub safety: SafetyConfig,
    pub telegram: TelegramConfig,
    pub storage: StorageConfig,
    pub monitoring: MonitoringConfig,
    pub coins: Vec<CoinConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinanceConfig {
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
    pub base_url: String,
    pub ws_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    pub default_margin_type: String,
    pub limit_order_expiry_secs: f64,
    pub cooldown_if_profit_secs: u64,
    pub cooldown_if_loss_secs: u64,
    pub safety_monitor_interval_secs: u64,
    pub error_sleep_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    pub use_dynamic_size: bool,
    pub risk_percent_per_trade: f64,
    pub min_order_usdt: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SafetyConfig {
    pub atr_multiplier_sl: f64,
    pub atr_multiplier_tp: f64,
    pub default_sl_percent: f64,
    pub default_tp_percent: f64,
    pub enable_trailing_stop: bool,
    pub use_native_trailing: bool,
    pub trailing_activation_threshold: f64,
    pub trailing_callback_rate: f64,
    pub trailing_min_profit_lock: f64,
    pub trailing_update_interval_secs: u64,
    pub trailing_activation_delay_secs: u64,
    pub native_trailing_min_rate: f64,
    pub native_trailing_max_rate: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub tracker_path: String,
    pub journal_db_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub health_port: u16,
    pub log_level: String,
}

/// Per-coin trading parameters. Leverage and the static entry size live here;
/// the category feeds portfolio-level exposure caps.
#[derive(Debug, Clone, Deserialize)]
pub struct CoinConfig {
    pub symbol: String,
    pub category: String,
    pub leverage: u32,
    pub amount_usdt: f64,
    pub price_precision: u32,
    pub quantity_precision: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let testnet = env_parse("BINANCE_TESTNET", true);

        Ok(Config {
            binance: BinanceConfig {
                api_key: env::var("BINANCE_API_KEY").unwrap_or_else(|_| "testnet_key".to_string()),
                api_secret: env::var("BINANCE_API_SECRET")
                    .unwrap_or_else(|_| "testnet_secret".to_string()),
                testnet,
                base_url: if testnet {
                    "https://testnet.binancefuture.com".to_string()
                } else {
                    "https://fapi.binance.com".to_string()
                },
                ws_url: if testnet {
                    "wss://stream.binancefuture.com".to_string()
                } else {
                    "wss://fstream.binance.com".to_string()
                },
            },
            trading: TradingConfig {
                default_margin_type: env::var("DEFAULT_MARGIN_TYPE")
                    .unwrap_or_else(|_| "ISOLATED".to_string()),
                limit_order_expiry_secs: env_parse("LIMIT_ORDER_EXPIRY_SECONDS", 7200.0),
                cooldown_if_profit_secs: env_parse("COOLDOWN_IF_PROFIT", 3600),
                cooldown_if_loss_secs: env_parse("COOLDOWN_IF_LOSS", 7200),
                safety_monitor_interval_secs: env_parse("SAFETY_MONITOR_INTERVAL", 20),
                error_sleep_delay_secs: env_parse("ERROR_SLEEP_DELAY", 10),
            },
            risk: RiskConfig {
                use_dynamic_size: env_parse("USE_DYNAMIC_SIZE", false),
                risk_percent_per_trade: env_parse("RISK_PERCENT_PER_TRADE", 3.0),
                min_order_usdt: env_parse("MIN_ORDER_USDT", 5.0),
            },
            safety: SafetyConfig {
                atr_multiplier_sl: env_parse("ATR_MULTIPLIER_SL", 1.0),
                atr_multiplier_tp: env_parse("ATR_MULTIPLIER_TP", 3.0),
                default_sl_percent: env_parse("DEFAULT_SL_PERCENT", 0.015),
                default_tp_percent: env_parse("DEFAULT_TP_PERCENT", 0.025),
                enable_trailing_stop: env_parse("ENABLE_TRAILING_STOP", true),
                use_native_trailing: env_parse("USE_NATIVE_TRAILING", false),
                trailing_activation_threshold: env_parse("TRAILING_ACTIVATION_THRESHOLD", 0.80),
                trailing_callback_rate: env_parse("TRAILING_CALLBACK_RATE", 0.001),
                trailing_min_profit_lock: env_parse("TRAILING_MIN_PROFIT_LOCK", 0.005),
                trailing_update_interval_secs: env_parse("TRAILING_SL_UPDATE_COOLDOWN", 3),
                trailing_activation_delay_secs: env_parse("TRAILING_ACTIVATION_DELAY", 60),
                native_trailing_min_rate: env_parse("NATIVE_TRAILING_MIN_RATE", 0.1),
                native_trailing_max_rate: env_parse("NATIVE_TRAILING_MAX_RATE", 5.0),
            },
            telegram: TelegramConfig {
                enabled: env_parse("TELEGRAM_ENABLED", false),
                bot_token: env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
                chat_id: env::var("TELEGRAM_CHAT_ID").unwrap_or_default(),
            },
            storage: StorageConfig {
                tracker_path: env::var("TRACKER_PATH")
                    .unwrap_or_else(|_| "safety_tracker.json".to_string()),
                journal_db_path: env::var("JOURNAL_DB_PATH")
                    .unwrap_or_else(|_| "trade_journal.db".to_string()),
            },
            monitoring: MonitoringConfig {
                health_port: env_parse("HEALTH_PORT", 3000),
                log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            },
            coins: parse_coin_list(&env::var("COIN_LIST").unwrap_or_else(|_| {
                "BTCUSDT:MAJOR:10:50:1:3,ETHUSDT:MAJOR:10:50:2:3".to_string()
            })),
        })
    }

    pub fn coin(&self, symbol: &str) -> Option<&CoinConfig> {
        self.coins.iter().find(|c| c.symbol == symbol)
    }

    pub fn coin_leverage(&self, symbol: &str) -> u32 {
        self.coin(symbol).map(|c| c.leverage).unwrap_or(1)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// COIN_LIST format: `SYMBOL:CATEGORY:LEVERAGE:AMOUNT_USDT:PRICE_PREC:QTY_PREC`,
/// comma separated. Malformed entries are skipped with a warning.
fn parse_coin_list(raw: &str) -> Vec<CoinConfig> {
    raw.split(',')
        .filter_map(|entry| {
            let parts: Vec<&str> = entry.trim().split(':').collect();
            if parts.len() != 6 {
                tracing::warn!("Skipping malformed COIN_LIST entry: {}", entry);
                return None;
            }
            Some(CoinConfig {
                symbol: parts[0].to_string(),
                category: parts[1].to_string(),
                leverage: parts[2].parse().ok()?,
                amount_usdt: parts[3].parse().ok()?,
                price_precision: parts[4].parse().ok()?,
                quantity_precision: parts[5].parse().ok()?,
            })
        })
        .collect()
}
