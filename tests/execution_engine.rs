use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use binance_futures_trading_bot::api::{
    BinanceError, ExchangeApi, OpenOrder, OrderRequest, OrderResponse, OrderUpdate, PositionRisk,
    UserStreamEvent,
};
use binance_futures_trading_bot::core::config::{
    BinanceConfig, CoinConfig, Config, MonitoringConfig, RiskConfig, SafetyConfig, StorageConfig,
    TelegramConfig, TradingConfig,
};
use binance_futures_trading_bot::execution::{
    now_ts, EntryOrderType, EntryRequest, OrderExecutor, OrderUpdateHandler, PositionSide,
    PositionSnapshot, TradeStatus, TrackerEntry,
};
use binance_futures_trading_bot::monitoring::Notifier;

/// In-memory exchange double. State is inspectable so tests can assert on
/// exactly what the engine sent to the wire.
#[derive(Default)]
struct FakeExchange {
    positions: Mutex<Vec<PositionRisk>>,
    open_orders: Mutex<HashMap<String, Vec<OpenOrder>>>,
    placed: Mutex<Vec<OrderRequest>>,
    cancelled: Mutex<Vec<(String, String)>>,
    fail_order_types: Mutex<Vec<String>>,
    fail_cancel: AtomicBool,
    next_order_id: AtomicI64,
}

impl FakeExchange {
    fn new() -> Arc<Self> {
        let fake = Self::default();
        fake.next_order_id.store(1_000, Ordering::SeqCst);
        Arc::new(fake)
    }

    fn set_position(&self, symbol: &str, amt: f64, entry_price: f64) {
        self.positions.lock().unwrap().push(PositionRisk {
            symbol: symbol.to_string(),
            position_amt: amt,
            entry_price,
            mark_price: entry_price,
            un_realized_profit: 0.0,
            leverage: "10".to_string(),
        });
    }

    fn add_open_order(&self, symbol: &str, order_id: i64, order_type: &str) {
        self.open_orders
            .lock()
            .unwrap()
            .entry(symbol.to_string())
            .or_default()
            .push(OpenOrder {
                order_id,
                symbol: symbol.to_string(),
                order_type: order_type.to_string(),
                side: "BUY".to_string(),
                status: "NEW".to_string(),
                price: 0.0,
                stop_price: 0.0,
            });
    }

    fn fail_orders_of_type(&self, order_type: &str) {
        self.fail_order_types
            .lock()
            .unwrap()
            .push(order_type.to_string());
    }

    fn placed_of_type(&self, order_type: &str) -> Vec<OrderRequest> {
        self.placed
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.order_type == order_type)
            .cloned()
            .collect()
    }

    fn placed_count(&self) -> usize {
        self.placed.lock().unwrap().len()
    }
}

#[async_trait]
impl ExchangeApi for FakeExchange {
    async fn fetch_balance_usdt(&self) -> Result<f64, BinanceError> {
        Ok(1_000.0)
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionRisk>, BinanceError> {
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, BinanceError> {
        Ok(self
            .open_orders
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_mark_price(&self, _symbol: &str) -> Result<f64, BinanceError> {
        Ok(50_000.0)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse, BinanceError> {
        if self
            .fail_order_types
            .lock()
            .unwrap()
            .contains(&request.order_type)
        {
            return Err(BinanceError::Api {
                code: -2019,
                msg: "Margin is insufficient.".to_string(),
            });
        }
        self.placed.lock().unwrap().push(request.clone());
        Ok(OrderResponse {
            order_id: self.next_order_id.fetch_add(1, Ordering::SeqCst),
            symbol: request.symbol.clone(),
            status: "NEW".to_string(),
            client_order_id: request.new_client_order_id.clone(),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), BinanceError> {
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(BinanceError::Api {
                code: -2011,
                msg: "Unknown order sent.".to_string(),
            });
        }
        self.cancelled
            .lock()
            .unwrap()
            .push((symbol.to_string(), order_id.to_string()));
        Ok(())
    }

    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<(), BinanceError> {
        self.open_orders.lock().unwrap().remove(symbol);
        Ok(())
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), BinanceError> {
        Ok(())
    }

    async fn set_margin_type(&self, _symbol: &str, _margin_type: &str) -> Result<(), BinanceError> {
        // What the venue answers once the margin type is already in place.
        Err(BinanceError::Api {
            code: -4046,
            msg: "No need to change margin type.".to_string(),
        })
    }

    async fn start_user_stream(&self) -> Result<String, BinanceError> {
        Ok("listen-key".to_string())
    }

    async fn keepalive_user_stream(&self, _listen_key: &str) -> Result<(), BinanceError> {
        Ok(())
    }
}

fn test_config() -> Config {
    let tracker_path = std::env::temp_dir()
        .join(format!("exec_test_{}.json", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .to_string();

    Config {
        binance: BinanceConfig {
            api_key: "k".to_string(),
            api_secret: "s".to_string(),
            testnet: true,
            base_url: String::new(),
            ws_url: String::new(),
        },
        trading: TradingConfig {
            default_margin_type: "ISOLATED".to_string(),
            limit_order_expiry_secs: 7_200.0,
            cooldown_if_profit_secs: 3_600,
            cooldown_if_loss_secs: 7_200,
            safety_monitor_interval_secs: 20,
            error_sleep_delay_secs: 10,
        },
        risk: RiskConfig {
            use_dynamic_size: false,
            risk_percent_per_trade: 3.0,
            min_order_usdt: 5.0,
        },
        safety: SafetyConfig {
            atr_multiplier_sl: 1.0,
            atr_multiplier_tp: 3.0,
            default_sl_percent: 0.015,
            default_tp_percent: 0.025,
            enable_trailing_stop: true,
            use_native_trailing: false,
            trailing_activation_threshold: 0.80,
            trailing_callback_rate: 0.001,
            trailing_min_profit_lock: 0.005,
            trailing_update_interval_secs: 0,
            trailing_activation_delay_secs: 0,
            native_trailing_min_rate: 0.1,
            native_trailing_max_rate: 5.0,
        },
        telegram: TelegramConfig {
            enabled: false,
            bot_token: String::new(),
            chat_id: String::new(),
        },
        storage: StorageConfig {
            tracker_path,
            journal_db_path: "sqlite::memory:".to_string(),
        },
        monitoring: MonitoringConfig {
            health_port: 0,
            log_level: "debug".to_string(),
        },
        coins: vec![CoinConfig {
            symbol: "BTCUSDT".to_string(),
            category: "MAJOR".to_string(),
            leverage: 10,
            amount_usdt: 50.0,
            price_precision: 1,
            quantity_precision: 3,
        }],
    }
}

fn build_executor(fake: &Arc<FakeExchange>) -> (Arc<OrderExecutor>, Config) {
    let config = test_config();
    let client: Arc<dyn ExchangeApi> = fake.clone();
    let executor = Arc::new(OrderExecutor::new(
        client,
        config.clone(),
        Notifier::disabled(),
    ));
    (executor, config)
}

fn limit_entry(symbol: &str) -> EntryRequest {
    EntryRequest {
        symbol: symbol.to_string(),
        side: PositionSide::Long,
        order_type: EntryOrderType::Limit,
        price: Some(50_000.0),
        amount_usdt: 50.0,
        leverage: 10,
        strategy_tag: "pullback".to_string(),
        atr_value: 500.0,
        signal_reason: None,
        technical_data: serde_json::json!({}),
        config_snapshot: serde_json::json!({}),
    }
}

fn market_entry(symbol: &str) -> EntryRequest {
    EntryRequest {
        order_type: EntryOrderType::Market,
        price: None,
        ..limit_entry(symbol)
    }
}

#[tokio::test]
async fn market_submit_failure_leaves_no_tracker_entry() {
    let fake = FakeExchange::new();
    fake.fail_orders_of_type("MARKET");
    let (executor, _) = build_executor(&fake);

    let result = executor.execute_entry(&market_entry("BTCUSDT")).await;
    assert!(result.is_err());
    assert!(!executor.tracker.exists("BTCUSDT").await);
}

#[tokio::test]
async fn market_entry_records_pending_before_submit() {
    let fake = FakeExchange::new();
    let (executor, _) = build_executor(&fake);

    executor.execute_entry(&market_entry("BTCUSDT")).await.unwrap();

    assert_eq!(executor.tracker.status("BTCUSDT").await, TradeStatus::Pending);
    assert_eq!(fake.placed_of_type("MARKET").len(), 1);
}

#[tokio::test]
async fn limit_entry_records_waiting_with_expiry() {
    let fake = FakeExchange::new();
    let (executor, _) = build_executor(&fake);

    executor.execute_entry(&limit_entry("BTCUSDT")).await.unwrap();

    let entry = executor.tracker.get("BTCUSDT").await.unwrap();
    assert_eq!(entry.status, TradeStatus::WaitingEntry);
    assert_eq!(entry.entry_id.as_deref(), Some("1000"));
    let expires_at = entry.expires_at.unwrap();
    assert!(expires_at > now_ts() + 7_000.0 && expires_at < now_ts() + 7_300.0);
    assert!((entry.atr_value - 500.0).abs() < 1e-9);
}

#[tokio::test]
async fn busy_symbol_rejects_second_entry() {
    let fake = FakeExchange::new();
    fake.set_position("BTCUSDT", 0.01, 50_000.0);
    let (executor, _) = build_executor(&fake);
    executor.sync_positions().await.unwrap();

    assert!(executor.is_symbol_busy("BTCUSDT").await);
    executor.execute_entry(&limit_entry("BTCUSDT")).await.unwrap();
    assert_eq!(fake.placed_count(), 0, "no order may reach the exchange");
}

#[tokio::test]
async fn pending_tracker_entry_also_counts_as_busy() {
    let fake = FakeExchange::new();
    let (executor, _) = build_executor(&fake);

    executor
        .tracker
        .set(
            "BTCUSDT",
            TrackerEntry {
                status: TradeStatus::WaitingEntry,
                entry_id: Some("7".to_string()),
                ..Default::default()
            },
        )
        .await;

    assert!(executor.is_symbol_busy("BTCUSDT").await);
    executor.execute_entry(&limit_entry("BTCUSDT")).await.unwrap();
    assert_eq!(fake.placed_count(), 0);
}

#[tokio::test]
async fn sync_is_idempotent_when_nothing_drifted() {
    let fake = FakeExchange::new();
    fake.add_open_order("BTCUSDT", 1_000, "LIMIT");
    let (executor, _) = build_executor(&fake);

    executor
        .tracker
        .set(
            "BTCUSDT",
            TrackerEntry {
                status: TradeStatus::WaitingEntry,
                entry_id: Some("1000".to_string()),
                expires_at: Some(now_ts() + 7_200.0),
                ..Default::default()
            },
        )
        .await;

    executor.sync_pending_orders().await.unwrap();
    executor.sync_pending_orders().await.unwrap();

    let entry = executor.tracker.get("BTCUSDT").await.unwrap();
    assert_eq!(entry.status, TradeStatus::WaitingEntry);
    assert!(fake.cancelled.lock().unwrap().is_empty());
    assert_eq!(fake.placed_count(), 0);
}

#[tokio::test]
async fn expired_entry_is_cleaned_even_when_cancel_fails() {
    let fake = FakeExchange::new();
    fake.fail_cancel.store(true, Ordering::SeqCst);
    fake.add_open_order("BTCUSDT", 55, "LIMIT");
    let (executor, _) = build_executor(&fake);

    executor
        .tracker
        .set(
            "BTCUSDT",
            TrackerEntry {
                status: TradeStatus::WaitingEntry,
                entry_id: Some("55".to_string()),
                expires_at: Some(now_ts() - 10.0),
                ..Default::default()
            },
        )
        .await;

    executor.sync_pending_orders().await.unwrap();

    // The goal is "stop believing in this order", not "exchange confirms".
    assert!(!executor.tracker.exists("BTCUSDT").await);
}

#[tokio::test]
async fn vanished_order_with_position_becomes_pending() {
    let fake = FakeExchange::new();
    fake.set_position("BTCUSDT", 0.01, 50_000.0);
    let (executor, _) = build_executor(&fake);
    executor.sync_positions().await.unwrap();

    executor
        .tracker
        .set(
            "BTCUSDT",
            TrackerEntry {
                status: TradeStatus::WaitingEntry,
                entry_id: Some("777".to_string()),
                expires_at: Some(now_ts() + 7_200.0),
                ..Default::default()
            },
        )
        .await;

    executor.sync_pending_orders().await.unwrap();
    assert_eq!(executor.tracker.status("BTCUSDT").await, TradeStatus::Pending);
}

#[tokio::test]
async fn vanished_order_without_position_is_deleted() {
    let fake = FakeExchange::new();
    let (executor, _) = build_executor(&fake);

    executor
        .tracker
        .set(
            "BTCUSDT",
            TrackerEntry {
                status: TradeStatus::WaitingEntry,
                entry_id: Some("777".to_string()),
                expires_at: Some(now_ts() + 7_200.0),
                ..Default::default()
            },
        )
        .await;

    executor.sync_pending_orders().await.unwrap();
    assert!(!executor.tracker.exists("BTCUSDT").await);
}

#[tokio::test]
async fn safety_install_uses_atr_distances_and_secures() {
    let fake = FakeExchange::new();
    let (executor, _) = build_executor(&fake);

    executor
        .tracker
        .set(
            "BTCUSDT",
            TrackerEntry {
                status: TradeStatus::Pending,
                atr_value: 500.0,
                side: Some(PositionSide::Long),
                ..Default::default()
            },
        )
        .await;

    let position = PositionSnapshot {
        symbol: "BTCUSDT".to_string(),
        contracts: 0.01,
        side: PositionSide::Long,
        entry_price: 50_000.0,
    };
    executor
        .safety
        .install_safety_orders("BTCUSDT", &position)
        .await
        .unwrap();

    let stops = fake.placed_of_type("STOP_MARKET");
    let tps = fake.placed_of_type("TAKE_PROFIT_MARKET");
    assert_eq!(stops.len(), 1);
    assert_eq!(tps.len(), 1);
    assert_eq!(stops[0].stop_price.as_deref(), Some("49500.0"));
    assert_eq!(tps[0].stop_price.as_deref(), Some("51500.0"));
    assert!(stops[0].close_position && tps[0].close_position);
    assert_eq!(stops[0].side, "SELL");

    let entry = executor.tracker.get("BTCUSDT").await.unwrap();
    assert_eq!(entry.status, TradeStatus::Secured);
    assert!(entry.sl_order_id.is_some() && entry.tp_order_id.is_some());
    assert!((entry.sl_price_initial - 49_500.0).abs() < 1e-9);
    assert!((entry.tp_price - 51_500.0).abs() < 1e-9);
}

#[tokio::test]
async fn safety_cycle_does_not_reinstall_secured_positions() {
    let fake = FakeExchange::new();
    fake.set_position("BTCUSDT", 0.01, 50_000.0);
    let (executor, _) = build_executor(&fake);

    executor.run_safety_cycle().await.unwrap();
    let after_first = fake.placed_count();
    assert_eq!(after_first, 2); // SL + TP

    executor.run_safety_cycle().await.unwrap();
    assert_eq!(fake.placed_count(), after_first, "second pass must be a no-op");
    assert_eq!(executor.tracker.status("BTCUSDT").await, TradeStatus::Secured);
}

#[tokio::test]
async fn partial_safety_failure_is_surfaced_and_retried() {
    let fake = FakeExchange::new();
    fake.fail_orders_of_type("TAKE_PROFIT_MARKET");
    fake.set_position("BTCUSDT", 0.01, 50_000.0);
    let (executor, _) = build_executor(&fake);

    executor
        .tracker
        .set(
            "BTCUSDT",
            TrackerEntry {
                status: TradeStatus::Pending,
                atr_value: 500.0,
                side: Some(PositionSide::Long),
                ..Default::default()
            },
        )
        .await;

    // First cycle: SL goes out, TP fails, entry falls back to PENDING.
    executor.run_safety_cycle().await.unwrap();
    assert_eq!(fake.placed_of_type("STOP_MARKET").len(), 1);
    assert_eq!(executor.tracker.status("BTCUSDT").await, TradeStatus::Pending);

    // Next cycle retries and completes once the venue accepts TPs again.
    fake.fail_order_types.lock().unwrap().clear();
    executor.run_safety_cycle().await.unwrap();
    assert_eq!(executor.tracker.status("BTCUSDT").await, TradeStatus::Secured);
}

#[tokio::test]
async fn trailing_sl_never_loosens_under_oscillation() {
    let fake = FakeExchange::new();
    let (executor, _) = build_executor(&fake);

    executor
        .tracker
        .set(
            "BTCUSDT",
            TrackerEntry {
                status: TradeStatus::Secured,
                side: Some(PositionSide::Long),
                entry_price: 50_000.0,
                tp_price: 51_500.0,
                trailing_active: true,
                trailing_sl: 50_250.0,
                trailing_high: 50_300.0,
                ..Default::default()
            },
        )
        .await;

    let ticks = [50_500.0, 50_400.0, 50_800.0, 50_600.0, 51_000.0, 50_100.0];
    let mut last_sl = 50_250.0;
    for price in ticks {
        executor
            .safety
            .update_trailing_sl("BTCUSDT", price)
            .await
            .unwrap();
        let entry = executor.tracker.get("BTCUSDT").await.unwrap();
        assert!(
            entry.trailing_sl >= last_sl,
            "ratchet loosened: {} -> {} on tick {}",
            last_sl,
            entry.trailing_sl,
            price
        );
        last_sl = entry.trailing_sl;
    }

    // Final stop tracks the highest watermark seen, not the last price.
    let entry = executor.tracker.get("BTCUSDT").await.unwrap();
    assert!((entry.trailing_high - 51_000.0).abs() < 1e-9);
    assert!((entry.trailing_sl - 51_000.0 * 0.999).abs() < 1e-6);
}

#[tokio::test]
async fn profitable_close_sets_the_shorter_cooldown() {
    let fake = FakeExchange::new();
    let (executor, config) = build_executor(&fake);

    executor
        .tracker
        .set(
            "BTCUSDT",
            TrackerEntry {
                status: TradeStatus::Secured,
                side: Some(PositionSide::Long),
                entry_price: 50_000.0,
                order_type: Some("LIMIT".to_string()),
                ..Default::default()
            },
        )
        .await;

    let handler = OrderUpdateHandler::new(
        executor.clone(),
        None,
        Notifier::disabled(),
        config,
    );

    handler
        .handle_event(UserStreamEvent::OrderTradeUpdate(OrderUpdate {
            symbol: "BTCUSDT".to_string(),
            order_id: 9_001,
            status: "FILLED".to_string(),
            order_type: "TAKE_PROFIT_MARKET".to_string(),
            side: "SELL".to_string(),
            avg_price: 51_500.0,
            qty: 0.01,
            realized_pnl: 15.0,
            commission: 0.02,
        }))
        .await;

    // Entry is gone and the cooldown is the profit one (3600s), not 7200s.
    assert!(!executor.tracker.exists("BTCUSDT").await);
    let remaining = executor
        .risk
        .remaining_cooldown("BTCUSDT")
        .await
        .expect("cooldown must be set");
    assert!(remaining.as_secs() > 3_500 && remaining.as_secs() <= 3_600);
}

#[tokio::test]
async fn cancel_event_for_foreign_order_is_ignored() {
    let fake = FakeExchange::new();
    let (executor, config) = build_executor(&fake);

    executor
        .tracker
        .set(
            "BTCUSDT",
            TrackerEntry {
                status: TradeStatus::WaitingEntry,
                entry_id: Some("1234".to_string()),
                ..Default::default()
            },
        )
        .await;

    let handler = OrderUpdateHandler::new(
        executor.clone(),
        None,
        Notifier::disabled(),
        config,
    );

    // A stray safety order cancel must not touch the tracked entry.
    handler
        .handle_event(UserStreamEvent::OrderTradeUpdate(OrderUpdate {
            symbol: "BTCUSDT".to_string(),
            order_id: 9_999,
            status: "CANCELED".to_string(),
            order_type: "STOP_MARKET".to_string(),
            side: "SELL".to_string(),
            avg_price: 0.0,
            qty: 0.0,
            realized_pnl: 0.0,
            commission: 0.0,
        }))
        .await;
    assert!(executor.tracker.exists("BTCUSDT").await);

    // The matching id is what deletes it.
    handler
        .handle_event(UserStreamEvent::OrderTradeUpdate(OrderUpdate {
            symbol: "BTCUSDT".to_string(),
            order_id: 1_234,
            status: "CANCELED".to_string(),
            order_type: "LIMIT".to_string(),
            side: "BUY".to_string(),
            avg_price: 0.0,
            qty: 0.0,
            realized_pnl: 0.0,
            commission: 0.0,
        }))
        .await;
    assert!(!executor.tracker.exists("BTCUSDT").await);
}
