use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use binance_futures_trading_bot::api::{BinanceClient, ExchangeApi, UserStreamManager, MarkPriceStream};
use binance_futures_trading_bot::core::{logging, Config, HealthChecker};
use binance_futures_trading_bot::execution::{
    executor::safety_monitor_loop, EntryRequest, OrderExecutor, OrderUpdateHandler,
};
use binance_futures_trading_bot::monitoring::{Notifier, TradeJournal};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    logging::init_logging(&config.monitoring.log_level);

    tracing::info!("🚀 Binance Futures Trading Bot starting...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Testnet mode: {}", config.binance.testnet);

    let health_checker = Arc::new(HealthChecker::new());
    let health_clone = health_checker.clone();
    let health_port = config.monitoring.health_port;
    tokio::spawn(async move { start_health_server(health_clone, health_port).await });
    tracing::info!("✅ Health endpoint running on port {}", health_port);

    let client = Arc::new(BinanceClient::new(config.binance.clone()));
    match client.ping().await {
        Ok(true) => health_checker.update_component("binance_api", true).await,
        _ => tracing::warn!("⚠️ Binance API ping failed at startup"),
    }

    let notifier = Notifier::new(config.telegram.clone());

    // Journal is best-effort: a broken database must not stop trading.
    let journal = match TradeJournal::new(&config.storage.journal_db_path).await {
        Ok(journal) => {
            health_checker.update_component("journal", true).await;
            Some(Arc::new(journal))
        }
        Err(e) => {
            tracing::error!("❌ Journal unavailable, trades will not be recorded: {}", e);
            None
        }
    };

    let exchange: Arc<dyn ExchangeApi> = client.clone();
    let executor = Arc::new(OrderExecutor::new(
        exchange,
        config.clone(),
        notifier.clone(),
    ));

    let open_count = executor.sync_positions().await.unwrap_or(0);
    tracing::info!("📊 Initial position sync: {} open position(s)", open_count);

    let handler = Arc::new(OrderUpdateHandler::new(
        executor.clone(),
        journal,
        notifier.clone(),
        config.clone(),
    ));

    // User-data stream: the primary path for order lifecycle transitions.
    let listen_key = client.start_user_stream().await?;
    let (user_stream, mut user_events) = UserStreamManager::new();
    user_stream.connect(&config.binance.ws_url, &listen_key).await?;
    health_checker.update_component("user_stream", true).await;

    let keepalive_client = client.clone();
    let keepalive_key = listen_key.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30 * 60));
        interval.tick().await; // first tick fires immediately
        loop {
            interval.tick().await;
            if let Err(e) = keepalive_client.keepalive_user_stream(&keepalive_key).await {
                tracing::warn!("⚠️ Listen key keepalive failed: {}", e);
            }
        }
    });

    let event_handler = handler.clone();
    tokio::spawn(async move {
        while let Some(event) = user_events.recv().await {
            event_handler.handle_event(event).await;
        }
        tracing::warn!("User event channel closed");
    });

    // Mark-price ticks drive the software trailing stop.
    let (price_stream, mut price_ticks) = MarkPriceStream::new();
    price_stream.connect(&config.binance.ws_url).await?;

    let trailing_executor = executor.clone();
    let trailing_config = config.clone();
    tokio::spawn(async move {
        while let Some(tick) = price_ticks.recv().await {
            if trailing_config.coin(&tick.symbol).is_none() {
                continue;
            }
            if let Err(e) = trailing_executor
                .check_trailing_on_price(&tick.symbol, tick.price)
                .await
            {
                tracing::error!("Trailing check failed for {}: {}", tick.symbol, e);
            }
        }
        tracing::warn!("Price tick channel closed");
    });

    tokio::spawn(safety_monitor_loop(
        executor.clone(),
        Duration::from_secs(config.trading.safety_monitor_interval_secs),
        Duration::from_secs(config.trading.error_sleep_delay_secs),
    ));

    // Signal intake: the strategy engine feeds this channel. The sender is
    // held here so the channel stays open for the process lifetime.
    let (_signal_tx, mut signal_rx) = mpsc::channel::<EntryRequest>(64);
    tracing::info!("✅ Execution engine ready, waiting for strategy signals");

    while let Some(signal) = signal_rx.recv().await {
        if let Err(e) = executor.execute_entry(&signal).await {
            tracing::error!("❌ Entry failed for {}: {}", signal.symbol, e);
            notifier
                .send(&format!("❌ <b>ENTRY ERROR</b>\n{}: {}", signal.symbol, e))
                .await;
        }
    }

    Ok(())
}

async fn start_health_server(health_checker: Arc<HealthChecker>, port: u16) {
    use warp::Filter;

    let health = warp::path("health")
        .and(warp::any().map(move || health_checker.clone()))
        .and_then(|checker: Arc<HealthChecker>| async move {
            let status = checker.get_status().await;
            Ok::<_, warp::Rejection>(warp::reply::json(&status))
        });

    warp::serve(health).run(([0, 0, 0, 0], port)).await;
}
