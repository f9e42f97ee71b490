use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;

/// One row per terminal trade outcome, written exactly once: when the
/// position closes or the entry order dies without filling.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: String,
    pub entry_type: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size_usdt: f64,
    pub pnl_usdt: f64,
    pub roi_percent: f64,
    pub fee: f64,
    /// WIN / LOSS for closes, CANCELLED / TIMEOUT for never-filled entries.
    pub result: String,
    pub exit_type: String,
    pub strategy_tag: String,
    pub signal_reason: String,
    pub setup_at: String,
    pub filled_at: String,
    pub closed_at: String,
    pub trailing_was_active: bool,
    pub trailing_sl_final: f64,
    pub trailing_high: f64,
    pub trailing_low: f64,
    pub activation_price: f64,
    pub sl_price_initial: f64,
    pub technical_data: String,
    pub config_snapshot: String,
}

pub struct TradeJournal {
    pool: SqlitePool,
}

impl TradeJournal {
    pub async fn new(database_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let connection_string = if database_path.starts_with("sqlite:") {
            database_path.to_string()
        } else {
            format!("sqlite://{}?mode=rwc", database_path)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&connection_string)
            .await?;

        let journal = Self { pool };
        journal.initialize_schema().await?;

        Ok(journal)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_type TEXT NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                size_usdt REAL NOT NULL,
                pnl_usdt REAL NOT NULL,
                roi_percent REAL NOT NULL,
                fee REAL NOT NULL,
                result TEXT NOT NULL,
                exit_type TEXT NOT NULL,
                strategy_tag TEXT NOT NULL,
                signal_reason TEXT NOT NULL DEFAULT '',
                setup_at TEXT NOT NULL DEFAULT '',
                filled_at TEXT NOT NULL DEFAULT '',
                closed_at TEXT NOT NULL DEFAULT '',
                trailing_was_active INTEGER NOT NULL DEFAULT 0,
                trailing_sl_final REAL NOT NULL DEFAULT 0,
                trailing_high REAL NOT NULL DEFAULT 0,
                trailing_low REAL NOT NULL DEFAULT 0,
                activation_price REAL NOT NULL DEFAULT 0,
                sl_price_initial REAL NOT NULL DEFAULT 0,
                technical_data TEXT NOT NULL DEFAULT '{}',
                config_snapshot TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_trades_symbol
            ON trades(symbol, closed_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("✅ Trade journal schema initialized");

        Ok(())
    }

    pub async fn log_trade(&self, record: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                symbol, side, entry_type, entry_price, exit_price, size_usdt,
                pnl_usdt, roi_percent, fee, result, exit_type, strategy_tag,
                signal_reason, setup_at, filled_at, closed_at,
                trailing_was_active, trailing_sl_final, trailing_high,
                trailing_low, activation_price, sl_price_initial,
                technical_data, config_snapshot
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.symbol)
        .bind(&record.side)
        .bind(&record.entry_type)
        .bind(record.entry_price)
        .bind(record.exit_price)
        .bind(record.size_usdt)
        .bind(record.pnl_usdt)
        .bind(record.roi_percent)
        .bind(record.fee)
        .bind(&record.result)
        .bind(&record.exit_type)
        .bind(&record.strategy_tag)
        .bind(&record.signal_reason)
        .bind(&record.setup_at)
        .bind(&record.filled_at)
        .bind(&record.closed_at)
        .bind(record.trailing_was_active)
        .bind(record.trailing_sl_final)
        .bind(record.trailing_high)
        .bind(record.trailing_low)
        .bind(record.activation_price)
        .bind(record.sl_price_initial)
        .bind(&record.technical_data)
        .bind(&record.config_snapshot)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn recent_trades(&self, limit: i64) -> Result<Vec<TradeRecord>> {
        let trades = sqlx::query_as::<_, TradeRecord>(
            r#"
            SELECT symbol, side, entry_type, entry_price, exit_price, size_usdt,
                   pnl_usdt, roi_percent, fee, result, exit_type, strategy_tag,
                   signal_reason, setup_at, filled_at, closed_at,
                   trailing_was_active, trailing_sl_final, trailing_high,
                   trailing_low, activation_price, sl_price_initial,
                   technical_data, config_snapshot
            FROM trades ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(trades)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(symbol: &str, pnl: f64) -> TradeRecord {
        TradeRecord {
            symbol: symbol.to_string(),
            side: "LONG".to_string(),
            entry_type: "LIMIT".to_string(),
            entry_price: 50_000.0,
            exit_price: 51_500.0,
            size_usdt: 500.0,
            pnl_usdt: pnl,
            roi_percent: 30.0,
            fee: 0.2,
            result: if pnl > 0.0 { "WIN" } else { "LOSS" }.to_string(),
            exit_type: "TAKE_PROFIT".to_string(),
            strategy_tag: "pullback".to_string(),
            signal_reason: String::new(),
            setup_at: "2024-01-01T00:00:00Z".to_string(),
            filled_at: "2024-01-01T00:05:00Z".to_string(),
            closed_at: "2024-01-01T02:00:00Z".to_string(),
            trailing_was_active: false,
            trailing_sl_final: 0.0,
            trailing_high: 0.0,
            trailing_low: 0.0,
            activation_price: 0.0,
            sl_price_initial: 49_500.0,
            technical_data: "{}".to_string(),
            config_snapshot: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_log_and_read_back() {
        // A file-backed db: with `sqlite::memory:` every pooled connection
        // would get its own empty database.
        let path = std::env::temp_dir().join(format!("journal_test_{}.db", uuid::Uuid::new_v4()));
        let journal = TradeJournal::new(&path.to_string_lossy()).await.unwrap();

        journal.log_trade(&record("BTCUSDT", 15.0)).await.unwrap();
        journal.log_trade(&record("ETHUSDT", -7.5)).await.unwrap();

        let trades = journal.recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 2);
        // newest first
        assert_eq!(trades[0].symbol, "ETHUSDT");
        assert_eq!(trades[0].result, "LOSS");
        assert_eq!(trades[1].exit_type, "TAKE_PROFIT");

        std::fs::remove_file(&path).ok();
    }
}
