use anyhow::Result;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::types::{OrderUpdate, PriceTick, UserStreamEvent};

/// Reads the authenticated user-data stream (order/account lifecycle events)
/// and fans parsed events out over a channel. This is the primary, lowest
/// latency path for state transitions; the polling loops only cover for
/// events this stream drops.
pub struct UserStreamManager {
    sender: mpsc::UnboundedSender<UserStreamEvent>,
}

impl UserStreamManager {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UserStreamEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub async fn connect(&self, ws_url: &str, listen_key: &str) -> Result<()> {
        let url = format!("{}/ws/{}", ws_url, listen_key);
        tracing::info!("Connecting to user data stream");

        let (ws_stream, _) = connect_async(&url).await?;
        let (mut write, mut read) = ws_stream.split();
        let sender = self.sender.clone();

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_user_event(&text) {
                            let _ = sender.send(event);
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Err(e) => {
                        tracing::error!("User stream error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            tracing::warn!("User data stream closed");
        });

        Ok(())
    }
}

fn parse_user_event(text: &str) -> Option<UserStreamEvent> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    match value.get("e")?.as_str()? {
        "ORDER_TRADE_UPDATE" => {
            let order = value.get("o")?.clone();
            match serde_json::from_value::<OrderUpdate>(order) {
                Ok(update) => Some(UserStreamEvent::OrderTradeUpdate(update)),
                Err(e) => {
                    tracing::warn!("Unparseable ORDER_TRADE_UPDATE: {}", e);
                    None
                }
            }
        }
        "ACCOUNT_UPDATE" => Some(UserStreamEvent::AccountUpdate),
        "listenKeyExpired" => Some(UserStreamEvent::ListenKeyExpired),
        _ => None,
    }
}

/// Mark-price ticks for every symbol, used to drive the software trailing
/// stop. The `!markPrice@arr` stream pushes one array per second.
pub struct MarkPriceStream {
    sender: mpsc::UnboundedSender<PriceTick>,
}

impl MarkPriceStream {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PriceTick>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub async fn connect(&self, ws_url: &str) -> Result<()> {
        let url = format!("{}/ws/!markPrice@arr", ws_url);
        tracing::info!("Connecting to mark price stream");

        let (ws_stream, _) = connect_async(&url).await?;
        let (mut write, mut read) = ws_stream.split();
        let sender = self.sender.clone();

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        for tick in parse_mark_prices(&text) {
                            let _ = sender.send(tick);
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Err(e) => {
                        tracing::error!("Mark price stream error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            tracing::warn!("Mark price stream closed");
        });

        Ok(())
    }
}

fn parse_mark_prices(text: &str) -> Vec<PriceTick> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return Vec::new();
    };
    let Some(events) = value.as_array() else {
        return Vec::new();
    };

    events
        .iter()
        .filter(|e| e.get("e").and_then(|v| v.as_str()) == Some("markPriceUpdate"))
        .filter_map(|e| {
            Some(PriceTick {
                symbol: e.get("s")?.as_str()?.to_string(),
                price: e.get("p")?.as_str()?.parse().ok()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_order_trade_update() {
        let raw = r#"{
            "e": "ORDER_TRADE_UPDATE", "E": 1700000000000,
            "o": {"s": "BTCUSDT", "i": 42, "X": "FILLED", "o": "LIMIT",
                  "S": "BUY", "ap": "50000.0", "q": "0.010", "rp": "0", "n": "0.01"}
        }"#;
        match parse_user_event(raw) {
            Some(UserStreamEvent::OrderTradeUpdate(update)) => {
                assert_eq!(update.symbol, "BTCUSDT");
                assert_eq!(update.order_id, 42);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_event_ignored() {
        assert!(parse_user_event(r#"{"e": "MARGIN_CALL"}"#).is_none());
        assert!(parse_user_event("not json").is_none());
    }

    #[test]
    fn test_parse_mark_price_array() {
        let raw = r#"[
            {"e": "markPriceUpdate", "s": "BTCUSDT", "p": "50123.45"},
            {"e": "markPriceUpdate", "s": "ETHUSDT", "p": "3000.10"}
        ]"#;
        let ticks = parse_mark_prices(raw);
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].symbol, "BTCUSDT");
        assert!((ticks[1].price - 3000.10).abs() < 1e-9);
    }
}
