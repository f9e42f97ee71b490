use anyhow::Result;

use crate::core::config::TelegramConfig;

/// Fire-and-forget Telegram notifications. Failures are logged and swallowed
/// here so no notification problem can ever fail a trading path.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    config: TelegramConfig,
}

impl Notifier {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn disabled() -> Self {
        Self::new(TelegramConfig {
            enabled: false,
            bot_token: String::new(),
            chat_id: String::new(),
        })
    }

    pub async fn send(&self, text: &str) {
        if !self.config.enabled {
            tracing::debug!(
                "📪 Notification (muted): {}",
                text.lines().next().unwrap_or_default()
            );
            return;
        }
        if let Err(e) = self.try_send(text).await {
            tracing::warn!("⚠️ Telegram notification failed: {}", e);
        }
    }

    async fn try_send(&self, text: &str) -> Result<()> {
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            self.config.bot_token
        );
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.config.chat_id,
                "text": text,
                "parse_mode": "HTML",
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("telegram returned {}", response.status());
        }
        Ok(())
    }
}
