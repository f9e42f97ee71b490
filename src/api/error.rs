use thiserror::Error;

#[derive(Debug, Error)]
pub enum BinanceError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Binance API error {code}: {msg}")]
    Api { code: i64, msg: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl BinanceError {
    /// Harmless "nothing to do" answers returned when re-applying leverage or
    /// margin settings that are already in place (-4046 is the margin-type
    /// variant). The entry path tolerates these instead of aborting.
    pub fn is_no_change(&self) -> bool {
        match self {
            BinanceError::Api { code, msg } => {
                *code == -4046
                    || msg.to_lowercase().contains("no need to change")
                    || msg.to_lowercase().contains("already")
            }
            _ => false,
        }
    }
}
