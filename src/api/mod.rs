pub mod binance;
pub mod error;
pub mod types;
pub mod websocket;

pub use binance::{BinanceClient, ExchangeApi};
pub use error::BinanceError;
pub use types::*;
pub use websocket::{MarkPriceStream, UserStreamManager};
