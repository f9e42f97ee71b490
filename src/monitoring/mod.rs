pub mod journal;
pub mod notifier;

pub use journal::{TradeJournal, TradeRecord};
pub use notifier::Notifier;
