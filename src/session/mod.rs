pub mod data;
pub mod error;
pub mod store;

pub use data::{Conversation, StalenessPolicy};
pub use store::HistoryStore;
