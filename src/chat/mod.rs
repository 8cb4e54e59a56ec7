pub mod gateway;
pub mod listener;
pub mod model;
pub mod store;

pub use gateway::ChatGateway;
pub use listener::{ChangeFeed, ConversationListener, FeedListeners, FeedState, RetryPolicy};
pub use model::{Conversation, Message, Participant, SyncStatus};
pub use store::{ChatStore, StoreEvent};
