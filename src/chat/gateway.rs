use crate::api::models::{ConversationRow, MessageRow};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Backend operations the chat store depends on.
///
/// Each call is a single attempt. Implementations do not retry.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Existing conversation between two dogs, in either order.
    async fn find_conversation(&self, a: &str, b: &str) -> Result<Option<ConversationRow>>;

    async fn list_conversations(&self, participant_ids: &[String]) -> Result<Vec<ConversationRow>>;

    async fn create_conversation(&self, row: &ConversationRow) -> Result<ConversationRow>;

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()>;

    async fn touch_conversation(&self, conversation_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// History, oldest first.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>>;

    async fn insert_message(&self, row: &MessageRow) -> Result<MessageRow>;
}
