use crate::api::models::{ConversationRow, MessageRow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One side of a conversation: a dog and how to display it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub avatar_url: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Applied locally, backend has not answered yet.
    Pending,
    Confirmed,
    /// Backend rejected or never received it.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub text: String,
    pub is_from_current_user: bool,
    pub timestamp: DateTime<Utc>,
    pub status: SyncStatus,
}

impl Message {
    pub fn outgoing(sender_id: &str, text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            is_from_current_user: true,
            timestamp: Utc::now(),
            status: SyncStatus::Pending,
        }
    }

    pub fn from_row(row: MessageRow, local_user_id: &str) -> Self {
        Self {
            is_from_current_user: row.sender_id == local_user_id,
            id: row.id,
            sender_id: row.sender_id,
            text: row.text,
            timestamp: row.created_at,
            status: SyncStatus::Confirmed,
        }
    }

    pub fn to_row(&self, conversation_id: &str) -> MessageRow {
        MessageRow {
            id: self.id.clone(),
            conversation_id: conversation_id.to_string(),
            sender_id: self.sender_id.clone(),
            text: self.text.clone(),
            created_at: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub first: Participant,
    pub second: Participant,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    /// `None` until history is loaded or a message arrives.
    pub messages: Option<Vec<Message>>,
}

impl Conversation {
    pub fn new(from: Participant, to: Participant) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            first: from,
            second: to,
            created_at: now,
            last_message_at: now,
            messages: None,
        }
    }

    /// True when this conversation is between `a` and `b`, in either order.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.first.id == a && self.second.id == b) || (self.first.id == b && self.second.id == a)
    }

    pub fn involves(&self, participant_id: &str) -> bool {
        self.first.id == participant_id || self.second.id == participant_id
    }

    /// The participant that is not `me`. Falls back to `second` when `me` is not in it.
    pub fn counterpart(&self, me: &str) -> &Participant {
        if self.second.id == me { &self.first } else { &self.second }
    }

    pub fn contains_message(&self, message_id: &str) -> bool {
        self.messages
            .as_ref()
            .is_some_and(|list| list.iter().any(|m| m.id == message_id))
    }

    pub fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages
            .as_mut()
            .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
    }

    /// Appends keeping timestamp order and moves `last_message_at` forward.
    pub fn push_message(&mut self, message: Message) {
        if message.timestamp > self.last_message_at {
            self.last_message_at = message.timestamp;
        }
        let list = self.messages.get_or_insert_with(Vec::new);
        list.push(message);
        sort_messages(list);
    }

    pub fn to_row(&self) -> ConversationRow {
        ConversationRow {
            id: self.id.clone(),
            dog1_id: self.first.id.clone(),
            dog2_id: self.second.id.clone(),
            dog1_name: self.first.name.clone(),
            dog2_name: self.second.name.clone(),
            dog1_avatar_url: self.first.avatar_url.clone(),
            dog2_avatar_url: self.second.avatar_url.clone(),
            created_at: self.created_at,
            last_message_at: Some(self.last_message_at),
        }
    }
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Self {
            last_message_at: row.last_message_at.unwrap_or(row.created_at),
            first: Participant {
                id: row.dog1_id,
                name: row.dog1_name,
                avatar_url: row.dog1_avatar_url,
            },
            second: Participant {
                id: row.dog2_id,
                name: row.dog2_name,
                avatar_url: row.dog2_avatar_url,
            },
            id: row.id,
            created_at: row.created_at,
            messages: None,
        }
    }
}

/// Oldest first. Stable, so equal timestamps keep arrival order.
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
}

/// Most recently active first.
pub fn sort_conversations(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, min, 0).unwrap()
    }

    fn incoming(id: &str, min: u32) -> Message {
        Message {
            id: id.into(),
            sender_id: "other".into(),
            text: id.into(),
            is_from_current_user: false,
            timestamp: at(min),
            status: SyncStatus::Confirmed,
        }
    }

    #[test]
    fn pair_match_ignores_order() {
        let conv = Conversation::new(Participant::new("rex", "Rex"), Participant::new("bella", "Bella"));
        assert!(conv.is_between("rex", "bella"));
        assert!(conv.is_between("bella", "rex"));
        assert!(!conv.is_between("rex", "rex"));
        assert_eq!(conv.counterpart("bella").id, "rex");
    }

    #[test]
    fn push_keeps_ascending_order_and_advances_last_message() {
        let mut conv = Conversation::new(Participant::new("a", "A"), Participant::new("b", "B"));
        conv.last_message_at = at(0);
        conv.push_message(incoming("late", 30));
        conv.push_message(incoming("early", 10));

        let ids: Vec<_> = conv.messages.as_ref().unwrap().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["early", "late"]);
        assert_eq!(conv.last_message_at, at(30));
    }

    #[test]
    fn row_without_last_message_falls_back_to_created() {
        let row = ConversationRow {
            id: "c".into(),
            dog1_id: "a".into(),
            dog2_id: "b".into(),
            dog1_name: "A".into(),
            dog2_name: "B".into(),
            dog1_avatar_url: Some("https://cdn/a.jpg".into()),
            dog2_avatar_url: None,
            created_at: at(5),
            last_message_at: None,
        };
        let conv = Conversation::from(row);
        assert_eq!(conv.last_message_at, at(5));
        assert_eq!(conv.first.avatar_url.as_deref(), Some("https://cdn/a.jpg"));
        assert!(conv.messages.is_none());
    }

    #[test]
    fn message_authorship_follows_local_user() {
        let row = MessageRow {
            id: "m".into(),
            conversation_id: "c".into(),
            sender_id: "me".into(),
            text: "hi".into(),
            created_at: at(1),
        };
        assert!(Message::from_row(row.clone(), "me").is_from_current_user);
        assert!(!Message::from_row(row, "you").is_from_current_user);
    }
}
