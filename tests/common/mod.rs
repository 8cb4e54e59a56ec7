#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pawtalk::api::models::{ConversationRow, MessageRow};
use pawtalk::chat::listener::{ChangeFeed, FeedState};
use pawtalk::chat::ChatGateway;
use pawtalk::{ChatError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub const ME: &str = "user-me";
pub const THEM: &str = "user-them";

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
}

pub fn conversation_row(id: &str, a: &str, b: &str, last: DateTime<Utc>) -> ConversationRow {
    ConversationRow {
        id: id.into(),
        dog1_id: a.into(),
        dog2_id: b.into(),
        dog1_name: a.to_uppercase(),
        dog2_name: b.to_uppercase(),
        dog1_avatar_url: None,
        dog2_avatar_url: None,
        created_at: at(1, 0),
        last_message_at: Some(last),
    }
}

pub fn message_row(id: &str, conversation_id: &str, sender: &str, when: DateTime<Utc>) -> MessageRow {
    MessageRow {
        id: id.into(),
        conversation_id: conversation_id.into(),
        sender_id: sender.into(),
        text: format!("text of {}", id),
        created_at: when,
    }
}

fn unavailable() -> ChatError {
    ChatError::Http {
        status: 503,
        body: "backend unavailable".into(),
    }
}

/// In-memory stand-in for the two backend tables.
#[derive(Default)]
pub struct FakeGateway {
    pub conversations: Mutex<Vec<ConversationRow>>,
    pub messages: Mutex<Vec<MessageRow>>,
    pub touched: Mutex<Vec<(String, DateTime<Utc>)>>,
    pub fail_find: AtomicBool,
    pub fail_create: AtomicBool,
    pub fail_insert: AtomicBool,
    pub fail_delete: AtomicBool,
    pub create_calls: AtomicUsize,
    pub create_delay_ms: AtomicU64,
    pub insert_delay_ms: AtomicU64,
    pub delete_delay_ms: AtomicU64,
}

impl FakeGateway {
    pub fn with_conversations(rows: Vec<ConversationRow>) -> Self {
        let gateway = Self::default();
        *gateway.conversations.lock().unwrap() = rows;
        gateway
    }

    pub fn seed_messages(&self, rows: Vec<MessageRow>) {
        self.messages.lock().unwrap().extend(rows);
    }

    pub fn stored_messages(&self) -> Vec<MessageRow> {
        self.messages.lock().unwrap().clone()
    }

    pub fn stored_conversations(&self) -> Vec<ConversationRow> {
        self.conversations.lock().unwrap().clone()
    }
}

async fn pause(ms: &AtomicU64) {
    let ms = ms.load(Ordering::SeqCst);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl ChatGateway for FakeGateway {
    async fn find_conversation(&self, a: &str, b: &str) -> Result<Option<ConversationRow>> {
        if self.fail_find.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(self
            .conversations
            .lock()
            .unwrap()
            .iter()
            .find(|c| (c.dog1_id == a && c.dog2_id == b) || (c.dog1_id == b && c.dog2_id == a))
            .cloned())
    }

    async fn list_conversations(&self, participant_ids: &[String]) -> Result<Vec<ConversationRow>> {
        Ok(self
            .conversations
            .lock()
            .unwrap()
            .iter()
            .filter(|c| participant_ids.contains(&c.dog1_id) || participant_ids.contains(&c.dog2_id))
            .cloned()
            .collect())
    }

    async fn create_conversation(&self, row: &ConversationRow) -> Result<ConversationRow> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        pause(&self.create_delay_ms).await;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.conversations.lock().unwrap().push(row.clone());
        Ok(row.clone())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        pause(&self.delete_delay_ms).await;
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.conversations.lock().unwrap().retain(|c| c.id != conversation_id);
        self.messages.lock().unwrap().retain(|m| m.conversation_id != conversation_id);
        Ok(())
    }

    async fn touch_conversation(&self, conversation_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.touched.lock().unwrap().push((conversation_id.to_string(), at));
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
        let mut rows: Vec<_> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn insert_message(&self, row: &MessageRow) -> Result<MessageRow> {
        pause(&self.insert_delay_ms).await;
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.messages.lock().unwrap().push(row.clone());
        Ok(row.clone())
    }
}

/// Change feed driven by the test: rows are pushed by hand, subscriptions
/// can be refused or cut.
#[derive(Default)]
pub struct FakeFeed {
    open: Mutex<Vec<(String, mpsc::Sender<MessageRow>)>>,
    pub refuse_next: AtomicU32,
    pub subscribe_calls: AtomicUsize,
}

impl FakeFeed {
    pub fn calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Delivers `row` on the live subscription for `conversation_id`.
    pub async fn push(&self, conversation_id: &str, row: MessageRow) {
        let sender = self
            .open
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, tx)| id == conversation_id && !tx.is_closed())
            .map(|(_, tx)| tx.clone())
            .expect("no live subscription");
        sender.send(row).await.expect("subscription dropped");
    }

    /// Simulates the backend dropping every subscription.
    pub fn cut_all(&self) {
        self.open.lock().unwrap().clear();
    }

    pub fn live(&self, conversation_id: &str) -> usize {
        self.open
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, tx)| id == conversation_id && !tx.is_closed())
            .count()
    }
}

#[async_trait]
impl ChangeFeed for FakeFeed {
    async fn subscribe(&self, _channel: &str, conversation_id: &str) -> Result<mpsc::Receiver<MessageRow>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ChatError::Realtime("join rejected".into()));
        }
        let (tx, rx) = mpsc::channel(16);
        self.open.lock().unwrap().push((conversation_id.to_string(), tx));
        Ok(rx)
    }
}

pub async fn wait_state<F>(rx: &mut watch::Receiver<FeedState>, pred: F)
where
    F: FnMut(&FeedState) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(pred))
        .await
        .expect("timed out waiting for feed state")
        .expect("listener dropped its state");
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
