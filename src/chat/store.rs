use crate::api::models::MessageRow;
use crate::chat::gateway::ChatGateway;
use crate::chat::model::{sort_conversations, sort_messages, Conversation, Message, Participant, SyncStatus};
use crate::error::{ChatError, Result};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};

const EVENT_CAPACITY: usize = 256;

/// What changed, for whoever renders the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    ConversationsChanged,
    MessagesChanged { conversation_id: String },
    MessageStatusChanged {
        conversation_id: String,
        message_id: String,
        status: SyncStatus,
    },
    DeleteRolledBack { conversation_id: String },
}

#[derive(Default)]
struct State {
    /// Most recently active first.
    conversations: Vec<Conversation>,
    /// Removed locally, waiting on the backend to confirm.
    pending_deletes: HashMap<String, Conversation>,
}

impl State {
    fn find_mut(&mut self, conversation_id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == conversation_id)
    }

    /// Listed or held back by an unsettled delete.
    fn find_held_mut(&mut self, conversation_id: &str) -> Option<&mut Conversation> {
        match self.conversations.iter().position(|c| c.id == conversation_id) {
            Some(pos) => self.conversations.get_mut(pos),
            None => self.pending_deletes.get_mut(conversation_id),
        }
    }

    fn deleting_pair(&self, a: &str, b: &str) -> bool {
        self.pending_deletes.values().any(|c| c.is_between(a, b))
    }

    /// Inserts or replaces by id, keeping one entry per conversation.
    fn upsert(&mut self, conversation: Conversation) {
        match self.find_mut(&conversation.id) {
            Some(existing) => *existing = conversation,
            None => self.conversations.push(conversation),
        }
        sort_conversations(&mut self.conversations);
    }
}

/// Session-lifetime view of the local user's conversations.
///
/// All mutation goes through here. The state lock is never held across a
/// backend call, so reads stay responsive while requests are in flight.
pub struct ChatStore {
    gateway: Arc<dyn ChatGateway>,
    user_id: String,
    state: Mutex<State>,
    /// Serializes find-or-create so two first contacts between the same
    /// dogs from this client resolve to one conversation.
    create_gate: Mutex<()>,
    /// Woken whenever a delete settles either way.
    delete_settled: Notify,
    events: broadcast::Sender<StoreEvent>,
}

impl ChatStore {
    pub fn new(gateway: Arc<dyn ChatGateway>, user_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            gateway,
            user_id: user_id.into(),
            state: Mutex::new(State::default()),
            create_gate: Mutex::new(()),
            delete_settled: Notify::new(),
            events,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().await.conversations.clone()
    }

    pub async fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.state
            .lock()
            .await
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned()
    }

    pub async fn messages(&self, conversation_id: &str) -> Option<Vec<Message>> {
        self.conversation(conversation_id).await.and_then(|c| c.messages)
    }

    pub async fn is_pending_delete(&self, conversation_id: &str) -> bool {
        self.state.lock().await.pending_deletes.contains_key(conversation_id)
    }

    /// Conversation between two dogs, creating it on the backend first when
    /// neither this store nor the backend knows one.
    pub async fn find_or_create(&self, from: Participant, to: Participant) -> Result<Conversation> {
        if from.id == to.id {
            return Err(ChatError::InvalidInput("a conversation needs two different dogs".into()));
        }
        let _gate = self.create_gate.lock().await;

        // A pair whose delete is still in flight resolves once the delete does.
        loop {
            let settled = self.delete_settled.notified();
            {
                let state = self.state.lock().await;
                if let Some(existing) = state.conversations.iter().find(|c| c.is_between(&from.id, &to.id)) {
                    return Ok(existing.clone());
                }
                if !state.deleting_pair(&from.id, &to.id) {
                    break;
                }
            }
            debug!("Waiting on pending delete of {} <-> {}", from.id, to.id);
            settled.await;
        }

        let remote = self.gateway.find_conversation(&from.id, &to.id).await.map_err(|e| {
            error!("Conversation lookup {} <-> {} failed: {}", from.id, to.id, e);
            e
        })?;

        let conversation = match remote {
            Some(row) => {
                debug!("Adopting remote conversation {}", row.id);
                Conversation::from(row)
            }
            None => {
                let draft = Conversation::new(from, to);
                let created = self.gateway.create_conversation(&draft.to_row()).await.map_err(|e| {
                    error!(
                        "Creating conversation {} <-> {} failed: {}",
                        draft.first.id, draft.second.id, e
                    );
                    e
                })?;
                info!("Created conversation {}", created.id);
                Conversation::from(created)
            }
        };

        self.state.lock().await.upsert(conversation.clone());
        self.emit(StoreEvent::ConversationsChanged);
        Ok(conversation)
    }

    /// Shows the message immediately as `Pending`, then persists it. The
    /// returned message carries the settled status: `Confirmed` or `Failed`.
    pub async fn send(&self, conversation_id: &str, text: &str) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(ChatError::InvalidInput("message is empty".into()));
        }
        let message = Message::outgoing(&self.user_id, text);

        {
            let mut state = self.state.lock().await;
            let conversation = state
                .find_mut(conversation_id)
                .ok_or_else(|| ChatError::UnknownConversation(conversation_id.to_string()))?;
            conversation.push_message(message.clone());
            sort_conversations(&mut state.conversations);
        }
        self.emit(StoreEvent::MessagesChanged { conversation_id: conversation_id.to_string() });
        self.emit(StoreEvent::ConversationsChanged);

        let status = match self.gateway.insert_message(&message.to_row(conversation_id)).await {
            Ok(_) => {
                if let Err(e) = self.gateway.touch_conversation(conversation_id, message.timestamp).await {
                    warn!("Could not bump last message time of {}: {}", conversation_id, e);
                }
                SyncStatus::Confirmed
            }
            Err(e) => {
                warn!("Sending message {} to {} failed: {}", message.id, conversation_id, e);
                SyncStatus::Failed
            }
        };
        self.set_status(conversation_id, &message.id, status).await;
        Ok(Message { status, ..message })
    }

    async fn set_status(&self, conversation_id: &str, message_id: &str, status: SyncStatus) {
        let updated = {
            let mut state = self.state.lock().await;
            match state.find_held_mut(conversation_id).and_then(|c| c.message_mut(message_id)) {
                Some(message) => {
                    message.status = status;
                    true
                }
                // Conversation deleted while the send was in flight.
                None => false,
            }
        };
        if updated {
            self.emit(StoreEvent::MessageStatusChanged {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
                status,
            });
        }
    }

    /// Removes the conversation right away and puts it back if the backend
    /// refuses the delete.
    pub async fn delete(&self, conversation_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let pos = state
                .conversations
                .iter()
                .position(|c| c.id == conversation_id)
                .ok_or_else(|| ChatError::UnknownConversation(conversation_id.to_string()))?;
            let removed = state.conversations.remove(pos);
            state.pending_deletes.insert(conversation_id.to_string(), removed);
        }
        self.emit(StoreEvent::ConversationsChanged);

        match self.gateway.delete_conversation(conversation_id).await {
            Ok(()) => {
                self.state.lock().await.pending_deletes.remove(conversation_id);
                self.delete_settled.notify_waiters();
                info!("Deleted conversation {}", conversation_id);
                Ok(())
            }
            Err(e) => {
                error!("Deleting conversation {} failed, restoring: {}", conversation_id, e);
                {
                    let mut state = self.state.lock().await;
                    if let Some(restored) = state.pending_deletes.remove(conversation_id) {
                        state.upsert(restored);
                    }
                }
                self.delete_settled.notify_waiters();
                self.emit(StoreEvent::ConversationsChanged);
                self.emit(StoreEvent::DeleteRolledBack { conversation_id: conversation_id.to_string() });
                Err(e)
            }
        }
    }

    /// Applies an insert observed on the change feed. Returns whether it
    /// changed anything. Rows for a conversation with a delete in flight are
    /// kept with it so a rollback restores them.
    pub async fn receive(&self, row: MessageRow) -> bool {
        if row.sender_id == self.user_id {
            debug!("Ignoring echo of own message {}", row.id);
            return false;
        }
        let conversation_id = row.conversation_id.clone();
        {
            let mut state = self.state.lock().await;
            let Some(conversation) = state.find_held_mut(&conversation_id) else {
                debug!("Message {} for unknown conversation {}", row.id, conversation_id);
                return false;
            };
            if conversation.contains_message(&row.id) {
                debug!("Duplicate message {}", row.id);
                return false;
            }
            conversation.push_message(Message::from_row(row, &self.user_id));
            sort_conversations(&mut state.conversations);
        }
        self.emit(StoreEvent::MessagesChanged { conversation_id });
        self.emit(StoreEvent::ConversationsChanged);
        true
    }

    /// Pulls every conversation involving one of `participant_ids` and merges
    /// it into local state. Returns how many the backend sent.
    pub async fn load_conversations(&self, participant_ids: &[String]) -> Result<usize> {
        let rows = self.gateway.list_conversations(participant_ids).await.map_err(|e| {
            error!("Loading conversations failed: {}", e);
            e
        })?;
        let count = rows.len();
        {
            let mut state = self.state.lock().await;
            for row in rows {
                if state.pending_deletes.contains_key(&row.id) {
                    continue;
                }
                let incoming = Conversation::from(row);
                match state.find_mut(&incoming.id) {
                    Some(existing) => {
                        existing.first = incoming.first;
                        existing.second = incoming.second;
                        if incoming.last_message_at > existing.last_message_at {
                            existing.last_message_at = incoming.last_message_at;
                        }
                    }
                    None => state.conversations.push(incoming),
                }
            }
            sort_conversations(&mut state.conversations);
        }
        debug!("Loaded {} conversations", count);
        self.emit(StoreEvent::ConversationsChanged);
        Ok(count)
    }

    /// Fetches history and merges it with what is held locally. Local
    /// messages the backend does not have yet are kept. Returns the merged
    /// message count.
    pub async fn load_messages(&self, conversation_id: &str) -> Result<usize> {
        let rows = self.gateway.list_messages(conversation_id).await.map_err(|e| {
            error!("Loading messages of {} failed: {}", conversation_id, e);
            e
        })?;

        let count = {
            let mut state = self.state.lock().await;
            let conversation = state
                .find_mut(conversation_id)
                .ok_or_else(|| ChatError::UnknownConversation(conversation_id.to_string()))?;

            let mut seen = HashSet::new();
            let mut merged: Vec<Message> = rows
                .into_iter()
                .filter(|row| seen.insert(row.id.clone()))
                .map(|row| Message::from_row(row, &self.user_id))
                .collect();
            for local in conversation.messages.take().unwrap_or_default() {
                if seen.insert(local.id.clone()) {
                    merged.push(local);
                }
            }
            sort_messages(&mut merged);

            if let Some(last) = merged.last() {
                if last.timestamp > conversation.last_message_at {
                    conversation.last_message_at = last.timestamp;
                }
            }
            let count = merged.len();
            conversation.messages = Some(merged);
            sort_conversations(&mut state.conversations);
            count
        };
        self.emit(StoreEvent::MessagesChanged { conversation_id: conversation_id.to_string() });
        self.emit(StoreEvent::ConversationsChanged);
        Ok(count)
    }
}
