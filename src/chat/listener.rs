//! Per-conversation change-feed subscriptions.
//!
//! A [`ConversationListener`] owns one subscription and walks the states
//! `Idle -> Connecting -> Connected`, dropping to `Failed` whenever the feed
//! cannot be opened or goes away. Failed subscriptions are retried with
//! exponential backoff until [`RetryPolicy::max_attempts`] consecutive
//! attempts have failed.

use crate::api::models::MessageRow;
use crate::app::RetrySettings;
use crate::chat::store::ChatStore;
use crate::error::Result;
use crate::utils::channel_name;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

/// Source of row-insert notifications for the `messages` table.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Opens a subscription. Dropping the receiver tears it down; the sender
    /// side closing means the subscription was lost.
    async fn subscribe(&self, channel: &str, conversation_id: &str) -> Result<mpsc::Receiver<MessageRow>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedState {
    Idle,
    Connecting { attempt: u32 },
    Connected,
    Failed { reason: String, retrying: bool },
}

impl FeedState {
    /// No task is running for this state anymore.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FeedState::Idle | FeedState::Failed { retrying: false, .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Wait before retrying after `attempt` consecutive failures (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetrySettings::default().into()
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(s: RetrySettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
        }
    }
}

pub struct ConversationListener {
    conversation_id: String,
    state: watch::Receiver<FeedState>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ConversationListener {
    pub fn start(
        store: Arc<ChatStore>,
        feed: Arc<dyn ChangeFeed>,
        conversation_id: &str,
        policy: RetryPolicy,
    ) -> Self {
        let (state_tx, state) = watch::channel(FeedState::Connecting { attempt: 1 });
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run(
            store,
            feed,
            conversation_id.to_string(),
            policy,
            state_tx,
            stop_rx,
        ));
        Self {
            conversation_id: conversation_id.to_string(),
            state,
            stop: Some(stop),
            task: Some(task),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn state(&self) -> FeedState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<FeedState> {
        self.state.clone()
    }

    /// Tears the subscription down and waits for the task. Safe to call twice.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Listener for {} ended abnormally: {}", self.conversation_id, e);
            }
        }
    }
}

impl Drop for ConversationListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    store: Arc<ChatStore>,
    feed: Arc<dyn ChangeFeed>,
    conversation_id: String,
    policy: RetryPolicy,
    state: watch::Sender<FeedState>,
    mut stop: oneshot::Receiver<()>,
) {
    let channel = channel_name(&conversation_id);
    let local_user = store.user_id().to_string();
    let mut failures: u32 = 0;

    loop {
        state.send_replace(FeedState::Connecting { attempt: failures + 1 });
        let opened = tokio::select! {
            _ = &mut stop => break,
            opened = feed.subscribe(&channel, &conversation_id) => opened,
        };

        let reason = match opened {
            Ok(mut rows) => {
                failures = 0;
                state.send_replace(FeedState::Connected);
                info!("Listening on {}", channel);
                loop {
                    let row = tokio::select! {
                        _ = &mut stop => {
                            state.send_replace(FeedState::Idle);
                            return;
                        }
                        row = rows.recv() => row,
                    };
                    let Some(row) = row else { break };
                    if !accepts(&row, &conversation_id, &local_user) {
                        debug!("Dropped feed row {} on {}", row.id, channel);
                        continue;
                    }
                    store.receive(row).await;
                }
                "feed closed".to_string()
            }
            Err(e) => e.to_string(),
        };

        failures += 1;
        let retrying = !policy.exhausted(failures);
        warn!("Subscription {} failed ({}), attempt {}", channel, reason, failures);
        state.send_replace(FeedState::Failed { reason, retrying });
        if !retrying {
            return;
        }
        tokio::select! {
            _ = &mut stop => break,
            _ = tokio::time::sleep(policy.delay(failures)) => {}
        }
    }
    state.send_replace(FeedState::Idle);
}

/// Rows for another conversation and echoes of our own sends are not forwarded.
pub fn accepts(row: &MessageRow, conversation_id: &str, local_user_id: &str) -> bool {
    row.conversation_id == conversation_id && row.sender_id != local_user_id
}

/// At most one live listener per conversation.
pub struct FeedListeners {
    store: Arc<ChatStore>,
    feed: Arc<dyn ChangeFeed>,
    policy: RetryPolicy,
    active: Mutex<HashMap<String, ConversationListener>>,
}

impl FeedListeners {
    pub fn new(store: Arc<ChatStore>, feed: Arc<dyn ChangeFeed>, policy: RetryPolicy) -> Self {
        Self {
            store,
            feed,
            policy,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Starts listening unless a live listener exists. A listener that gave up
    /// is replaced.
    pub async fn watch(&self, conversation_id: &str) -> watch::Receiver<FeedState> {
        let mut active = self.active.lock().await;
        if let Some(existing) = active.get(conversation_id) {
            if !existing.state().is_terminal() {
                return existing.watch_state();
            }
        }
        if let Some(mut stale) = active.remove(conversation_id) {
            stale.stop().await;
        }
        let listener = ConversationListener::start(
            self.store.clone(),
            self.feed.clone(),
            conversation_id,
            self.policy,
        );
        let state = listener.watch_state();
        active.insert(conversation_id.to_string(), listener);
        state
    }

    /// Returns whether a listener was running.
    pub async fn unwatch(&self, conversation_id: &str) -> bool {
        let removed = self.active.lock().await.remove(conversation_id);
        match removed {
            Some(mut listener) => {
                listener.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn unwatch_all(&self) {
        let drained: Vec<_> = self.active.lock().await.drain().map(|(_, l)| l).collect();
        for mut listener in drained {
            listener.stop().await;
        }
    }

    pub async fn state(&self, conversation_id: &str) -> FeedState {
        self.active
            .lock()
            .await
            .get(conversation_id)
            .map(|l| l.state())
            .unwrap_or(FeedState::Idle)
    }

    pub async fn watched(&self) -> Vec<String> {
        self.active.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(conversation: &str, sender: &str) -> MessageRow {
        MessageRow {
            id: "m".into(),
            conversation_id: conversation.into(),
            sender_id: sender.into(),
            text: "woof".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn filters_foreign_conversations_and_self_echoes() {
        assert!(accepts(&row("c1", "them"), "c1", "me"));
        assert!(!accepts(&row("c2", "them"), "c1", "me"));
        assert!(!accepts(&row("c1", "me"), "c1", "me"));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(2000));
        assert_eq!(policy.delay(4), Duration::from_secs(3));
        assert_eq!(policy.delay(40), Duration::from_secs(3));
    }

    #[test]
    fn policy_from_settings_never_allows_zero_attempts() {
        let policy = RetryPolicy::from(RetrySettings {
            max_attempts: 0,
            base_delay_ms: 10,
            max_delay_ms: 20,
        });
        assert_eq!(policy.max_attempts, 1);
        assert!(policy.exhausted(1));
    }

    #[test]
    fn only_idle_and_given_up_are_terminal() {
        assert!(FeedState::Idle.is_terminal());
        assert!(FeedState::Failed { reason: "x".into(), retrying: false }.is_terminal());
        assert!(!FeedState::Failed { reason: "x".into(), retrying: true }.is_terminal());
        assert!(!FeedState::Connected.is_terminal());
        assert!(!FeedState::Connecting { attempt: 1 }.is_terminal());
    }
}
