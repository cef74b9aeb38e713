use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
};

use chrono::Utc;
use shared::{
    domain::{ConversationKey, UserId},
    error::ApiError,
    protocol::{MessagePayload, ServerEvent},
};
use storage::{MessageStore, NewMessage, UserDirectory};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use crate::presence::PresenceRegistry;

pub const EMPTY_CONTENT: &str = "empty content";
pub const SELF_SEND: &str = "self-send";
pub const RECEIVER_NOT_FOUND: &str = "receiver not found";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub message: MessagePayload,
    pub sender_deliveries: usize,
    pub receiver_deliveries: usize,
}

type LaneTable = HashMap<ConversationKey, Arc<Mutex<()>>>;

/// One FIFO lock per conversation pair. Entries are dropped once idle.
#[derive(Default)]
struct ConversationLanes {
    lanes: StdMutex<LaneTable>,
}

impl ConversationLanes {
    fn table(&self) -> MutexGuard<'_, LaneTable> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for the pair's turn. Dropping the guard, or the future still
    /// waiting for it, releases the lane; idle lanes are evicted on every release.
    async fn acquire(self: &Arc<Self>, key: ConversationKey) -> LaneGuard {
        let lane = Arc::clone(self.table().entry(key).or_default());
        let mut guard = LaneGuard {
            lanes: Arc::clone(self),
            held: None,
        };
        guard.held = Some(lane.lock_owned().await);
        guard
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table().len()
    }
}

struct LaneGuard {
    lanes: Arc<ConversationLanes>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        // Unlock first so an idle entry is the map's only reference.
        drop(self.held.take());
        let mut lanes = self.lanes.table();
        lanes.retain(|_, lane| Arc::strong_count(lane) > 1);
    }
}

/// Validates, persists, then fans out direct messages.
#[derive(Clone)]
pub struct MessageRouter {
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn UserDirectory>,
    presence: PresenceRegistry,
    lanes: Arc<ConversationLanes>,
}

impl MessageRouter {
    pub fn new(
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn UserDirectory>,
        presence: PresenceRegistry,
    ) -> Self {
        Self {
            store,
            directory,
            presence,
            lanes: Arc::default(),
        }
    }

    /// Calls for the same pair are persisted and delivered in call order.
    /// Nothing is pushed unless the store accepted the message.
    pub async fn send(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        raw_content: &str,
    ) -> Result<SendOutcome, ApiError> {
        let content = raw_content.trim();
        if content.is_empty() {
            return Err(ApiError::validation(EMPTY_CONTENT));
        }
        if sender_id == receiver_id {
            return Err(ApiError::validation(SELF_SEND));
        }
        let known = self
            .directory
            .user_exists(receiver_id)
            .await
            .map_err(|e| {
                error!(%receiver_id, error = %e, "user directory lookup failed");
                ApiError::persistence("user directory unavailable")
            })?;
        if !known {
            return Err(ApiError::not_found(RECEIVER_NOT_FOUND));
        }

        let key = ConversationKey::new(sender_id, receiver_id);
        let _lane = self.lanes.acquire(key).await;
        self.persist_and_fan_out(sender_id, receiver_id, content)
            .await
    }

    async fn persist_and_fan_out(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> Result<SendOutcome, ApiError> {
        let stored = self
            .store
            .append(NewMessage {
                sender_id,
                receiver_id,
                content: content.to_string(),
                created_at: Utc::now(),
            })
            .await
            .map_err(|e| {
                error!(%sender_id, %receiver_id, error = %e, "failed to persist message");
                ApiError::persistence("failed to store message")
            })?;
        let message = MessagePayload::from(stored);

        let sender_deliveries = self
            .presence
            .deliver(
                sender_id,
                &ServerEvent::MessageSent(message.clone()),
            )
            .await;
        let receiver_deliveries = self
            .presence
            .deliver(
                receiver_id,
                &ServerEvent::MessageReceived(message.clone()),
            )
            .await;

        if receiver_deliveries == 0 {
            info!(
                message_id = %message.id,
                %receiver_id,
                "receiver offline; message kept for history"
            );
        }
        if sender_deliveries == 0 {
            debug!(message_id = %message.id, %sender_id, "no live sender session took the confirmation");
        }

        Ok(SendOutcome {
            message,
            sender_deliveries,
            receiver_deliveries,
        })
    }

    #[cfg(test)]
    async fn open_lanes(&self) -> usize {
        self.lanes.len()
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
