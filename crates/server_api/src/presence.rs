//! Which users are online, and through which sessions.

use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    sync::Arc,
};

use shared::{
    domain::{SessionHandle, UserId},
    protocol::ServerEvent,
};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Outbound queue of one live session.
pub type SessionSender = mpsc::Sender<ServerEvent>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("session {0} outbound queue is full")]
    Backpressure(SessionHandle),
    #[error("session {0} is closed")]
    Closed(SessionHandle),
}

struct SessionSlot {
    user_id: UserId,
    outbound: SessionSender,
}

#[derive(Default)]
struct PresenceTable {
    by_user: HashMap<UserId, HashSet<SessionHandle>>,
    sessions: HashMap<SessionHandle, SessionSlot>,
}

impl PresenceTable {
    fn remove(&mut self, handle: SessionHandle) -> Option<UserId> {
        let slot = self.sessions.remove(&handle)?;
        if let Entry::Occupied(mut entry) = self.by_user.entry(slot.user_id) {
            entry.get_mut().remove(&handle);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
        Some(slot.user_id)
    }
}

/// Shared presence table. A user has an entry iff at least one session is open.
///
/// Every operation takes the lock once and releases it before any event is
/// pushed, so a slow session never holds up registration elsewhere.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<RwLock<PresenceTable>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, user_id: UserId, handle: SessionHandle, outbound: SessionSender) {
        let mut table = self.inner.write().await;
        // A handle belongs to exactly one user.
        table.remove(handle);
        table.by_user.entry(user_id).or_default().insert(handle);
        table
            .sessions
            .insert(handle, SessionSlot { user_id, outbound });
    }

    /// Removes `handle` from whichever user owns it. Unknown handles are ignored.
    pub async fn unregister(&self, handle: SessionHandle) -> Option<UserId> {
        self.inner.write().await.remove(handle)
    }

    pub async fn sessions_of(&self, user_id: UserId) -> HashSet<SessionHandle> {
        self.inner
            .read()
            .await
            .by_user
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.inner.read().await.by_user.contains_key(&user_id)
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<_> = self.inner.read().await.by_user.keys().copied().collect();
        users.sort();
        users
    }

    /// Pushes `event` to every live session of `user_id` and returns how many
    /// accepted it. Each push is independent; failures are logged and skipped.
    pub async fn deliver(&self, user_id: UserId, event: &ServerEvent) -> usize {
        let targets: Vec<(SessionHandle, SessionSender)> = {
            let table = self.inner.read().await;
            let Some(handles) = table.by_user.get(&user_id) else {
                return 0;
            };
            handles
                .iter()
                .filter_map(|handle| {
                    table
                        .sessions
                        .get(handle)
                        .map(|slot| (*handle, slot.outbound.clone()))
                })
                .collect()
        };

        let mut delivered = 0;
        for (handle, outbound) in targets {
            match push(handle, &outbound, event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    debug!(%user_id, session = %handle, kind = event.kind(), "event delivered");
                }
                Err(error @ DeliveryError::Backpressure(_)) => {
                    warn!(%user_id, %error, kind = event.kind(), "dropping event for slow session");
                }
                Err(error @ DeliveryError::Closed(_)) => {
                    debug!(%user_id, %error, kind = event.kind(), "skipping closed session");
                }
            }
        }
        delivered
    }
}

pub(crate) fn push(
    handle: SessionHandle,
    outbound: &SessionSender,
    event: ServerEvent,
) -> Result<(), DeliveryError> {
    outbound.try_send(event).map_err(|error| match error {
        mpsc::error::TrySendError::Full(_) => DeliveryError::Backpressure(handle),
        mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed(handle),
    })
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
