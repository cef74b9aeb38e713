use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{domain::UserId, protocol::ServerEvent};
use storage::{MessageStore, NewMessage, Storage, StoredMessage, UserDirectory};
use tokio::sync::mpsc;

use crate::{
    auth::{mint_token, JwtVerifier},
    history::HistoryLimits,
    ApiContext,
};

pub(crate) const SECRET: &str = "unit-test-secret";

pub(crate) async fn storage_with(names: &[&str]) -> (Storage, Vec<UserId>) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut users = Vec::with_capacity(names.len());
    for name in names {
        users.push(storage.create_user(name).await.expect("user"));
    }
    (storage, users)
}

pub(crate) fn context_for(storage: Storage) -> ApiContext {
    ApiContext::new(
        storage,
        Arc::new(JwtVerifier::new(SECRET)),
        HistoryLimits::default(),
    )
}

pub(crate) fn token_for(user_id: UserId) -> String {
    mint_token(SECRET, user_id, chrono::Duration::hours(1)).expect("token")
}

pub(crate) fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Store that refuses every write, with a directory that knows every user.
pub(crate) struct UnavailableStore;

#[async_trait]
impl MessageStore for UnavailableStore {
    async fn append(&self, _message: NewMessage) -> Result<StoredMessage> {
        Err(anyhow!("database is locked"))
    }

    async fn query(
        &self,
        _user_a: UserId,
        _user_b: UserId,
        _limit: i64,
        _offset: i64,
    ) -> Result<Vec<StoredMessage>> {
        Err(anyhow!("database is locked"))
    }
}

#[async_trait]
impl UserDirectory for UnavailableStore {
    async fn user_exists(&self, _user_id: UserId) -> Result<bool> {
        Ok(true)
    }
}
