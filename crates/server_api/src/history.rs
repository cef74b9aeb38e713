use std::sync::Arc;

use serde::Deserialize;
use shared::{domain::UserId, error::ApiError, protocol::MessagePayload};
use storage::{MessageStore, UserDirectory};
use tracing::error;

pub const PEER_NOT_FOUND: &str = "user not found";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    pub default_limit: i64,
    pub max_limit: i64,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 500,
        }
    }
}

/// Raw pagination parameters as they arrive on the query string.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<String>,
    pub skip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: i64,
    pub offset: i64,
}

impl HistoryLimits {
    pub fn page(&self, query: &HistoryQuery) -> Result<PageRequest, ApiError> {
        let limit = parse_non_negative("limit", query.limit.as_deref(), self.default_limit)?;
        let offset = parse_non_negative("skip", query.skip.as_deref(), 0)?;
        if limit > self.max_limit {
            return Err(ApiError::validation(format!(
                "limit must not exceed {}",
                self.max_limit
            )));
        }
        Ok(PageRequest { limit, offset })
    }
}

fn parse_non_negative(name: &str, raw: Option<&str>, default: i64) -> Result<i64, ApiError> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(default);
    };
    match raw.parse::<i64>() {
        Ok(value) if value >= 0 => Ok(value),
        _ => Err(ApiError::validation(format!(
            "{name} must be a non-negative integer"
        ))),
    }
}

/// Pull-based reads of one conversation, independent of live sessions.
#[derive(Clone)]
pub struct HistoryService {
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn UserDirectory>,
    limits: HistoryLimits,
}

impl HistoryService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn UserDirectory>,
        limits: HistoryLimits,
    ) -> Self {
        Self {
            store,
            directory,
            limits,
        }
    }

    /// Chronological page of the conversation between `caller` and `peer`,
    /// cut `skip` messages back from the newest one.
    pub async fn conversation(
        &self,
        caller: UserId,
        peer: UserId,
        query: &HistoryQuery,
    ) -> Result<Vec<MessagePayload>, ApiError> {
        let page = self.limits.page(query)?;

        let known = self.directory.user_exists(peer).await.map_err(|e| {
            error!(%peer, error = %e, "user directory lookup failed");
            ApiError::persistence("user directory unavailable")
        })?;
        if !known {
            return Err(ApiError::not_found(PEER_NOT_FOUND));
        }
        if page.limit == 0 {
            return Ok(Vec::new());
        }

        let messages = self
            .store
            .query(caller, peer, page.limit, page.offset)
            .await
            .map_err(|e| {
                error!(%caller, %peer, error = %e, "failed to load conversation");
                ApiError::persistence("failed to load messages")
            })?;
        Ok(messages.into_iter().map(MessagePayload::from).collect())
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
