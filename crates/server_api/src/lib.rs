pub mod auth;
pub mod history;
pub mod presence;
pub mod router;
pub mod session;

use std::sync::Arc;

use shared::{domain::UserId, error::ApiError};
use storage::{MessageStore, Storage, UserDirectory};

use auth::{TokenVerifier, MISSING_TOKEN};
use history::{HistoryLimits, HistoryService};
use presence::PresenceRegistry;
use router::MessageRouter;
use session::SessionManager;

/// Everything a transport needs, wired once at startup.
#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub presence: PresenceRegistry,
    pub router: MessageRouter,
    pub sessions: SessionManager,
    pub history: HistoryService,
    verifier: Arc<dyn TokenVerifier>,
}

impl ApiContext {
    pub fn new(
        storage: Storage,
        verifier: Arc<dyn TokenVerifier>,
        limits: HistoryLimits,
    ) -> Self {
        let store: Arc<dyn MessageStore> = Arc::new(storage.clone());
        let directory: Arc<dyn UserDirectory> = Arc::new(storage.clone());
        let presence = PresenceRegistry::new();
        let router = MessageRouter::new(store.clone(), directory.clone(), presence.clone());
        let sessions = SessionManager::new(
            verifier.clone(),
            directory.clone(),
            presence.clone(),
            router.clone(),
        );
        let history = HistoryService::new(store, directory, limits);
        Self {
            storage,
            presence,
            router,
            sessions,
            history,
            verifier,
        }
    }

    /// Resolves the caller of a request-response call from its bearer credential.
    pub fn authenticate_bearer(&self, credential: Option<&str>) -> Result<UserId, ApiError> {
        let token = credential.ok_or_else(|| ApiError::unauthorized(MISSING_TOKEN))?;
        Ok(self.verifier.verify(token)?.user_id)
    }

    /// Reports whether the backing store answers.
    pub async fn health_check(&self) -> anyhow::Result<()> {
        self.storage.health_check().await
    }
}

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
