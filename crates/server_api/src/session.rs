//! Per-connection lifecycle: `Connecting -> Authenticated -> Active -> Closed`.
//!
//! Nothing here touches a socket. The transport feeds frames in and drains the
//! session's outbound queue, so every transition can be driven from tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{
    domain::{SessionHandle, UserId},
    error::ApiError,
    protocol::{ClientRequest, ServerEvent},
};
use storage::UserDirectory;
use tracing::{debug, error, info, warn};

use crate::{
    auth::{TokenVerifier, MISSING_TOKEN},
    presence::{push, PresenceRegistry, SessionSender},
    router::MessageRouter,
};

pub const ALREADY_AUTHENTICATED: &str = "session already authenticated";
pub const NOT_AUTHENTICATED: &str = "not authenticated";
pub const MALFORMED_FRAME: &str = "receiver_id and content are required";
pub const TOKEN_EXPIRED: &str = "authentication token expired";
pub const UNKNOWN_USER: &str = "user not found";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated {
        user_id: UserId,
        expires_at: Option<DateTime<Utc>>,
    },
    Active {
        user_id: UserId,
        expires_at: Option<DateTime<Utc>>,
    },
    Closed,
}

/// What the transport should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Close,
}

#[derive(Debug)]
pub struct Session {
    handle: SessionHandle,
    created_at: DateTime<Utc>,
    state: SessionState,
    outbound: Option<SessionSender>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            handle: SessionHandle::new(),
            created_at: Utc::now(),
            state: SessionState::Connecting,
            outbound: None,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self.state {
            SessionState::Authenticated { user_id, .. } | SessionState::Active { user_id, .. } => {
                Some(user_id)
            }
            SessionState::Connecting | SessionState::Closed => None,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            SessionState::Authenticated { expires_at, .. }
            | SessionState::Active { expires_at, .. } => expires_at,
            SessionState::Connecting | SessionState::Closed => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Best-effort push to this session only.
    fn emit(&self, event: ServerEvent) {
        let Some(outbound) = &self.outbound else {
            return;
        };
        if let Err(error) = push(self.handle, outbound, event) {
            debug!(session = %self.handle, %error, "could not emit to own session");
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct SessionManager {
    verifier: Arc<dyn TokenVerifier>,
    directory: Arc<dyn UserDirectory>,
    presence: PresenceRegistry,
    router: MessageRouter,
}

impl SessionManager {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        directory: Arc<dyn UserDirectory>,
        presence: PresenceRegistry,
        router: MessageRouter,
    ) -> Self {
        Self {
            verifier,
            directory,
            presence,
            router,
        }
    }

    /// `Connecting -> Authenticated`. Any failure closes the session, which
    /// was never registered and must not be opened.
    pub async fn authenticate(
        &self,
        session: &mut Session,
        credential: Option<&str>,
    ) -> Result<UserId, ApiError> {
        if session.state != SessionState::Connecting {
            return Err(ApiError::validation(ALREADY_AUTHENTICATED));
        }

        let result = self.resolve(credential).await;
        match result {
            Ok((user_id, expires_at)) => {
                session.state = SessionState::Authenticated {
                    user_id,
                    expires_at,
                };
                debug!(session = %session.handle, %user_id, "session authenticated");
                Ok(user_id)
            }
            Err(err) => {
                session.state = SessionState::Closed;
                warn!(session = %session.handle, reason = %err.message, "connection refused");
                Err(err)
            }
        }
    }

    async fn resolve(
        &self,
        credential: Option<&str>,
    ) -> Result<(UserId, Option<DateTime<Utc>>), ApiError> {
        let token = credential
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ApiError::unauthorized(MISSING_TOKEN))?;
        let identity = self.verifier.verify(token)?;
        let known = self
            .directory
            .user_exists(identity.user_id)
            .await
            .map_err(|e| {
                error!(user_id = %identity.user_id, error = %e, "user directory lookup failed");
                ApiError::persistence("user directory unavailable")
            })?;
        if !known {
            return Err(ApiError::unauthorized(UNKNOWN_USER));
        }
        Ok((identity.user_id, identity.expires_at))
    }

    /// `Authenticated -> Active`: registers presence and confirms the connection.
    pub async fn activate(
        &self,
        session: &mut Session,
        outbound: SessionSender,
    ) -> Result<(), ApiError> {
        let SessionState::Authenticated {
            user_id,
            expires_at,
        } = session.state
        else {
            return Err(ApiError::unauthorized(NOT_AUTHENTICATED));
        };

        self.presence
            .register(user_id, session.handle, outbound.clone())
            .await;
        session.outbound = Some(outbound);
        session.state = SessionState::Active {
            user_id,
            expires_at,
        };
        info!(session = %session.handle, %user_id, "session active");
        session.emit(ServerEvent::Connected { user_id });
        Ok(())
    }

    pub async fn dispatch(
        &self,
        session: &Session,
        request: ClientRequest,
    ) -> Result<Dispatch, ApiError> {
        let SessionState::Active { user_id, .. } = session.state else {
            return Err(ApiError::unauthorized(NOT_AUTHENTICATED));
        };

        match request {
            ClientRequest::SendMessage {
                receiver_id,
                content,
            } => {
                self.router.send(user_id, receiver_id, &content).await?;
                Ok(Dispatch::Continue)
            }
            ClientRequest::Authenticate { .. } => Err(ApiError::validation(ALREADY_AUTHENTICATED)),
            ClientRequest::Quit => Ok(Dispatch::Close),
        }
    }

    /// Parses and dispatches one text frame. Rejections are reported to this
    /// session as `error` events and never end the connection.
    pub async fn handle_frame(&self, session: &Session, raw: &str) -> Dispatch {
        let request = match serde_json::from_str::<ClientRequest>(raw) {
            Ok(request) => request,
            Err(e) => {
                debug!(session = %session.handle, error = %e, "unparsable frame");
                session.emit(ServerEvent::Error(ApiError::validation(MALFORMED_FRAME)));
                return Dispatch::Continue;
            }
        };

        match self.dispatch(session, request).await {
            Ok(next) => next,
            Err(err) => {
                warn!(session = %session.handle, code = ?err.code, reason = %err.message, "request rejected");
                session.emit(ServerEvent::Error(err));
                Dispatch::Continue
            }
        }
    }

    /// Whether the credential bound to `session` has lapsed at `now`.
    pub fn token_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        session
            .expires_at()
            .is_some_and(|expires_at| expires_at <= now)
    }

    /// Tells the client why, then closes.
    pub async fn expire(&self, session: &mut Session) {
        if session.is_closed() {
            return;
        }
        session.emit(ServerEvent::Error(ApiError::unauthorized(TOKEN_EXPIRED)));
        info!(session = %session.handle, "closing session with expired token");
        self.close(session).await;
    }

    /// Any state -> `Closed`. Safe to call repeatedly.
    pub async fn close(&self, session: &mut Session) {
        if session.is_closed() && session.outbound.is_none() {
            return;
        }
        let previous = std::mem::replace(&mut session.state, SessionState::Closed);
        session.outbound = None;
        if let Some(user_id) = self.presence.unregister(session.handle).await {
            info!(session = %session.handle, %user_id, ?previous, "session closed");
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
