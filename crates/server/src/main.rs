use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        rejection::QueryRejection,
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use server_api::{
    auth::{bearer_token, JwtVerifier},
    history::{HistoryLimits, HistoryQuery, PEER_NOT_FOUND},
    session::{Dispatch, Session},
    ApiContext,
};
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
    protocol::{MessagePayload, ServerEvent},
};
use storage::Storage;
use tokio::{sync::mpsc, time::Instant};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

const SEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    if settings.uses_dev_secret() {
        warn!("JWT secret is the built-in development value; set JWT_SECRET");
    }

    let database_url = prepare_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let api = ApiContext::new(
        storage,
        Arc::new(JwtVerifier::new(&settings.jwt_secret)),
        HistoryLimits {
            default_limit: settings.history_default_limit,
            max_limit: settings.history_max_limit,
        },
    );
    let state = AppState {
        api,
        outbound_capacity: settings.session_outbound_capacity,
        enforce_token_expiry: settings.enforce_token_expiry,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/healthz", get(healthz))
        .route("/messages/:peer_id", get(http_history))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn banner() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "direct message server",
        "status": "running",
        "endpoints": ["/ws", "/messages/:peer_id", "/healthz"],
    }))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    match state.api.health_check().await {
        Ok(()) => "ok".into_response(),
        Err(error) => {
            error!(%error, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable").into_response()
        }
    }
}

fn api_error(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Persistence => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Delivery | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

fn query_rejection(rejection: QueryRejection) -> (StatusCode, Json<ApiError>) {
    api_error(ApiError::validation(format!(
        "invalid query string: {}",
        rejection.body_text()
    )))
}

fn bearer_from(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
}

async fn http_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(peer_id): Path<String>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<Vec<MessagePayload>>, (StatusCode, Json<ApiError>)> {
    let caller = state
        .api
        .authenticate_bearer(bearer_from(&headers))
        .map_err(api_error)?;
    let peer = peer_id
        .trim()
        .parse::<i64>()
        .map(UserId)
        .map_err(|_| api_error(ApiError::not_found(PEER_NOT_FOUND)))?;
    let Query(query) = query.map_err(query_rejection)?;

    let messages = state
        .api
        .history
        .conversation(caller, peer, &query)
        .await
        .map_err(api_error)?;
    Ok(Json(messages))
}

/// Credentials are checked before the upgrade so a refused client never
/// gets an open socket.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Result<Query<WsQuery>, QueryRejection>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let q = match query {
        Ok(Query(q)) => q,
        Err(rejection) => return query_rejection(rejection).into_response(),
    };
    let credential = q.token.as_deref().or_else(|| bearer_from(&headers));
    let mut session = Session::new();
    if let Err(err) = state.api.sessions.authenticate(&mut session, credential).await {
        return api_error(err).into_response();
    }

    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| ws_connection(state, socket, session))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, mut session: Session) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound, mut events_rx) = mpsc::channel::<ServerEvent>(state.outbound_capacity.max(1));

    if let Err(err) = state.api.sessions.activate(&mut session, outbound).await {
        warn!(session = %session.handle(), reason = %err.message, "session activation failed");
        state.api.sessions.close(&mut session).await;
        return;
    }

    let handle = session.handle();
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(error) => {
                    error!(session = %handle, %error, "failed to encode event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let deadline = expiry_deadline(&state, &session);
    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if state.api.sessions.handle_frame(&session, &text).await == Dispatch::Close {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    debug!(session = %handle, %error, "socket read failed");
                    break;
                }
            },
            () = wait_until(deadline) => {
                state.api.sessions.expire(&mut session).await;
                break;
            }
        }
    }

    state.api.sessions.close(&mut session).await;
    // Closing dropped the session's senders; the writer flushes what is queued and exits.
    if tokio::time::timeout(SEND_DRAIN_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
}

fn expiry_deadline(state: &AppState, session: &Session) -> Option<Instant> {
    if !state.enforce_token_expiry {
        return None;
    }
    let remaining = session.expires_at()? - Utc::now();
    Some(Instant::now() + remaining.to_std().unwrap_or(Duration::ZERO))
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
