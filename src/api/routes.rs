//--------------------------------------------------------------------------------------------------
// FUNCTIONS
//--------------------------------------------------------------------------------------------------
// | Name                  | Description                                   | Return Type         |
// |-----------------------|-----------------------------------------------|---------------------|
// | health                | Health check endpoint                         | Response            |
// | stats                 | Subscriber and replay buffer statistics       | Response            |
// | order_stream          | Authenticates and upgrades a subscriber       | ApiResult<Response> |
// | serve_subscriber      | Runs one upgraded subscriber connection       | ()                  |
//--------------------------------------------------------------------------------------------------

use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Extension, Query,
        rejection::QueryRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::auth::{AuthError, bearer_token};
use super::ws_sink::WebSocketSink;
use super::{ApiError, ApiResult, AppState, StatsResponse, StreamParams};
use crate::domain::models::types::{ConnectionId, RestaurantId};
use crate::domain::services::delivery::{DeliveryManager, ResumeFrom};

/// Response header carrying the id a client can later resume with
pub const CONNECTION_ID_HEADER: &str = "x-connection-id";

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok"
    }))
}

/// Subscriber and replay buffer statistics
pub async fn stats(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    let bus = state.delivery.event_bus();
    Json(StatsResponse {
        active_subscribers: state.delivery.registry().len(),
        last_event_id: bus.last_event_id(),
        buffered_events: bus.buffered_len(),
        oldest_buffered_id: bus.oldest_buffered_id(),
        replay_capacity: bus.replay_capacity(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
    })
}

/// Order event stream.
///
/// The caller is authenticated before the upgrade, so bad credentials get a
/// plain 401 instead of a WebSocket that closes right away. Malformed query
/// strings get the usual JSON error body.
pub async fn order_stream(
    Extension(state): Extension<Arc<AppState>>,
    params: Result<Query<StreamParams>, QueryRejection>,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
) -> ApiResult<Response> {
    let Query(params) = params.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;

    let credential = bearer_token(&headers)
        .or(params.token.as_deref())
        .ok_or(AuthError::MissingCredential)?;

    let principal = state.authenticator.authenticate(credential).await?;
    let scope = state.tenant_resolver.resolve(&principal);
    let resume = params.resume_from()?;

    let upgrade = upgrade.ok_or_else(|| {
        ApiError::UpgradeRequired("/orders/stream only accepts WebSocket connections".to_string())
    })?;

    let connection_id = ConnectionId::new();
    info!(
        "Accepted subscriber {} for {} (scope {:?}, resume {:?})",
        connection_id, principal.subject, scope, resume
    );

    let delivery = Arc::clone(&state.delivery);
    let mut response = upgrade.on_upgrade(move |socket| {
        serve_subscriber(delivery, socket, connection_id, scope, resume)
    });

    let header_value = HeaderValue::from_str(&connection_id.to_string())
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    response.headers_mut().insert(CONNECTION_ID_HEADER, header_value);

    Ok(response)
}

/// Runs one subscriber connection until either side closes it.
///
/// The write half belongs to the delivery manager; this task reads client
/// frames, which count as liveness, and reports the client going away.
pub async fn serve_subscriber(
    delivery: Arc<DeliveryManager>,
    socket: WebSocket,
    connection_id: ConnectionId,
    scope: Option<RestaurantId>,
    resume: ResumeFrom,
) {
    let (sender, mut receiver) = socket.split();

    let subscription = match delivery
        .attach_as(connection_id, WebSocketSink::new(sender), scope, resume)
        .await
    {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("Subscriber {} refused: {}", connection_id, e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = subscription.closed() => break,
            frame = receiver.next() => match frame {
                Some(Ok(Message::Close(_))) | None => {
                    delivery.detach(connection_id);
                    break;
                }
                Some(Ok(_)) => {
                    delivery.registry().touch(connection_id);
                }
                Some(Err(e)) => {
                    debug!("Subscriber {} read failed: {}", connection_id, e);
                    delivery.detach(connection_id);
                    break;
                }
            },
        }
    }

    subscription.finished().await;
}
