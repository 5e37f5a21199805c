//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the HTTP surface of the relay using Axum. Subscribers connect to a
// WebSocket endpoint and receive order events; health and stats endpoints report on the relay.
//
// | Component      | Description                                                |
// |----------------|------------------------------------------------------------|
// | API            | Router construction and server loop                        |
// | Routes         | Handler functions for API endpoints                        |
// | Auth           | Credential validation and tenant scoping                   |
// | WebSocketSink  | Delivery sink writing to an upgraded socket                |
// | DTOs           | Wire shapes for events and responses                       |
//
//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name           | Description                                       | Key Methods       |
// |----------------|---------------------------------------------------|-------------------|
// | AppState       | Shared application state                          | new               |
// | Api            | Main API structure                                | routes, serve     |
//--------------------------------------------------------------------------------------------------

mod auth;
mod dto;
mod error;
mod routes;
mod ws_sink;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Extension, Router,
    http::{Method, header},
    routing::get,
};
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::domain::services::delivery::DeliveryManager;

pub use auth::{
    AuthError, Authenticator, Principal, StaticTokenAuthenticator, TenantResolver, bearer_token,
};
pub use dto::*;
pub use error::{ApiError, ApiResult};
pub use routes::CONNECTION_ID_HEADER;
pub use ws_sink::WebSocketSink;

/// Shared application state accessible by all handlers
pub struct AppState {
    /// Delivery pipeline, including the event bus and registry
    pub delivery: Arc<DeliveryManager>,
    /// Validates stream credentials
    pub authenticator: Arc<dyn Authenticator>,
    /// Maps principals to their restaurant scope
    pub tenant_resolver: Arc<dyn TenantResolver>,
    /// Server start time
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Creates a new application state
    pub fn new(
        delivery: Arc<DeliveryManager>,
        authenticator: Arc<dyn Authenticator>,
        tenant_resolver: Arc<dyn TenantResolver>,
    ) -> Self {
        Self {
            delivery,
            authenticator,
            tenant_resolver,
            started_at: Utc::now(),
        }
    }

    /// State backed by a static token table, which also scopes principals.
    pub fn with_static_tokens(delivery: Arc<DeliveryManager>, tokens: StaticTokenAuthenticator) -> Self {
        let tokens = Arc::new(tokens);
        Self::new(delivery, tokens.clone(), tokens)
    }
}

/// Main API structure
pub struct Api {
    /// API address
    addr: SocketAddr,
    /// Shared application state
    state: Arc<AppState>,
}

impl Api {
    /// Creates a new API instance
    pub fn new(addr: SocketAddr, state: Arc<AppState>) -> Self {
        Self { addr, state }
    }

    /// Creates all routes for the API
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers([header::AUTHORIZATION, header::ACCEPT, header::CONTENT_TYPE])
            .expose_headers([header::HeaderName::from_static(CONNECTION_ID_HEADER)]);

        Router::new()
            // Health check
            .route("/health", get(routes::health))
            .route("/stats", get(routes::stats))
            // Subscriber stream
            .route("/orders/stream", get(routes::order_stream))
            // Attach application state
            .layer(Extension(self.state.clone()))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
    }

    /// Starts the API server and runs until `shutdown` fires
    pub async fn serve(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let app = self.routes();

        let listener = TcpListener::bind(self.addr).await?;
        info!("API listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }
}
