//! # Gateway HTTP Server
//!
//! axum surface of the gateway:
//!
//! - `POST /proxy/:service/:method`: JSON object body, relayed to the backend method
//! - `GET /ping`: liveness probe answering `{"message": "pong"}`
//! - `GET /health`, `GET /ready`: process health and readiness
//!
//! Each proxied request runs on its own task with a [`CancellationToken`]; if the inbound
//! connection goes away the token fires and the in-flight call is abandoned.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::client::ClientCache;
use crate::core::config::{GatewayConfig, ServerConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{RequestEnvelope, RoutingHint};
use crate::discovery::{create_resolver, ServiceResolver};
use crate::gateway::dispatch::GatewayDispatcher;
use crate::protocols::{TcpTransport, Transport};
use crate::schema::{SchemaProvider, ThriftFileProvider};
use crate::shaping::RequestShaper;

/// Header carrying the sticky routing key
pub const CONSISTENCY_KEY_HEADER: &str = "x-consistency-key";
/// Header carrying a caller-chosen request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub dispatcher: Arc<GatewayDispatcher>,
}

/// Gateway server: the axum app plus the background tasks it owns
pub struct GatewayServer {
    config: ServerConfig,
    app: Router,
    background: Vec<JoinHandle<()>>,
}

impl GatewayServer {
    /// Wire every component described by `config`
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let schemas: Arc<dyn SchemaProvider> =
            Arc::new(ThriftFileProvider::new(config.schema.clone()));
        let (resolver, refresh_task) = create_resolver(&config.discovery)?;
        let transport: Arc<dyn Transport> =
            Arc::new(TcpTransport::new(config.client.call_timeout.min(Duration::from_secs(5))));

        let mut server = Self::with_components(config, schemas, resolver, transport);
        server.background.extend(refresh_task);
        Ok(server)
    }

    /// Build around explicitly provided collaborators
    pub fn with_components(
        config: &GatewayConfig,
        schemas: Arc<dyn SchemaProvider>,
        resolver: Arc<dyn ServiceResolver>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let clients = Arc::new(ClientCache::new(resolver, transport, config.client.clone()));
        let shaper = RequestShaper::new(&config.shaping);
        let state = ServerState {
            dispatcher: Arc::new(GatewayDispatcher::new(schemas, clients, shaper)),
        };

        Self {
            config: config.server.clone(),
            app: build_router(state, config.server.max_body_size),
            background: Vec::new(),
        }
    }

    /// The axum application, for serving or in-process testing
    pub fn app(&self) -> Router {
        self.app.clone()
    }

    pub fn bind_addr(&self) -> GatewayResult<SocketAddr> {
        format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| GatewayError::config(format!("Invalid bind address: {}", e)))
    }

    /// Serve until `shutdown` fires, then finish in-flight requests
    #[instrument(skip(self, shutdown))]
    pub async fn start(self, shutdown: CancellationToken) -> GatewayResult<()> {
        let bind_addr = self.bind_addr()?;
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            GatewayError::internal(format!("Failed to bind gateway server to {}: {}", bind_addr, e))
        })?;
        info!("Gateway HTTP server listening on {}", bind_addr);

        let result = axum::serve(listener, self.app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)));

        for task in self.background {
            task.abort();
        }
        result
    }
}

/// Build the gateway routes
pub fn build_router(state: ServerState, max_body_size: usize) -> Router {
    Router::new()
        .route("/proxy/:service/:method", post(proxy_handler))
        .route("/ping", get(ping))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
}

/// Parse the body into the request field map; an empty body is an empty object
fn parse_fields(body: &[u8]) -> GatewayResult<Map<String, Value>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body)? {
        Value::Object(fields) => Ok(fields),
        other => Err(GatewayError::invalid_request(format!(
            "request body must be a JSON object, got {}",
            crate::schema::json_kind(&other)
        ))),
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

async fn proxy_handler(
    State(state): State<ServerState>,
    Path((service, method)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let fields = match parse_fields(&body) {
        Ok(fields) => fields,
        Err(e) => return e.into_response(),
    };

    let mut envelope = RequestEnvelope::new(service, method, fields)
        .with_routing_hint(header(&headers, CONSISTENCY_KEY_HEADER).map(RoutingHint::new));
    if let Some(request_id) = header(&headers, REQUEST_ID_HEADER) {
        envelope = envelope.with_request_id(request_id);
    }

    // Fires when this handler is dropped, i.e. when the caller disconnects
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let dispatcher = Arc::clone(&state.dispatcher);
    let task = tokio::spawn(async move { dispatcher.dispatch(envelope, &cancel).await });

    match task.await {
        Ok(Ok(outcome)) => (outcome.status, Json(outcome.body)).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => GatewayError::internal(format!("dispatch task failed: {}", e)).into_response(),
    }
}

async fn ping() -> impl IntoResponse {
    Json(json!({ "message": "pong" }))
}

/// Health check handler
pub async fn health_check() -> impl IntoResponse {
    let health_info = json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "service": "gateway"
    });

    (StatusCode::OK, Json(health_info))
}

/// Readiness check handler
pub async fn readiness_check(State(state): State<ServerState>) -> impl IntoResponse {
    let readiness_info = json!({
        "status": "ready",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "gateway",
        "checks": {
            "cached_clients": state.dispatcher.clients().len(),
        }
    });

    (StatusCode::OK, Json(readiness_info))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fields() {
        assert!(parse_fields(b"").unwrap().is_empty());
        assert!(parse_fields(b"  \n").unwrap().is_empty());
        assert_eq!(parse_fields(br#"{"userID": 42}"#).unwrap()["userID"], 42);

        let err = parse_fields(b"[1]").unwrap_err();
        assert_eq!(err.error_type(), "invalid_request");
        assert!(parse_fields(b"{oops").is_err());
    }

    #[test]
    fn test_header_trimmed_and_non_empty() {
        let mut headers = HeaderMap::new();
        headers.insert(CONSISTENCY_KEY_HEADER, " user-1 ".parse().unwrap());
        headers.insert(REQUEST_ID_HEADER, "".parse().unwrap());
        assert_eq!(header(&headers, CONSISTENCY_KEY_HEADER), Some("user-1"));
        assert_eq!(header(&headers, REQUEST_ID_HEADER), None);
    }

    #[test]
    fn test_bind_addr() {
        let server = GatewayServer::with_components(
            &GatewayConfig::default(),
            Arc::new(ThriftFileProvider::new(Default::default())),
            Arc::new(crate::discovery::InMemoryRegistry::new()),
            Arc::new(TcpTransport::default()),
        );
        assert_eq!(server.bind_addr().unwrap().port(), 8080);
    }
}
