//! # Gateway Dispatch
//!
//! Per-request pipeline:
//!
//! `ParseRouteParams → LoadSchema → AcquireClient → ShapeRequest → Call → DecodeReply → RespondOK`
//!
//! Each stage either advances or exits with a [`GatewayError`]. Exactly one outbound call is
//! made per request, and only after shaping succeeded. The client cache is the only state
//! shared between requests.

use axum::http::StatusCode;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClientCache;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{ReplyEnvelope, RequestEnvelope};
use crate::schema::{validate_service_name, SchemaProvider};
use crate::shaping::RequestShaper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ParseRouteParams,
    LoadSchema,
    AcquireClient,
    ShapeRequest,
    Call,
    DecodeReply,
    RespondOk,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ParseRouteParams => "parse_route_params",
            Stage::LoadSchema => "load_schema",
            Stage::AcquireClient => "acquire_client",
            Stage::ShapeRequest => "shape_request",
            Stage::Call => "call",
            Stage::DecodeReply => "decode_reply",
            Stage::RespondOk => "respond_ok",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful dispatch result: the relayed body and the status taken from its `BaseResp`
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub status: StatusCode,
    pub body: Value,
}

pub struct GatewayDispatcher {
    schemas: Arc<dyn SchemaProvider>,
    clients: Arc<ClientCache>,
    shaper: RequestShaper,
}

impl GatewayDispatcher {
    pub fn new(
        schemas: Arc<dyn SchemaProvider>,
        clients: Arc<ClientCache>,
        shaper: RequestShaper,
    ) -> Self {
        Self {
            schemas,
            clients,
            shaper,
        }
    }

    pub fn clients(&self) -> &Arc<ClientCache> {
        &self.clients
    }

    /// Run the pipeline for one request
    pub async fn dispatch(
        &self,
        envelope: RequestEnvelope,
        cancel: &CancellationToken,
    ) -> GatewayResult<DispatchOutcome> {
        let started = Instant::now();
        let result = self.run(&envelope, cancel).await;

        match &result {
            Ok(outcome) => info!(
                request_id = %envelope.request_id,
                service = %envelope.service_name,
                method = %envelope.method_name,
                status = outcome.status.as_u16(),
                duration_ms = started.elapsed().as_millis() as u64,
                "Request dispatched"
            ),
            Err(e) => warn!(
                request_id = %envelope.request_id,
                service = %envelope.service_name,
                method = %envelope.method_name,
                error_type = e.error_type(),
                error = %e,
                duration_ms = started.elapsed().as_millis() as u64,
                "Request failed"
            ),
        }
        result
    }

    async fn run(
        &self,
        envelope: &RequestEnvelope,
        cancel: &CancellationToken,
    ) -> GatewayResult<DispatchOutcome> {
        let stage = |stage: Stage| {
            debug!(
                request_id = %envelope.request_id,
                service = %envelope.service_name,
                method = %envelope.method_name,
                stage = %stage,
                "Dispatch stage"
            );
        };

        stage(Stage::ParseRouteParams);
        validate_service_name(&envelope.service_name)?;
        if envelope.method_name.is_empty() {
            return Err(GatewayError::invalid_request("method name must not be empty"));
        }

        stage(Stage::LoadSchema);
        let descriptor = self.schemas.descriptor_for(&envelope.service_name)?;
        let codec = match self.schemas.load_schema(&descriptor).await {
            Ok(codec) => codec,
            Err(e @ GatewayError::SchemaNotFound { .. }) => {
                // A name discovery has never heard of is reported as such
                self.clients.check_known(&envelope.service_name).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        stage(Stage::AcquireClient);
        let client = self.clients.get_client(&descriptor, Arc::clone(&codec)).await?;

        stage(Stage::ShapeRequest);
        let payload = self.shaper.shape(
            &envelope.service_name,
            &envelope.method_name,
            &envelope.fields,
            Some(&codec),
        )?;

        stage(Stage::Call);
        let reply = client
            .call(
                &envelope.method_name,
                &payload,
                envelope.routing_hint.as_ref(),
                cancel,
            )
            .await?;

        stage(Stage::DecodeReply);
        let status = reply_status(&reply);

        stage(Stage::RespondOk);
        Ok(DispatchOutcome {
            status,
            body: reply,
        })
    }
}

/// HTTP status carried by a reply's `BaseResp`; 200 when absent or not a valid status
fn reply_status(reply: &Value) -> StatusCode {
    ReplyEnvelope::from_json(reply)
        .and_then(|envelope| StatusCode::from_u16(envelope.status_code).ok())
        .unwrap_or(StatusCode::OK)
}
