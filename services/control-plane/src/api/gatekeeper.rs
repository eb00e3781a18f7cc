//! `POST /fleet/gatekeeper`: the single authenticated RPC endpoint.

use axum::{extract::State, Json};
use bytes::Bytes;
use fleet_protocol::{Envelope, Reply, Request};
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::auth::Caller;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::api::{agent, deployer};
use crate::state::AppState;

pub async fn handle(
    State(state): State<AppState>,
    ctx: RequestContext,
    caller: Caller,
    body: Bytes,
) -> Result<Json<Reply<Value>>, ApiError> {
    let envelope: Envelope = serde_json::from_slice(&body).map_err(|e| {
        ApiError::bad_request("invalid_envelope", format!("Body is not a valid envelope: {e}"))
            .with_request_id(ctx.request_id.clone())
    })?;

    let request = envelope.decode().map_err(|e| {
        warn!(
            request_id = %ctx.request_id,
            service = %envelope.service,
            action = %envelope.action,
            error = %e,
            "Rejected envelope"
        );
        ApiError::from(&e).with_request_id(ctx.request_id.clone())
    })?;

    if !caller.role.permits(request.service()) {
        return Err(ApiError::forbidden(
            "forbidden",
            format!("{} token may not call {}", caller.role.as_str(), request.service()),
        )
        .with_request_id(ctx.request_id));
    }

    debug!(
        request_id = %ctx.request_id,
        service = %request.service(),
        action = request.action(),
        role = caller.role.as_str(),
        "Dispatching"
    );

    let result = match request {
        Request::Agent(action) => agent::dispatch(&state, &ctx, action).await?,
        Request::Deployer(action) => deployer::dispatch(&state, &ctx, action).await?,
    };
    Ok(Json(Reply::ok(result)))
}

/// Serializes a handler result into the reply's `result` value.
pub(crate) fn to_result<T: serde::Serialize>(
    value: &T,
    ctx: &RequestContext,
) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| {
        tracing::error!(request_id = %ctx.request_id, error = %e, "Failed to encode reply");
        ApiError::internal("internal_error", "Failed to encode reply")
            .with_request_id(ctx.request_id.clone())
    })
}
