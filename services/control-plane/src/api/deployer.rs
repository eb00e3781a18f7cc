//! `Fleet::Deployer` actions, plus the CI webhook that starts release
//! rollouts.

use std::time::Duration;

use axum::{extract::State, http::StatusCode, Json};
use bytes::Bytes;
use fleet_protocol::{
    CiWebhookRequest, CiWebhookResponse, DeployerAction, JobSpec, ListJobsResponse,
    ScheduleRolloutResponse,
};
use serde_json::Value;
use tracing::{error, info};

use crate::api::agent::{queue_error, store_error};
use crate::api::auth::{Caller, Role};
use crate::api::error::ApiError;
use crate::api::gatekeeper::to_result;
use crate::api::request_context::RequestContext;
use crate::deployer::{ProvisionError, RebootError, RolloutError, RolloutPlan};
use crate::state::AppState;

pub async fn dispatch(
    state: &AppState,
    ctx: &RequestContext,
    action: DeployerAction,
) -> Result<Value, ApiError> {
    match action {
        DeployerAction::ProvisionTenant(req) => {
            let tenant = state
                .deployer()
                .provision_tenant(&req.slug, &req.plan, &req.ssh_keys)
                .await
                .map_err(|e| provision_error(e, ctx))?;
            to_result(&tenant, ctx)
        }
        DeployerAction::RebootTenant(req) => {
            let tenant = state
                .deployer()
                .reboot_tenant(&req.slug)
                .await
                .map_err(|e| reboot_error(e, ctx))?;
            to_result(&tenant, ctx)
        }
        DeployerAction::ScheduleRollout(req) => {
            let plan = RolloutPlan {
                artifact_url: req.artifact_url,
                signature_url: req.signature_url,
                tag: req.tag,
                tenant_slugs: req.tenants,
                batch_size: req.batch_size,
                pause: Duration::from_secs(req.pause_secs),
                halt_on_failure: req.halt_on_failure,
            };
            // Runs in the background; pauses must not hold the request open.
            let handle = state
                .deployer()
                .spawn_rollout(plan)
                .await
                .map_err(|e| rollout_error(e, ctx))?;
            info!(
                request_id = %ctx.request_id,
                rollout_id = %handle.rollout_id,
                count = handle.planned,
                "Rollout scheduled"
            );
            to_result(
                &ScheduleRolloutResponse {
                    scheduled: true,
                    count: handle.planned,
                    rollout_id: handle.rollout_id,
                },
                ctx,
            )
        }
        DeployerAction::GetRollout(req) => {
            let rollout = state
                .deployer()
                .rollout(&req.rollout_id)
                .await
                .map_err(|e| store_error(e, ctx, "Failed to load rollout"))?
                .ok_or_else(|| {
                    ApiError::not_found(
                        "unknown_rollout",
                        format!("Rollout {} does not exist", req.rollout_id),
                    )
                    .with_request_id(ctx.request_id.clone())
                })?;
            to_result(&rollout, ctx)
        }
        DeployerAction::EnqueueJob(req) => {
            let spec = JobSpec::parse(&req.job_type, req.payload).map_err(|e| {
                ApiError::from(&e).with_request_id(ctx.request_id.clone())
            })?;
            let tenant = state
                .tenants()
                .find_by_slug(&req.tenant_slug)
                .await
                .map_err(|e| store_error(e, ctx, "Failed to load tenant"))?;
            if tenant.is_none() {
                return Err(unknown_tenant(&req.tenant_slug, ctx));
            }

            let job = state
                .jobs()
                .enqueue(&req.tenant_slug, spec)
                .await
                .map_err(|e| queue_error(e, ctx))?;
            to_result(&job, ctx)
        }
        DeployerAction::ListJobs(req) => {
            let jobs = state
                .jobs()
                .list(&req.tenant_slug, req.status)
                .await
                .map_err(|e| queue_error(e, ctx))?;
            to_result(&ListJobsResponse { jobs }, ctx)
        }
    }
}

/// `POST /webhook/ci`: rolls a new signed release out to every tenant.
///
/// Needs the operator token. Answers `202 Accepted` as soon as the rollout is
/// recorded; batches follow in the background.
pub async fn ci_webhook(
    State(state): State<AppState>,
    ctx: RequestContext,
    caller: Caller,
    body: Bytes,
) -> Result<(StatusCode, Json<CiWebhookResponse>), ApiError> {
    if caller.role != Role::Operator {
        return Err(ApiError::forbidden(
            "forbidden",
            format!("{} token may not start rollouts", caller.role.as_str()),
        )
        .with_request_id(ctx.request_id));
    }

    let req: CiWebhookRequest = serde_json::from_slice(&body).map_err(|e| {
        ApiError::bad_request("invalid_body", format!("Body is not a valid CI webhook: {e}"))
            .with_request_id(ctx.request_id.clone())
    })?;

    let handle = state
        .deployer()
        .spawn_release_rollout(&req.artifact_url, &req.signature_url, &req.tag)
        .await
        .map_err(|e| rollout_error(e, &ctx))?;
    info!(
        request_id = %ctx.request_id,
        rollout_id = %handle.rollout_id,
        tag = %req.tag,
        count = handle.planned,
        "Release rollout scheduled"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(CiWebhookResponse {
            result: "scheduled".to_string(),
            tag: req.tag,
            rollout_id: handle.rollout_id,
            count: handle.planned,
        }),
    ))
}

fn unknown_tenant(slug: &str, ctx: &RequestContext) -> ApiError {
    ApiError::not_found("unknown_tenant", format!("Tenant {slug} does not exist"))
        .with_request_id(ctx.request_id.clone())
}

fn provision_error(err: ProvisionError, ctx: &RequestContext) -> ApiError {
    let request_id = ctx.request_id.clone();
    match err {
        ProvisionError::DuplicateSlug(slug) => {
            ApiError::conflict("duplicate_slug", format!("Tenant {slug} already exists"))
                .with_request_id(request_id)
        }
        ProvisionError::InvalidSlug { .. } => {
            ApiError::bad_request("invalid_slug", err.to_string()).with_request_id(request_id)
        }
        ProvisionError::Provider(e) => {
            error!(request_id = %request_id, error = %e, "Instance provider failed");
            ApiError::bad_gateway("provider_error", e.to_string()).with_request_id(request_id)
        }
        ProvisionError::Storage(e) => store_error(e, ctx, "Failed to record tenant"),
    }
}

fn reboot_error(err: RebootError, ctx: &RequestContext) -> ApiError {
    let request_id = ctx.request_id.clone();
    match err {
        RebootError::UnknownTenant(slug) => unknown_tenant(&slug, ctx),
        RebootError::Provider(e) => {
            error!(request_id = %request_id, error = %e, "Instance provider failed");
            ApiError::bad_gateway("provider_error", e.to_string()).with_request_id(request_id)
        }
        RebootError::Storage(e) => store_error(e, ctx, "Failed to load tenant"),
    }
}

fn rollout_error(err: RolloutError, ctx: &RequestContext) -> ApiError {
    match err {
        RolloutError::InvalidPlan(reason) => ApiError::bad_request("invalid_plan", reason)
            .with_request_id(ctx.request_id.clone()),
        RolloutError::UnknownTenant(slug) => unknown_tenant(&slug, ctx),
        RolloutError::ShuttingDown => ApiError::service_unavailable("shutting_down", err.to_string())
            .with_request_id(ctx.request_id.clone()),
        RolloutError::Storage(e) => store_error(e, ctx, "Failed to validate rollout"),
        RolloutError::Queue(e) => queue_error(e, ctx),
    }
}
