//! `Fleet::Agent` actions.

use fleet_id::JobId;
use fleet_protocol::{
    Ack, AgentAction, HeartbeatResponse, PollJobsResponse, RegisterResponse,
};
use serde_json::Value;
use tracing::{error, info};

use crate::api::error::ApiError;
use crate::api::gatekeeper::to_result;
use crate::api::request_context::RequestContext;
use crate::db::StoreError;
use crate::jobs::{JobOutcome, QueueError};
use crate::state::AppState;

/// Upper bound on jobs handed out per poll.
const MAX_POLL_LIMIT: u32 = 50;

pub async fn dispatch(
    state: &AppState,
    ctx: &RequestContext,
    action: AgentAction,
) -> Result<Value, ApiError> {
    match action {
        AgentAction::Register(req) => {
            state
                .agents()
                .record_registration(&req)
                .await
                .map_err(|e| store_error(e, ctx, "Failed to record registration"))?;
            info!(
                agent_id = %req.agent_id,
                hostname = %req.hostname,
                tenant = req.tenant_slug.as_deref().unwrap_or(""),
                "Agent registered"
            );
            to_result(
                &RegisterResponse {
                    ok: true,
                    agent_id: req.agent_id,
                },
                ctx,
            )
        }
        AgentAction::Heartbeat(req) => {
            state
                .agents()
                .record_heartbeat(&req)
                .await
                .map_err(|e| store_error(e, ctx, "Failed to record heartbeat"))?;
            to_result(
                &HeartbeatResponse {
                    ok: true,
                    commands: Vec::new(),
                },
                ctx,
            )
        }
        AgentAction::PollJobs(req) => {
            let limit = req.limit.min(MAX_POLL_LIMIT) as usize;
            let jobs = state
                .jobs()
                .claim_next(&req.agent_id, &req.tenant_slug, limit)
                .await
                .map_err(|e| queue_error(e, ctx))?;
            to_result(
                &PollJobsResponse {
                    jobs: jobs.iter().map(|j| j.assignment()).collect(),
                },
                ctx,
            )
        }
        AgentAction::JobComplete(req) => {
            let job_id = parse_job_id(&req.job_id, ctx)?;
            state
                .jobs()
                .report(&job_id, Some(&req.agent_id), JobOutcome::Complete(req.result))
                .await
                .map_err(|e| queue_error(e, ctx))?;
            to_result(&Ack::OK, ctx)
        }
        AgentAction::JobFailed(req) => {
            let job_id = parse_job_id(&req.job_id, ctx)?;
            state
                .jobs()
                .report(&job_id, Some(&req.agent_id), JobOutcome::Failed(req.error))
                .await
                .map_err(|e| queue_error(e, ctx))?;
            to_result(&Ack::OK, ctx)
        }
    }
}

fn parse_job_id(raw: &str, ctx: &RequestContext) -> Result<JobId, ApiError> {
    JobId::parse(raw).map_err(|e| {
        ApiError::bad_request("invalid_job_id", format!("Invalid job_id: {e}"))
            .with_request_id(ctx.request_id.clone())
    })
}

pub(crate) fn store_error(err: StoreError, ctx: &RequestContext, what: &str) -> ApiError {
    error!(request_id = %ctx.request_id, error = %err, "{what}");
    ApiError::from(&err).with_request_id(ctx.request_id.clone())
}

pub(crate) fn queue_error(err: QueueError, ctx: &RequestContext) -> ApiError {
    let request_id = ctx.request_id.clone();
    match err {
        QueueError::NotFound(id) => {
            ApiError::not_found("job_not_found", format!("Job {id} not found"))
                .with_request_id(request_id)
        }
        QueueError::InvalidTransition { .. } => {
            ApiError::conflict("invalid_transition", err.to_string()).with_request_id(request_id)
        }
        QueueError::ClaimConflict { .. } => {
            // Lost ownership after a lease expiry; expected, not an alarm.
            info!(request_id = %request_id, error = %err, "Report from non-owner rejected");
            ApiError::conflict("claim_conflict", err.to_string()).with_request_id(request_id)
        }
        QueueError::Storage(e) => store_error(e, ctx, "Job queue storage failed"),
    }
}
