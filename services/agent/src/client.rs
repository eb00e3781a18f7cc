//! Control plane client for the agent.
//!
//! Every call is one envelope `POST` to the gatekeeper. Transport errors,
//! non-2xx replies and undecodable bodies are all returned as errors; the
//! runtime decides whether to log and carry on.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fleet_protocol::{
    Ack, AgentAction, ErrorReply, HeartbeatRequest, HeartbeatResponse, JobCompleteRequest,
    JobFailedRequest, PollJobsRequest, PollJobsResponse, RegisterRequest, RegisterResponse, Reply,
    Request, GATEKEEPER_PATH, TOKEN_HEADER,
};
use serde::de::DeserializeOwned;
use tracing::{debug, error};

/// The `Fleet::Agent` actions as seen from the agent.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse>;
    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse>;
    async fn poll_jobs(&self, request: PollJobsRequest) -> Result<PollJobsResponse>;
    async fn job_complete(&self, request: JobCompleteRequest) -> Result<Ack>;
    async fn job_failed(&self, request: JobFailedRequest) -> Result<Ack>;
}

/// Control plane client over HTTP.
pub struct HttpControlPlane {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl HttpControlPlane {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), GATEKEEPER_PATH),
            token: token.to_string(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, action: AgentAction) -> Result<T> {
        let name = action.name();
        let envelope = Request::Agent(action).into_envelope();
        debug!(action = name, "Calling control plane");

        let response = self
            .client
            .post(&self.url)
            .header(TOKEN_HEADER, &self.token)
            .json(&envelope)
            .send()
            .await
            .with_context(|| format!("{name}: request failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorReply>(&body)
                .map(|reply| format!("{}: {}", reply.error.code, reply.error.message))
                .unwrap_or(body);
            error!(action = name, status = %status, error = %message, "Control plane rejected call");
            anyhow::bail!("{name} failed: {status} - {message}");
        }

        let reply: Reply<T> = response
            .json()
            .await
            .with_context(|| format!("{name}: malformed reply"))?;
        Ok(reply.result)
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        self.call(AgentAction::Register(request)).await
    }

    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse> {
        self.call(AgentAction::Heartbeat(request)).await
    }

    async fn poll_jobs(&self, request: PollJobsRequest) -> Result<PollJobsResponse> {
        self.call(AgentAction::PollJobs(request)).await
    }

    async fn job_complete(&self, request: JobCompleteRequest) -> Result<Ack> {
        self.call(AgentAction::JobComplete(request)).await
    }

    async fn job_failed(&self, request: JobFailedRequest) -> Result<Ack> {
        self.call(AgentAction::JobFailed(request)).await
    }
}
