//! Gatekeeper client for `Fleet::Deployer` actions.

use anyhow::{Context, Result};
use fleet_protocol::{DeployerAction, ErrorReply, Reply, Request, GATEKEEPER_PATH, TOKEN_HEADER};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;

use crate::error::CliError;

/// Client for the control plane's gatekeeper endpoint.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    url: String,
}

impl ApiClient {
    pub fn new(control_url: &str, token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            TOKEN_HEADER,
            HeaderValue::from_str(token).context("Invalid token format")?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: format!("{}{}", control_url.trim_end_matches('/'), GATEKEEPER_PATH),
        })
    }

    /// Sends one deployer action and decodes its result.
    pub async fn call<T: DeserializeOwned>(&self, action: DeployerAction) -> Result<T, CliError> {
        let envelope = Request::Deployer(action).into_envelope();
        let response = self.client.post(&self.url).json(&envelope).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.error_from(response).await);
        }

        let reply: Reply<T> = response
            .json()
            .await
            .map_err(|e| CliError::Other(anyhow::anyhow!("Failed to parse response: {}", e)))?;
        Ok(reply.result)
    }

    async fn error_from(&self, response: reqwest::Response) -> CliError {
        let status = response.status().as_u16();
        if status == 401 {
            return CliError::NotAuthenticated;
        }

        match response.json::<ErrorReply>().await {
            Ok(reply) => CliError::api(
                status,
                reply.error.code,
                reply.error.message,
                reply.error.request_id,
            ),
            Err(_) => CliError::api(status, "unknown", "Unknown error", None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_protocol::{ListJobsRequest, ListJobsResponse, ProvisionTenantRequest, Tenant};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_gatekeeper_url() {
        let client = ApiClient::new("http://cp.internal:8080/", "t").unwrap();
        assert_eq!(client.url, "http://cp.internal:8080/fleet/gatekeeper");
    }

    #[tokio::test]
    async fn test_call_sends_deployer_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fleet/gatekeeper"))
            .and(header("x-fleet-token", "op-secret"))
            .and(body_partial_json(json!({
                "service": "Fleet::Deployer",
                "action": "list_jobs",
                "payload": {"tenant_slug": "acme"},
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": {"jobs": []},
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri(), "op-secret").unwrap();
        let response: ListJobsResponse = client
            .call(DeployerAction::ListJobs(ListJobsRequest {
                tenant_slug: "acme".to_string(),
                status: None,
            }))
            .await
            .unwrap();
        assert!(response.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_error_reply_is_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "success": false,
                "error": {
                    "code": "duplicate_slug",
                    "message": "tenant acme already exists",
                    "request_id": "req_01HV4Z2WQXKJNM8GPQY6VBTX3R",
                    "retryable": false,
                },
            })))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri(), "op-secret").unwrap();
        let err = client
            .call::<Tenant>(DeployerAction::ProvisionTenant(ProvisionTenantRequest {
                slug: "acme".to_string(),
                plan: "standard".to_string(),
                ssh_keys: Vec::new(),
            }))
            .await
            .unwrap_err();

        match err {
            CliError::Api {
                status,
                code,
                request_id,
                ..
            } => {
                assert_eq!(status, 409);
                assert_eq!(code, "duplicate_slug");
                assert!(request_id.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri(), "wrong").unwrap();
        let err = client
            .call::<ListJobsResponse>(DeployerAction::ListJobs(ListJobsRequest {
                tenant_slug: "acme".to_string(),
                status: None,
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::NotAuthenticated));
    }
}
