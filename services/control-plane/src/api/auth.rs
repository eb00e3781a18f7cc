//! Shared-secret authentication for the gatekeeper.
//!
//! Agents hold the agent token and may only call `Fleet::Agent`. Operators
//! hold the operator token and may call every service. Only SHA-256 digests
//! of the tokens are kept in memory and compared.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use fleet_protocol::{Service, TOKEN_HEADER};
use sha2::{Digest, Sha256};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

type TokenDigest = [u8; 32];

fn digest(token: &str) -> TokenDigest {
    Sha256::digest(token.as_bytes()).into()
}

/// Who is calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Agent,
    Operator,
}

impl Role {
    pub fn permits(&self, service: Service) -> bool {
        match self {
            Role::Operator => true,
            Role::Agent => service == Service::Agent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Agent => "agent",
            Role::Operator => "operator",
        }
    }
}

/// Digests of the configured tokens.
#[derive(Clone)]
pub struct AccessTokens {
    agent: TokenDigest,
    operator: TokenDigest,
}

impl AccessTokens {
    pub fn new(agent_token: &str, operator_token: &str) -> Self {
        Self {
            agent: digest(agent_token),
            operator: digest(operator_token),
        }
    }

    /// Resolves a presented token to a role.
    pub fn role_for(&self, token: &str) -> Option<Role> {
        let presented = digest(token);
        if presented == self.operator {
            Some(Role::Operator)
        } else if presented == self.agent {
            Some(Role::Agent)
        } else {
            None
        }
    }
}

impl std::fmt::Debug for AccessTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessTokens(..)")
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub role: Role,
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let ctx = RequestContext::from_request_parts(parts, state)
            .await
            .unwrap_or_else(|never| match never {});

        let Some(token) = parts
            .headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty())
        else {
            return Err(ApiError::unauthorized(
                "missing_token",
                "X-Fleet-Token header is required",
            )
            .with_request_id(ctx.request_id));
        };

        match state.tokens().role_for(token) {
            Some(role) => Ok(Caller { role }),
            None => Err(
                ApiError::unauthorized("invalid_token", "X-Fleet-Token is not valid")
                    .with_request_id(ctx.request_id),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_resolve_by_digest() {
        let tokens = AccessTokens::new("agent-secret", "operator-secret");
        assert_eq!(tokens.role_for("agent-secret"), Some(Role::Agent));
        assert_eq!(tokens.role_for("operator-secret"), Some(Role::Operator));
        assert_eq!(tokens.role_for("guess"), None);
    }

    #[test]
    fn test_agent_role_is_limited_to_agent_service() {
        assert!(Role::Agent.permits(Service::Agent));
        assert!(!Role::Agent.permits(Service::Deployer));
        assert!(Role::Operator.permits(Service::Deployer));
    }
}
