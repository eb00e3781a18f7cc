//! Gatekeeper envelope and reply bodies.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{AgentAction, DeployerAction, ProtocolError};

/// Path of the single RPC endpoint.
pub const GATEKEEPER_PATH: &str = "/fleet/gatekeeper";

/// Build hook: schedules a fleet-wide rollout of a freshly signed release.
pub const CI_WEBHOOK_PATH: &str = "/webhook/ci";

/// Header carrying the shared secret.
pub const TOKEN_HEADER: &str = "x-fleet-token";

pub const AGENT_SERVICE: &str = "Fleet::Agent";
pub const DEPLOYER_SERVICE: &str = "Fleet::Deployer";

/// Services reachable through the gatekeeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Agent,
    Deployer,
}

impl Service {
    pub fn parse(name: &str) -> Result<Self, ProtocolError> {
        match name {
            AGENT_SERVICE => Ok(Service::Agent),
            DEPLOYER_SERVICE => Ok(Service::Deployer),
            other => Err(ProtocolError::UnknownService(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Agent => AGENT_SERVICE,
            Service::Deployer => DEPLOYER_SERVICE,
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw `{service, action, payload}` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub service: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

/// A fully decoded gatekeeper call.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Agent(AgentAction),
    Deployer(DeployerAction),
}

impl Envelope {
    /// Resolves the service and decodes the action with its typed payload.
    pub fn decode(&self) -> Result<Request, ProtocolError> {
        let service = Service::parse(&self.service)?;
        let tagged = json!({ "action": self.action, "payload": self.payload });

        let invalid = |e: serde_json::Error| ProtocolError::InvalidRequest {
            service: self.service.clone(),
            action: self.action.clone(),
            reason: e.to_string(),
        };

        match service {
            Service::Agent => serde_json::from_value(tagged)
                .map(Request::Agent)
                .map_err(invalid),
            Service::Deployer => serde_json::from_value(tagged)
                .map(Request::Deployer)
                .map_err(invalid),
        }
    }
}

impl Request {
    pub fn service(&self) -> Service {
        match self {
            Request::Agent(_) => Service::Agent,
            Request::Deployer(_) => Service::Deployer,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Request::Agent(a) => a.name(),
            Request::Deployer(a) => a.name(),
        }
    }

    /// Re-encodes the request for sending.
    pub fn into_envelope(self) -> Envelope {
        let service = self.service().as_str().to_string();
        let tagged = match self {
            Request::Agent(a) => serde_json::to_value(a),
            Request::Deployer(a) => serde_json::to_value(a),
        }
        .unwrap_or(Value::Null);

        Envelope {
            service,
            action: tagged["action"].as_str().unwrap_or_default().to_string(),
            payload: tagged.get("payload").cloned().unwrap_or(Value::Null),
        }
    }
}

impl From<AgentAction> for Request {
    fn from(action: AgentAction) -> Self {
        Request::Agent(action)
    }
}

impl From<DeployerAction> for Request {
    fn from(action: DeployerAction) -> Self {
        Request::Deployer(action)
    }
}

/// Successful reply body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply<T> {
    pub success: bool,
    pub result: T,
}

impl<T> Reply<T> {
    pub fn ok(result: T) -> Self {
        Self {
            success: true,
            result,
        }
    }
}

/// Error reply body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub success: bool,
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}
