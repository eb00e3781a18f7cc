//! Protocol decoding errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The envelope names a service this control plane does not serve.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The action is unknown for the service, or its payload does not match.
    #[error("invalid {service}.{action} request: {reason}")]
    InvalidRequest {
        service: String,
        action: String,
        reason: String,
    },

    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("invalid {job_type} payload: {reason}")]
    InvalidPayload { job_type: String, reason: String },
}

impl ProtocolError {
    /// Stable machine-readable code for API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::UnknownService(_) => "unknown_service",
            ProtocolError::InvalidRequest { .. } => "invalid_request",
            ProtocolError::UnknownJobType(_) => "unknown_job_type",
            ProtocolError::InvalidPayload { .. } => "invalid_payload",
        }
    }
}
