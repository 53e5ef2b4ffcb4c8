//! Error types for the HA manager
//!
//! [`HaError`] covers lifecycle operations (setup, teardown) and is returned to
//! the owning process. [`FailoverError`] covers request forwarding and is
//! rendered to the HTTP client as a JSON 500 response.

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use hamgr_consul_client::ConsulError;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum HaError {
    #[error("local service is not registered")]
    NotRegistered,

    #[error("lock '{key}' is not held by session '{session_id}'")]
    LockNotHeld { key: String, session_id: String },

    #[error("lock provider error: {0}")]
    Consul(#[from] ConsulError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error kind tag used by every HA error body
pub const HA_ERROR: &str = "HA ERROR";

/// Failures while forwarding a request to the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FailoverError {
    /// Election has not converged yet, nobody is known to hold the lock
    #[error("fail to get leader info, maybe HA is setting up.")]
    NoLeader,

    #[error("fail to connect leader node, maybe bad network.")]
    LeaderUnreachable,

    #[error("fail to read body of response from leader.")]
    LeaderBodyUnreadable,
}

impl FailoverError {
    /// Stable machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            FailoverError::NoLeader => "ha_no_leader",
            FailoverError::LeaderUnreachable => "ha_leader_unreachable",
            FailoverError::LeaderBodyUnreadable => "ha_leader_body_unreadable",
        }
    }
}

#[derive(Serialize)]
struct FailoverErrorBody {
    code: u16,
    error: &'static str,
    reason: &'static str,
    message: String,
}

impl ResponseError for FailoverError {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(FailoverErrorBody {
            code: self.status_code().as_u16(),
            error: HA_ERROR,
            reason: self.reason(),
            message: self.to_string(),
        })
    }
}
