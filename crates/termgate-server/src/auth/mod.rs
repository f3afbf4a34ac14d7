//! Admission of terminal upgrade requests.
//!
//! Every check happens before the WebSocket handshake completes, so a
//! rejected client gets a plain HTTP status instead of an upgraded socket.

pub mod bearer;

pub use bearer::BearerPolicy;

use crate::hosts::HostDirectory;
use std::sync::Arc;
use termgate_core::HostRecord;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::debug;

/// Path prefix of the upgrade endpoint; the host id follows it.
pub const TERMINAL_PATH: &str = "/api/terminal/";

/// An admitted request: which host to bridge to, on behalf of whom.
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub host: HostRecord,
    pub user_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRejection {
    pub status: StatusCode,
    pub body: String,
}

impl HandshakeRejection {
    fn new(status: StatusCode, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
        }
    }

    pub fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.body));
        *response.status_mut() = self.status;
        response
    }
}

pub struct AdmissionGate {
    policy: BearerPolicy,
    hosts: Arc<dyn HostDirectory>,
}

impl AdmissionGate {
    pub fn new(policy: BearerPolicy, hosts: Arc<dyn HostDirectory>) -> Self {
        Self { policy, hosts }
    }

    /// Check an upgrade request, in order: path, host id, credential, host.
    pub fn admit(&self, request: &Request) -> Result<SessionGrant, HandshakeRejection> {
        let host_id = host_id_from_path(request.uri().path())?;

        let credential = bearer_credential(request).ok_or_else(|| {
            HandshakeRejection::new(StatusCode::UNAUTHORIZED, "missing bearer credential")
        })?;
        let user_id = self.policy.resolve(&credential).ok_or_else(|| {
            HandshakeRejection::new(StatusCode::UNAUTHORIZED, "invalid bearer credential")
        })?;

        let host = self
            .hosts
            .lookup(host_id)
            .ok_or_else(|| HandshakeRejection::new(StatusCode::NOT_FOUND, "host not found"))?;

        debug!(host_id, user_id, "terminal request admitted");
        Ok(SessionGrant { host, user_id })
    }
}

fn host_id_from_path(path: &str) -> Result<u32, HandshakeRejection> {
    let raw = path
        .strip_prefix(TERMINAL_PATH)
        .map(|rest| rest.trim_end_matches('/'))
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
        .ok_or_else(|| HandshakeRejection::new(StatusCode::NOT_FOUND, "not found"))?;
    raw.parse::<u32>()
        .map_err(|_| HandshakeRejection::new(StatusCode::BAD_REQUEST, "invalid host id"))
}

/// `token` query parameter first, then the `Authorization` header.
fn bearer_credential(request: &Request) -> Option<String> {
    let from_query = request
        .uri()
        .query()
        .and_then(|query| query_param(query, "token"))
        .filter(|token| !token.is_empty());
    if from_query.is_some() {
        return from_query;
    }

    let header = request
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())?
        .trim();
    let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// First value of `key`, decoded the way browsers encode forms (`%xx`
/// escapes, `+` for space).
fn query_param(query: &str, key: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.into_owned())
}
