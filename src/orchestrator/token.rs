//! Session Token
//!
//! The identity a client carries between requests. On the function routes it travels as
//! a JSON cookie; between nodes it travels base64-encoded in the `X-session-token` header.

use crate::error::ErmesError;
use crate::keys::SessionId;
use crate::store::record::{ForwardingRecord, SessionRecord};
use crate::topology::types::{GeoCoordinates, Node};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    pub session_id: SessionId,
    /// Node that created the session. Never rewritten.
    pub proprietary_location_id: String,
    pub current_location_id: String,
    /// Gateway of the current location.
    pub current_node_ip: String,
    pub created_at: u64,
    pub last_access_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<GeoCoordinates>,
}

impl SessionToken {
    /// Token of a session just created on `node`.
    pub fn new(session_id: SessionId, node: &Node, now: u64) -> Self {
        Self {
            session_id,
            proprietary_location_id: node.location_id.clone(),
            current_location_id: node.location_id.clone(),
            current_node_ip: node.gateway.clone(),
            created_at: now,
            last_access_at: now,
            expires_at: None,
            coordinates: None,
        }
    }

    /// Token describing a session stored on `node` under `session_id`.
    pub fn for_record(session_id: SessionId, record: &SessionRecord, node: &Node) -> Self {
        Self {
            session_id,
            proprietary_location_id: record.created_in.clone(),
            current_location_id: node.location_id.clone(),
            current_node_ip: node.gateway.clone(),
            created_at: record.created_at,
            last_access_at: record.updated_at.unwrap_or(record.created_at),
            expires_at: record.expires_at,
            coordinates: record.coordinates,
        }
    }

    /// The same session after it moved to `forward`.
    pub fn moved_to(&self, forward: &ForwardingRecord) -> Result<Self, ErmesError> {
        let session_id = SessionId::parse(&forward.session_id)
            .map_err(|e| ErmesError::MalformedToken(format!("forward session id: {}", e)))?;

        Ok(Self {
            session_id,
            current_location_id: forward.location_id.clone(),
            current_node_ip: forward.endpoint.clone(),
            ..self.clone()
        })
    }

    pub fn is_current_at(&self, location_id: &str) -> bool {
        self.current_location_id == location_id
    }

    pub fn is_proprietary(&self, location_id: &str) -> bool {
        self.proprietary_location_id == location_id
    }

    pub fn to_json(&self) -> Result<String, ErmesError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, ErmesError> {
        serde_json::from_str(raw).map_err(|e| ErmesError::MalformedToken(e.to_string()))
    }

    /// Value of the `X-session-token` header.
    pub fn to_header(&self) -> Result<String, ErmesError> {
        Ok(STANDARD.encode(self.to_json()?))
    }

    pub fn from_header(raw: &str) -> Result<Self, ErmesError> {
        let bytes = STANDARD
            .decode(raw.trim())
            .map_err(|e| ErmesError::MalformedToken(e.to_string()))?;
        let json =
            String::from_utf8(bytes).map_err(|e| ErmesError::MalformedToken(e.to_string()))?;
        Self::from_json(&json)
    }

    /// Finds the token in a `Cookie` header. `Ok(None)` when the cookie is not there.
    pub fn from_cookie_header(
        cookie_header: &str,
        cookie_name: &str,
    ) -> Result<Option<Self>, ErmesError> {
        for part in cookie_header.split(';') {
            if let Some((name, value)) = part.trim().split_once('=')
                && name == cookie_name
            {
                return Self::from_json(value).map(Some);
            }
        }
        Ok(None)
    }

    /// `Set-Cookie` value carrying this token.
    pub fn to_set_cookie(&self, cookie_name: &str) -> Result<String, ErmesError> {
        Ok(format!("{}={}; Path=/; HttpOnly", cookie_name, self.to_json()?))
    }
}
