//! Peer Protocol
//!
//! Routes, headers and bodies exchanged between edge nodes. Every node serves the same
//! `/ermes/...` surface; the `PeerClient` is its only caller.

use crate::error::ErmesError;
use crate::offload::types::{ForwardingRecord, SessionSnapshot};
use crate::store::session::NodeIndicators;
use crate::topology::types::GeoCoordinates;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

pub const ENDPOINT_OFFLOAD_SESSION: &str = "/ermes/offload-session";
pub const ENDPOINT_MIGRATE_SESSION: &str = "/ermes/migrate-session";
pub const ENDPOINT_FORCE_OFFLOAD: &str = "/ermes/force-offload";
pub const ENDPOINT_UPDATE_SESSION: &str = "/ermes/update-session";
pub const ENDPOINT_ONLOAD_SESSION: &str = "/ermes/onload-session";
pub const ENDPOINT_REQUEST_ONLOAD: &str = "/ermes/request-onload";
pub const ENDPOINT_GARBAGE_COLLECTOR: &str = "/ermes/garbage-collector";
pub const ENDPOINT_OFFLOAD_STATUS: &str = "/ermes/offload-status";
pub const ENDPOINT_STATUS: &str = "/ermes/status";

pub const HEADER_SESSION_TOKEN: &str = "X-session-token";
pub const HEADER_FORCED_SESSION: &str = "X-forced-session";
pub const HEADER_ONLOAD_LOCATION: &str = "X-onload-location";
pub const HEADER_RANDOM_VALUE: &str = "X-random-value";

pub const PEER_USER_AGENT: &str = "session-offloading-manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    SessionData,
    RequestIds,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::SessionData => "sessionData",
            DataType::RequestIds => "requestIds",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sessionData" => Some(DataType::SessionData),
            "requestIds" => Some(DataType::RequestIds),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnloadAction {
    GetSession,
    ReleaseSession,
}

impl OnloadAction {
    pub fn as_str(self) -> &'static str {
        match self {
            OnloadAction::GetSession => "get-session",
            OnloadAction::ReleaseSession => "release-session",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "get-session" => Some(OnloadAction::GetSession),
            "release-session" => Some(OnloadAction::ReleaseSession),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionPolicy {
    /// Delete whatever is stored under the id.
    Forced,
    /// Delete only a forwarding remnant.
    Offloaded,
}

impl CollectionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            CollectionPolicy::Forced => "forced",
            CollectionPolicy::Offloaded => "offloaded",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "forced" => Some(CollectionPolicy::Forced),
            "offloaded" => Some(CollectionPolicy::Offloaded),
            _ => None,
        }
    }
}

// Query strings

#[derive(Debug, Deserialize)]
pub struct MigrateQuery {
    pub session: String,
    #[serde(rename = "data-type")]
    pub data_type: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateQuery {
    pub origin: String,
}

#[derive(Debug, Deserialize)]
pub struct OnloadQuery {
    pub action: String,
    pub session: Option<String>,
    #[serde(rename = "random-value")]
    pub random_value: Option<String>,
    #[serde(rename = "new-session")]
    pub new_session: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GarbageQuery {
    pub session: String,
    pub policy: String,
}

#[derive(Debug, Deserialize)]
pub struct OffloadStatusQuery {
    pub status: String,
}

// Bodies

/// Where an accepted session now lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffloadReceipt {
    pub session_id: String,
    pub location_id: String,
    pub endpoint: String,
}

impl From<OffloadReceipt> for ForwardingRecord {
    fn from(receipt: OffloadReceipt) -> Self {
        ForwardingRecord {
            endpoint: receipt.endpoint,
            session_id: receipt.session_id,
            location_id: receipt.location_id,
        }
    }
}

/// A session's record fields and payload, as served by `migrate-session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigratedSession {
    pub created_in: String,
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub coordinates: Option<GeoCoordinates>,
    pub origin_session_id: String,
    /// Base64 of the payload bytes.
    pub data: String,
}

impl From<&SessionSnapshot> for MigratedSession {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            created_in: snapshot.created_in.clone(),
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            expires_at: snapshot.expires_at,
            coordinates: snapshot.coordinates,
            origin_session_id: snapshot.origin_session_id.clone(),
            data: STANDARD.encode(&snapshot.data),
        }
    }
}

impl TryFrom<MigratedSession> for SessionSnapshot {
    type Error = ErmesError;

    fn try_from(migrated: MigratedSession) -> Result<Self, Self::Error> {
        let data = STANDARD
            .decode(migrated.data.as_bytes())
            .map_err(|e| ErmesError::Peer(format!("undecodable session data: {}", e)))?;

        Ok(SessionSnapshot {
            created_in: migrated.created_in,
            created_at: migrated.created_at,
            updated_at: migrated.updated_at,
            expires_at: migrated.expires_at,
            coordinates: migrated.coordinates,
            origin_session_id: migrated.origin_session_id,
            data,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigratedRequestIds {
    pub request_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub location_id: String,
    pub accepts_offloading: bool,
    pub indicators: NodeIndicators,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
