use crate::keys::SessionId;
use crate::topology::types::GeoCoordinates;

pub use crate::store::record::{ForwardingRecord, LockMode, SessionRecord, SessionState};

/// A lock granted to one request. Only this handle can release or renew it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLock {
    pub session_id: SessionId,
    pub mode: LockMode,
    pub holder: String,
}

/// Result of a lock acquisition that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    Acquired(SessionLock),
    /// The session lives elsewhere now; no lock was taken.
    Moved(ForwardingRecord),
}

/// What `get_session_data` found under a session id.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionData {
    Local(Vec<u8>),
    Moved(ForwardingRecord),
}

/// A session as it travels from one node to another.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub created_in: String,
    pub created_at: u64,
    pub updated_at: Option<u64>,
    pub expires_at: Option<u64>,
    pub coordinates: Option<GeoCoordinates>,
    /// Id of the session at its proprietary node.
    pub origin_session_id: String,
    pub data: Vec<u8>,
}

impl SessionSnapshot {
    pub fn from_record(session_id: &SessionId, record: &SessionRecord, data: Vec<u8>) -> Self {
        Self {
            created_in: record.created_in.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            expires_at: record.expires_at,
            coordinates: record.coordinates,
            origin_session_id: record
                .origin_session_id
                .clone()
                .unwrap_or_else(|| session_id.to_string()),
            data,
        }
    }
}
