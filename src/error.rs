//! Error Types
//!
//! Errors are layered the way they surface:
//! - `StoreError`: reported by a store driver or by the connection cache.
//! - `ProtocolError`: domain failures raised inside the store-side procedures.
//! - `ErmesError`: what the services hand back to the HTTP layer.
//!
//! Turning a raw procedure failure into a typed `ProtocolError` happens in one place, the
//! `From<StoreError>` conversion below.

use crate::keys::MalformedKey;
use axum::http::StatusCode;
use thiserror::Error;

/// Marker that prefixes every error raised by a store-side procedure.
pub const PROTOCOL_ERROR_MARKER: &str = "[Ermes]:";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store communication failure: {0}")]
    Communication(String),
    #[error("store procedure failed: {0}")]
    Procedure(String),
    #[error("unexpected store reply: {0}")]
    UnexpectedReply(String),
    #[error("execution context is closed")]
    ContextClosed,
    #[error("connection is closed")]
    ConnectionClosed,
    #[error(transparent)]
    MalformedKey(#[from] MalformedKey),
}

/// Typed failure of a session state transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("cannot acquire lock: {0}")]
    LockUnavailable(String),
    #[error("session is offloading: {0}")]
    OffloadInProgress(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session already exists: {0}")]
    SessionExists(String),
    #[error("session is not offloading: {0}")]
    NotOffloading(String),
    #[error("session is not onloading: {0}")]
    NotOnloading(String),
    #[error("lock is not held: {0}")]
    NotHeld(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ProtocolError {
    /// Parses a `[Ermes]:<code> <detail>` message.
    ///
    /// Returns `None` when the marker is missing or the code is not one we know, in which
    /// case the caller must treat the failure as opaque.
    pub fn from_store_message(message: &str) -> Option<Self> {
        let start = message.find(PROTOCOL_ERROR_MARKER)?;
        let rest = &message[start + PROTOCOL_ERROR_MARKER.len()..];
        let (code, detail) = rest.split_once(' ').unwrap_or((rest, ""));
        let detail = detail.trim().to_string();

        let error = match code {
            "lock-unavailable" => Self::LockUnavailable(detail),
            "offloading" => Self::OffloadInProgress(detail),
            "not-found" => Self::SessionNotFound(detail),
            "exists" => Self::SessionExists(detail),
            "not-offloading" => Self::NotOffloading(detail),
            "not-onloading" => Self::NotOnloading(detail),
            "not-held" => Self::NotHeld(detail),
            "invalid-argument" => Self::InvalidArgument(detail),
            _ => return None,
        };
        Some(error)
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::LockUnavailable(_) => "lock-unavailable",
            Self::OffloadInProgress(_) => "offloading",
            Self::SessionNotFound(_) => "not-found",
            Self::SessionExists(_) => "exists",
            Self::NotOffloading(_) => "not-offloading",
            Self::NotOnloading(_) => "not-onloading",
            Self::NotHeld(_) => "not-held",
            Self::InvalidArgument(_) => "invalid-argument",
        }
    }

    fn detail(&self) -> &str {
        match self {
            Self::LockUnavailable(d)
            | Self::OffloadInProgress(d)
            | Self::SessionNotFound(d)
            | Self::SessionExists(d)
            | Self::NotOffloading(d)
            | Self::NotOnloading(d)
            | Self::NotHeld(d)
            | Self::InvalidArgument(d) => d,
        }
    }

    /// Renders the error the way a store-side procedure raises it.
    pub fn to_store_message(&self) -> String {
        format!("{}{} {}", PROTOCOL_ERROR_MARKER, self.code(), self.detail())
    }
}

#[derive(Debug, Error)]
pub enum ErmesError {
    #[error("malformed session token: {0}")]
    MalformedToken(String),
    #[error("malformed request id: {0}")]
    MalformedRequestId(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(StoreError),
    #[error("session is read-only for this request")]
    ReadOnlySession,
    #[error("unknown location: {0}")]
    UnknownLocation(String),
    #[error("offload rejected: {0}")]
    OffloadRejected(String),
    #[error("peer call failed: {0}")]
    Peer(String),
    #[error("gave up after {0} attempts")]
    RetriesExhausted(usize),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for ErmesError {
    fn from(err: StoreError) -> Self {
        if let StoreError::Procedure(message) = &err
            && let Some(protocol) = ProtocolError::from_store_message(message)
        {
            return Self::Protocol(protocol);
        }
        Self::Store(err)
    }
}

impl From<MalformedKey> for ErmesError {
    fn from(err: MalformedKey) -> Self {
        Self::Store(StoreError::MalformedKey(err))
    }
}

impl ErmesError {
    /// True for lock contention and in-flight offloads, the two outcomes a client may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Protocol(ProtocolError::LockUnavailable(_))
                | Self::Protocol(ProtocolError::OffloadInProgress(_))
        )
    }

    /// HTTP status a failure surfaces as, on both the function and the peer routes.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedToken(_) | Self::MalformedRequestId(_) => StatusCode::BAD_REQUEST,
            Self::Protocol(protocol) => match protocol {
                ProtocolError::LockUnavailable(_) | ProtocolError::OffloadInProgress(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                ProtocolError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                ProtocolError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                ProtocolError::SessionExists(_)
                | ProtocolError::NotOffloading(_)
                | ProtocolError::NotOnloading(_)
                | ProtocolError::NotHeld(_) => StatusCode::CONFLICT,
            },
            Self::ReadOnlySession => StatusCode::CONFLICT,
            Self::UnknownLocation(_) => StatusCode::NOT_FOUND,
            Self::OffloadRejected(_) | Self::RetriesExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Peer(_) => StatusCode::BAD_GATEWAY,
            Self::Store(_) | Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
