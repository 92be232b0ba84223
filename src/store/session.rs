//! Session Store Primitives
//!
//! Thin, single-round-trip operations on top of a `StoreConnection`, plus the node-level
//! bookkeeping (indicators, offloading flag, processed requests) built from them.
//! `SessionStore` holds no connection: the caller passes the request-scoped one in.

use super::driver::StoreConnection;
use super::record::SessionRecord;
use crate::error::ErmesError;
use crate::keys::{Keyspace, SessionId, StoreKey};

use serde::{Deserialize, Serialize};
use std::future::Future;

/// Upper bound on fresh ids tried when creating a session.
pub const MAX_CREATE_ATTEMPTS: usize = 8;

pub const OFFLOADING_FLAG: &str = "offloading";
pub const OFFLOADING_ACCEPT: &str = "accept";
pub const OFFLOADING_REJECT: &str = "reject";

pub const INDICATOR_SESSIONS_CREATED: &str = "sessions-created";
pub const INDICATOR_SESSIONS_OFFLOADED: &str = "sessions-offloaded";
pub const INDICATOR_SESSIONS_ONLOADED: &str = "sessions-onloaded";
pub const INDICATOR_REQUESTS_SERVED: &str = "requests-served";

const REQUEST_PREFIX: &str = "req:";

/// Snapshot of the node's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIndicators {
    pub sessions_created: i64,
    pub sessions_offloaded: i64,
    pub sessions_onloaded: i64,
    pub requests_served: i64,
}

pub struct SessionStore {
    max_create_attempts: usize,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_max_create_attempts(MAX_CREATE_ATTEMPTS)
    }

    pub fn with_max_create_attempts(max_create_attempts: usize) -> Self {
        Self {
            max_create_attempts: max_create_attempts.max(1),
        }
    }

    pub async fn create_if_absent(
        &self,
        conn: &dyn StoreConnection,
        key: &StoreKey,
        value: &[u8],
    ) -> Result<bool, ErmesError> {
        Ok(conn.set_nx(key, value).await?)
    }

    pub async fn get(
        &self,
        conn: &dyn StoreConnection,
        key: &StoreKey,
    ) -> Result<Option<Vec<u8>>, ErmesError> {
        Ok(conn.get(key).await?)
    }

    pub async fn put(
        &self,
        conn: &dyn StoreConnection,
        key: &StoreKey,
        value: &[u8],
    ) -> Result<(), ErmesError> {
        Ok(conn.set(key, value).await?)
    }

    pub async fn delete(
        &self,
        conn: &dyn StoreConnection,
        keys: &[StoreKey],
    ) -> Result<u64, ErmesError> {
        Ok(conn.del(keys).await?)
    }

    pub async fn set_expiry(
        &self,
        conn: &dyn StoreConnection,
        key: &StoreKey,
        at_ms: u64,
    ) -> Result<bool, ErmesError> {
        Ok(conn.expire_at(key, at_ms).await?)
    }

    pub async fn increment_indicator(
        &self,
        conn: &dyn StoreConnection,
        key: &StoreKey,
    ) -> Result<i64, ErmesError> {
        Ok(conn.incr(key).await?)
    }

    /// Keys matching `pattern`. Keys that do not decode are skipped, never guessed at.
    pub async fn scan(
        &self,
        conn: &dyn StoreConnection,
        pattern: &[u8],
    ) -> Result<Vec<StoreKey>, ErmesError> {
        let raw_keys = conn.scan(pattern).await?;
        let mut keys = Vec::with_capacity(raw_keys.len());

        for raw in raw_keys {
            match StoreKey::decode(&raw) {
                Ok(key) => keys.push(key),
                Err(e) => {
                    tracing::warn!(
                        "Skipping undecodable key {}: {}",
                        String::from_utf8_lossy(&raw),
                        e
                    );
                }
            }
        }
        Ok(keys)
    }

    /// Runs `attempt` with fresh session ids until it reports success.
    ///
    /// `attempt` returns `Ok(false)` on an id collision. The loop gives up after the
    /// configured number of attempts even though a v4 collision is practically impossible.
    pub async fn with_fresh_id<F, Fut>(&self, mut attempt: F) -> Result<SessionId, ErmesError>
    where
        F: FnMut(SessionId) -> Fut,
        Fut: Future<Output = Result<bool, ErmesError>>,
    {
        for _ in 0..self.max_create_attempts {
            let session_id = SessionId::new();
            if attempt(session_id.clone()).await? {
                return Ok(session_id);
            }
            tracing::warn!("Session id {} already in use, retrying", session_id);
        }

        Err(ErmesError::Store(crate::error::StoreError::Procedure(format!(
            "no free session id after {} attempts",
            self.max_create_attempts
        ))))
    }

    /// Creates a session data key holding `payload` under a fresh id.
    pub async fn create_session(
        &self,
        conn: &dyn StoreConnection,
        payload: &[u8],
    ) -> Result<SessionId, ErmesError> {
        self.with_fresh_id(|session_id| async move {
            self.create_if_absent(conn, &StoreKey::session_data(&session_id, Vec::new()), payload)
                .await
        })
        .await
    }

    pub async fn read_record(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
    ) -> Result<Option<SessionRecord>, ErmesError> {
        match self.get(conn, &metadata_key(session_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn write_payload(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
        payload: &[u8],
    ) -> Result<(), ErmesError> {
        self.put(conn, &data_key(session_id), payload).await
    }

    /// Records a processed request id. `false` when it was already recorded.
    pub async fn record_request(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
        request_id: &str,
        expires_at: Option<u64>,
    ) -> Result<bool, ErmesError> {
        let key = request_key(session_id, request_id);
        let created = self.create_if_absent(conn, &key, b"1").await?;
        if created && let Some(at) = expires_at {
            self.set_expiry(conn, &key, at).await?;
        }
        Ok(created)
    }

    pub async fn request_ids(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
    ) -> Result<Vec<String>, ErmesError> {
        let pattern = StoreKey::session_pattern(Keyspace::SessionMetadata, session_id);
        let keys = self.scan(conn, &pattern).await?;

        Ok(keys
            .iter()
            .filter_map(|key| key.sub_key())
            .filter_map(|sub_key| std::str::from_utf8(sub_key).ok())
            .filter_map(|sub_key| sub_key.strip_prefix(REQUEST_PREFIX))
            .map(str::to_string)
            .collect())
    }

    /// Drops one processed request id, letting the client retry it.
    pub async fn forget_request(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
        request_id: &str,
    ) -> Result<(), ErmesError> {
        self.delete(conn, &[request_key(session_id, request_id)]).await?;
        Ok(())
    }

    /// Drops every processed request id of a session. Returns how many were removed.
    pub async fn clear_requests(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
    ) -> Result<u64, ErmesError> {
        let keys: Vec<StoreKey> = self
            .request_ids(conn, session_id)
            .await?
            .iter()
            .map(|request_id| request_key(session_id, request_id))
            .collect();

        if keys.is_empty() {
            return Ok(0);
        }
        self.delete(conn, &keys).await
    }

    /// Whether this node accepts sessions. Absent flag means accept.
    pub async fn accepts_offloading(&self, conn: &dyn StoreConnection) -> Result<bool, ErmesError> {
        let flag = self.get(conn, &StoreKey::config(OFFLOADING_FLAG)).await?;
        Ok(flag.as_deref() != Some(OFFLOADING_REJECT.as_bytes()))
    }

    pub async fn set_offloading_status(
        &self,
        conn: &dyn StoreConnection,
        accept: bool,
    ) -> Result<(), ErmesError> {
        let value = if accept {
            OFFLOADING_ACCEPT
        } else {
            OFFLOADING_REJECT
        };
        self.put(conn, &StoreKey::config(OFFLOADING_FLAG), value.as_bytes())
            .await
    }

    pub async fn bump(
        &self,
        conn: &dyn StoreConnection,
        indicator: &str,
    ) -> Result<i64, ErmesError> {
        self.increment_indicator(conn, &StoreKey::node(indicator)).await
    }

    pub async fn indicators(
        &self,
        conn: &dyn StoreConnection,
    ) -> Result<NodeIndicators, ErmesError> {
        Ok(NodeIndicators {
            sessions_created: self.read_counter(conn, INDICATOR_SESSIONS_CREATED).await?,
            sessions_offloaded: self.read_counter(conn, INDICATOR_SESSIONS_OFFLOADED).await?,
            sessions_onloaded: self.read_counter(conn, INDICATOR_SESSIONS_ONLOADED).await?,
            requests_served: self.read_counter(conn, INDICATOR_REQUESTS_SERVED).await?,
        })
    }

    async fn read_counter(
        &self,
        conn: &dyn StoreConnection,
        indicator: &str,
    ) -> Result<i64, ErmesError> {
        let raw = self.get(conn, &StoreKey::node(indicator)).await?;
        Ok(raw
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

pub fn metadata_key(session_id: &SessionId) -> StoreKey {
    StoreKey::session_metadata(session_id, Vec::new())
}

pub fn data_key(session_id: &SessionId) -> StoreKey {
    StoreKey::session_data(session_id, Vec::new())
}

pub fn request_key(session_id: &SessionId, request_id: &str) -> StoreKey {
    StoreKey::session_metadata(session_id, format!("{}{}", REQUEST_PREFIX, request_id))
}
