//! Offload Coordinator
//!
//! Issues the session state transitions against the store. Each public method is one
//! procedure call (or a bounded loop of them) on the connection the caller passes in.

use super::retry::RetryPolicy;
use super::types::*;
use crate::error::{ErmesError, ProtocolError};
use crate::keys::SessionId;
use crate::store::driver::{ProcedureReply, StoreConnection};
use crate::store::protocol::*;
use crate::store::session::{SessionStore, data_key, metadata_key};
use crate::topology::types::GeoCoordinates;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub struct OffloadCoordinator {
    location_id: String,
    session_ttl: Duration,
    store: Arc<SessionStore>,
}

impl OffloadCoordinator {
    pub fn new(
        location_id: impl Into<String>,
        session_ttl: Duration,
        store: Arc<SessionStore>,
    ) -> Self {
        Self {
            location_id: location_id.into(),
            session_ttl,
            store,
        }
    }

    pub fn location_id(&self) -> &str {
        &self.location_id
    }

    /// Absolute expiry for a session touched now.
    pub fn next_expiry(&self) -> u64 {
        now_ms() + self.session_ttl.as_millis() as u64
    }

    async fn call(
        &self,
        conn: &dyn StoreConnection,
        name: &str,
        session_id: &SessionId,
        args: Vec<Vec<u8>>,
    ) -> Result<ProcedureReply, ErmesError> {
        let keys = [metadata_key(session_id), data_key(session_id)];
        // Procedure failures become typed protocol errors in `From<StoreError>`.
        Ok(conn.call_procedure(name, &keys, &args).await?)
    }

    /// Creates a session owned by this node and locks it in `mode`.
    pub async fn create_and_acquire(
        &self,
        conn: &dyn StoreConnection,
        mode: LockMode,
        coordinates: Option<GeoCoordinates>,
    ) -> Result<SessionLock, ErmesError> {
        let procedure = match mode {
            LockMode::Exclusive => CREATE_AND_ACQUIRE_EXCLUSIVE,
            LockMode::Shared => CREATE_AND_ACQUIRE_SHARED,
        };
        let expires_at = self.next_expiry();
        let holder = Uuid::new_v4().to_string();
        let holder_arg = holder.as_bytes();

        let session_id = self
            .store
            .with_fresh_id(|session_id| async move {
                let mut args = coordinate_args(coordinates);
                args.push(self.location_id.clone().into_bytes());
                args.push(expires_at.to_string().into_bytes());
                args.push(holder_arg.to_vec());

                match self.call(conn, procedure, &session_id, args).await {
                    Ok(_) => Ok(true),
                    Err(ErmesError::Protocol(ProtocolError::SessionExists(_))) => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await?;

        tracing::info!("Created session {} ({})", session_id, mode);
        Ok(SessionLock {
            session_id,
            mode,
            holder,
        })
    }

    pub async fn acquire(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
        mode: LockMode,
        allow_during_offload: bool,
    ) -> Result<AcquireOutcome, ErmesError> {
        let procedure = match mode {
            LockMode::Exclusive => ACQUIRE_EXCLUSIVE,
            LockMode::Shared => ACQUIRE_SHARED,
        };
        let flag = if allow_during_offload { "1" } else { "0" };
        let holder = Uuid::new_v4().to_string();
        let args = vec![flag.as_bytes().to_vec(), holder.clone().into_bytes()];

        let reply = self.call(conn, procedure, session_id, args).await?;
        match reply.tagged() {
            Some((REPLY_MOVED, body)) => Ok(AcquireOutcome::Moved(serde_json::from_slice(body)?)),
            _ => Ok(AcquireOutcome::Acquired(SessionLock {
                session_id: session_id.clone(),
                mode,
                holder,
            })),
        }
    }

    /// Acquires, waiting out lock contention with bounded backoff.
    pub async fn acquire_with_retry(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
        mode: LockMode,
        policy: &RetryPolicy,
    ) -> Result<AcquireOutcome, ErmesError> {
        policy
            .run(
                || self.acquire(conn, session_id, mode, false),
                |e| matches!(e, ErmesError::Protocol(ProtocolError::LockUnavailable(_))),
            )
            .await
    }

    /// Releases a lock. Releasing a lock that is no longer held only logs: the session may
    /// have been offloaded underneath us or the lease may have run out, in which case the
    /// lock may belong to someone else by now and is left alone.
    pub async fn release(
        &self,
        conn: &dyn StoreConnection,
        lock: &SessionLock,
    ) -> Result<(), ErmesError> {
        let procedure = match lock.mode {
            LockMode::Exclusive => RELEASE_EXCLUSIVE,
            LockMode::Shared => RELEASE_SHARED,
        };
        let args = vec![lock.holder.clone().into_bytes()];

        match self.call(conn, procedure, &lock.session_id, args).await {
            Ok(_) => Ok(()),
            Err(ErmesError::Protocol(
                e @ (ProtocolError::NotHeld(_) | ProtocolError::SessionNotFound(_)),
            )) => {
                tracing::warn!(
                    "Release of {} on session {} skipped: {}",
                    lock.mode,
                    lock.session_id,
                    e
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Extends the lease of a lock still held. Fails with `NotHeld` once it ran out.
    pub async fn renew(
        &self,
        conn: &dyn StoreConnection,
        lock: &SessionLock,
    ) -> Result<(), ErmesError> {
        let args = vec![lock.holder.clone().into_bytes()];
        self.call(conn, RENEW_LOCK, &lock.session_id, args).await?;
        Ok(())
    }

    /// Marks the session as offloading. `held` is the caller's own lock on it, if any.
    pub async fn offload_start(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
        held: Option<&SessionLock>,
    ) -> Result<(), ErmesError> {
        let held_by = held.map(|lock| lock.holder.clone()).unwrap_or_default();
        self.call(conn, OFFLOAD_START, session_id, vec![held_by.into_bytes()])
            .await?;
        tracing::info!("Offload of session {} started", session_id);
        Ok(())
    }

    pub async fn offload_start_with_retry(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
        held: Option<&SessionLock>,
        policy: &RetryPolicy,
    ) -> Result<(), ErmesError> {
        policy
            .run(
                || self.offload_start(conn, session_id, held),
                |e| matches!(e, ErmesError::Protocol(ProtocolError::LockUnavailable(_))),
            )
            .await
    }

    pub async fn offload_finish(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
        forward: &ForwardingRecord,
    ) -> Result<(), ErmesError> {
        let args = vec![
            forward.endpoint.clone().into_bytes(),
            forward.session_id.clone().into_bytes(),
            forward.location_id.clone().into_bytes(),
        ];
        self.call(conn, OFFLOAD_FINISH, session_id, args).await?;
        tracing::info!(
            "Session {} offloaded to {} as {}",
            session_id,
            forward.location_id,
            forward.session_id
        );
        Ok(())
    }

    pub async fn offload_cancel(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
    ) -> Result<(), ErmesError> {
        self.call(conn, OFFLOAD_CANCEL, session_id, Vec::new()).await?;
        tracing::info!("Offload of session {} cancelled", session_id);
        Ok(())
    }

    pub async fn onload_start(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
        snapshot: &SessionSnapshot,
    ) -> Result<(), ErmesError> {
        let mut args = coordinate_args(snapshot.coordinates);
        args.push(snapshot.created_in.clone().into_bytes());
        args.push(snapshot.created_at.to_string().into_bytes());
        args.push(optional_arg(snapshot.updated_at));
        args.push(optional_arg(snapshot.expires_at));
        args.push(snapshot.origin_session_id.clone().into_bytes());
        args.push(snapshot.data.clone());

        self.call(conn, ONLOAD_START, session_id, args).await?;
        Ok(())
    }

    /// Writes `snapshot` under a fresh local id and leaves it `Onloading`.
    pub async fn onload_under_fresh_id(
        &self,
        conn: &dyn StoreConnection,
        snapshot: &SessionSnapshot,
    ) -> Result<SessionId, ErmesError> {
        self.store
            .with_fresh_id(|session_id| async move {
                match self.onload_start(conn, &session_id, snapshot).await {
                    Ok(()) => Ok(true),
                    Err(ErmesError::Protocol(ProtocolError::SessionExists(_))) => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await
    }

    pub async fn onload_finish(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
    ) -> Result<(), ErmesError> {
        self.call(conn, ONLOAD_FINISH, session_id, Vec::new()).await?;
        tracing::info!("Session {} onloaded", session_id);
        Ok(())
    }

    pub async fn delete_session(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
    ) -> Result<(), ErmesError> {
        self.call(conn, DELETE_SESSION, session_id, Vec::new()).await?;
        tracing::debug!("Deleted session {}", session_id);
        Ok(())
    }

    pub async fn delete_session_metadata(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
    ) -> Result<(), ErmesError> {
        self.call(conn, DELETE_SESSION_METADATA, session_id, Vec::new())
            .await?;
        Ok(())
    }

    pub async fn set_expire_time(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
        expires_at: u64,
    ) -> Result<(), ErmesError> {
        self.call(
            conn,
            SET_EXPIRE_TIME,
            session_id,
            vec![expires_at.to_string().into_bytes()],
        )
        .await?;
        Ok(())
    }

    /// Pushes the session's expiry one TTL into the future. Returns the new deadline.
    pub async fn refresh_expiry(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
    ) -> Result<u64, ErmesError> {
        let expires_at = self.next_expiry();
        self.set_expire_time(conn, session_id, expires_at).await?;
        Ok(expires_at)
    }

    pub async fn update_coordinates(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
        coordinates: GeoCoordinates,
    ) -> Result<(), ErmesError> {
        self.call(
            conn,
            UPDATE_COORDINATES,
            session_id,
            coordinate_args(Some(coordinates)),
        )
        .await?;
        Ok(())
    }

    pub async fn get_session_data(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
    ) -> Result<SessionData, ErmesError> {
        let reply = self.call(conn, GET_SESSION_DATA, session_id, Vec::new()).await?;

        match reply.tagged() {
            Some((REPLY_DATA, body)) => Ok(SessionData::Local(body.to_vec())),
            Some((REPLY_MOVED, body)) => Ok(SessionData::Moved(serde_json::from_slice(body)?)),
            _ => Err(ErmesError::Store(crate::error::StoreError::UnexpectedReply(format!(
                "{:?}",
                reply
            )))),
        }
    }
}

fn coordinate_args(coordinates: Option<GeoCoordinates>) -> Vec<Vec<u8>> {
    vec![
        optional_arg(coordinates.map(|c| c.latitude)),
        optional_arg(coordinates.map(|c| c.longitude)),
    ]
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
