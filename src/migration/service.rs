//! Migration Service
//!
//! Both sides of every peer exchange. A session moves in three steps:
//! 1. The source marks it offloading and hands its token to the target.
//! 2. The target pulls payload, record and processed request ids through
//!    `migrate-session`, then onloads them under a fresh id.
//! 3. The source leaves a forwarding record to the new id and, when it is not the
//!    proprietary node, tells the proprietary node where the session went.
//!
//! A failure before step 3 cancels the offload on the source.

use super::protocol::*;
use crate::error::{ErmesError, ProtocolError};
use crate::keys::{Keyspace, SessionId, StoreKey};
use crate::node::runtime::NodeRuntime;
use crate::offload::coordinator::now_ms;
use crate::offload::types::*;
use crate::orchestrator::token::SessionToken;
use crate::store::driver::StoreConnection;
use crate::store::protocol::{EMPTY_PAYLOAD, LOCK_LEASE_MS};
use crate::store::session::{
    INDICATOR_SESSIONS_OFFLOADED, INDICATOR_SESSIONS_ONLOADED, data_key,
};
use crate::topology::types::Node;

use std::sync::Arc;
use uuid::Uuid;

const ONLOAD_NONCE_PREFIX: &str = "onload:";

pub struct MigrationService {
    runtime: Arc<NodeRuntime>,
}

impl MigrationService {
    pub fn new(runtime: Arc<NodeRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &NodeRuntime {
        &self.runtime
    }

    fn receipt(&self, session_id: &SessionId) -> OffloadReceipt {
        OffloadReceipt {
            session_id: session_id.to_string(),
            location_id: self.runtime.local.location_id.clone(),
            endpoint: self.runtime.local.gateway.clone(),
        }
    }

    // ============================================================
    // SOURCE SIDE
    // ============================================================

    /// Moves a session to `target`. `held` is the caller's own lock on it, if any.
    pub async fn offload_to(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
        held: Option<&SessionLock>,
        target: &Node,
    ) -> Result<ForwardingRecord, ErmesError> {
        let rt = &self.runtime;
        rt.coordinator
            .offload_start_with_retry(conn, session_id, held, &rt.retry)
            .await?;

        let outcome = async {
            let record = rt
                .store
                .read_record(conn, session_id)
                .await?
                .ok_or_else(|| ProtocolError::SessionNotFound(session_id.to_string()))?;
            let token = SessionToken::for_record(session_id.clone(), &record, &rt.local);

            let receipt = rt.peers.offload_session(&target.gateway, &token).await?;
            Ok::<_, ErmesError>((record, ForwardingRecord::from(receipt)))
        }
        .await;

        match outcome {
            Ok((record, forward)) => {
                self.complete_offload(conn, session_id, &record, &forward)
                    .await?;
                Ok(forward)
            }
            Err(e) => {
                tracing::error!(
                    "Offload of session {} to {} failed: {}",
                    session_id,
                    target.location_id,
                    e
                );
                if let Err(cancel) = rt.coordinator.offload_cancel(conn, session_id).await {
                    tracing::error!(
                        "Could not cancel offload of session {}: {}",
                        session_id,
                        cancel
                    );
                }
                Err(e)
            }
        }
    }

    async fn complete_offload(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
        record: &SessionRecord,
        forward: &ForwardingRecord,
    ) -> Result<(), ErmesError> {
        let rt = &self.runtime;
        rt.coordinator.offload_finish(conn, session_id, forward).await?;

        if let Err(e) = rt.store.bump(conn, INDICATOR_SESSIONS_OFFLOADED).await {
            tracing::warn!("Could not count offload of session {}: {}", session_id, e);
        }
        if record.created_in != rt.local.location_id {
            self.notify_proprietary(session_id, record, forward).await;
        }
        Ok(())
    }

    /// Best effort: a proprietary node left stale only costs its clients one more hop.
    async fn notify_proprietary(
        &self,
        session_id: &SessionId,
        record: &SessionRecord,
        forward: &ForwardingRecord,
    ) {
        let rt = &self.runtime;
        let result = async {
            let proprietary = rt.topology.resolve_node(&record.created_in)?;
            let origin = record
                .origin_session_id
                .clone()
                .unwrap_or_else(|| session_id.to_string());
            let token =
                SessionToken::for_record(session_id.clone(), record, &rt.local).moved_to(forward)?;

            rt.peers
                .update_session(&proprietary.gateway, &origin, &token)
                .await
        }
        .await;

        match result {
            Ok(()) => tracing::debug!(
                "Proprietary node {} now points session {} to {}",
                record.created_in,
                session_id,
                forward.location_id
            ),
            Err(e) => tracing::warn!(
                "Could not update proprietary node {} of session {}: {}",
                record.created_in,
                session_id,
                e
            ),
        }
    }

    /// Locks a session, offloads it to the parent node and lets the lock go.
    pub async fn force_offload(
        &self,
        session_id: &SessionId,
    ) -> Result<ForwardingRecord, ErmesError> {
        let rt = &self.runtime;
        let target = rt
            .parent()
            .cloned()
            .ok_or_else(|| {
                ErmesError::OffloadRejected(format!("{} has no parent", rt.location_id()))
            })?;

        rt.with_connection(|conn| async move {
            let lock = match rt
                .coordinator
                .acquire_with_retry(&*conn, session_id, LockMode::Exclusive, &rt.retry)
                .await?
            {
                AcquireOutcome::Acquired(lock) => lock,
                AcquireOutcome::Moved(forward) => {
                    tracing::info!(
                        "Session {} already lives at {}",
                        session_id,
                        forward.location_id
                    );
                    return Ok(forward);
                }
            };

            let result = self.offload_to(&*conn, session_id, Some(&lock), &target).await;
            if result.is_err() {
                rt.coordinator.release(&*conn, &lock).await?;
            }
            result
        })
        .await
    }

    /// Serves a session pending offload to the node taking it over.
    pub async fn serve_session_data(
        &self,
        session_id: &SessionId,
    ) -> Result<SessionSnapshot, ErmesError> {
        let rt = &self.runtime;
        rt.with_connection(|conn| async move {
            let record = self.pending_record(&*conn, session_id).await?;
            let data = rt
                .store
                .get(&*conn, &data_key(session_id))
                .await?
                .unwrap_or_else(|| EMPTY_PAYLOAD.to_vec());

            tracing::info!("Migrating data of session {}", session_id);
            Ok(SessionSnapshot::from_record(session_id, &record, data))
        })
        .await
    }

    pub async fn serve_request_ids(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<String>, ErmesError> {
        let rt = &self.runtime;
        rt.with_connection(|conn| async move {
            self.pending_record(&*conn, session_id).await?;
            rt.store.request_ids(&*conn, session_id).await
        })
        .await
    }

    async fn pending_record(
        &self,
        conn: &dyn StoreConnection,
        session_id: &SessionId,
    ) -> Result<SessionRecord, ErmesError> {
        let record = self
            .runtime
            .store
            .read_record(conn, session_id)
            .await?
            .ok_or_else(|| ProtocolError::SessionNotFound(session_id.to_string()))?;

        if record.state(now_ms()) != SessionState::OffloadPending {
            return Err(ProtocolError::NotOffloading(format!(
                "session {} is not pending offload",
                session_id
            ))
            .into());
        }
        Ok(record)
    }

    /// Rewrites the forward of `origin` after its session moved on from a later hop.
    pub async fn update_session(
        &self,
        origin: &str,
        token: &SessionToken,
    ) -> Result<(), ErmesError> {
        let origin = parse_session_id(origin)?;
        let forward = ForwardingRecord {
            endpoint: token.current_node_ip.clone(),
            session_id: token.session_id.to_string(),
            location_id: token.current_location_id.clone(),
        };

        self.runtime
            .with_connection(|conn| async move {
                self.runtime
                    .coordinator
                    .offload_finish(&*conn, &origin, &forward)
                    .await
            })
            .await
    }

    /// Picks an idle session and reserves it for the child node `location_id`.
    pub async fn serve_onload_get(
        &self,
        location_id: &str,
    ) -> Result<Option<(SessionToken, String)>, ErmesError> {
        let rt = &self.runtime;
        rt.with_connection(|conn| async move {
            let now = now_ms();
            let keys = rt
                .store
                .scan(&*conn, &StoreKey::keyspace_pattern(Keyspace::SessionMetadata))
                .await?;

            for key in keys {
                let Some(session_id) = key.session_id() else {
                    continue;
                };
                if key.sub_key().is_some() {
                    continue;
                }
                let Some(record) = rt.store.read_record(&*conn, session_id).await? else {
                    continue;
                };
                if record.state(now) != SessionState::Unlocked {
                    continue;
                }

                match rt.coordinator.offload_start(&*conn, session_id, None).await {
                    Ok(()) => {}
                    Err(e) if e.is_retryable() => continue,
                    Err(e) => return Err(e),
                }

                let nonce = Uuid::new_v4().to_string();
                let nonce_key = onload_nonce_key(session_id);
                rt.store.put(&*conn, &nonce_key, nonce.as_bytes()).await?;
                rt.store.set_expiry(&*conn, &nonce_key, now + LOCK_LEASE_MS).await?;

                tracing::info!("Session {} reserved for onload by {}", session_id, location_id);
                let token = SessionToken::for_record(session_id.clone(), &record, &rt.local);
                return Ok(Some((token, nonce)));
            }

            tracing::info!("No session available for onload by {}", location_id);
            Ok(None)
        })
        .await
    }

    /// Finishes (with `new_session`) or cancels (without) a reservation made by
    /// `serve_onload_get`.
    pub async fn serve_onload_release(
        &self,
        session_id: &str,
        nonce: &str,
        new_session: Option<&str>,
        location_id: &str,
    ) -> Result<(), ErmesError> {
        let rt = &self.runtime;
        let session_id = parse_session_id(session_id)?;
        let new_session = new_session.map(parse_session_id).transpose()?;

        rt.with_connection(|conn| async move {
            let not_reserved = || {
                ErmesError::from(ProtocolError::InvalidArgument(format!(
                    "onload of session {} was not reserved with this value",
                    session_id
                )))
            };

            let nonce_key = onload_nonce_key(&session_id);
            let stored = rt.store.get(&*conn, &nonce_key).await?;
            if stored.as_deref() != Some(nonce.as_bytes()) {
                return Err(not_reserved());
            }
            // Of two releases racing with the same nonce, only the one deleting it goes on.
            if rt.store.delete(&*conn, &[nonce_key]).await? != 1 {
                return Err(not_reserved());
            }

            let Some(new_session) = new_session else {
                return rt.coordinator.offload_cancel(&*conn, &session_id).await;
            };

            let target = rt.topology.resolve_node(location_id)?;
            let record = rt
                .store
                .read_record(&*conn, &session_id)
                .await?
                .ok_or_else(|| ProtocolError::SessionNotFound(session_id.to_string()))?;
            let forward = ForwardingRecord {
                endpoint: target.gateway.clone(),
                session_id: new_session.to_string(),
                location_id: target.location_id.clone(),
            };
            self.complete_offload(&*conn, &session_id, &record, &forward)
                .await
        })
        .await
    }

    // ============================================================
    // TARGET SIDE
    // ============================================================

    /// Takes over the session `token` describes, or passes it up to the parent node when
    /// this node does not accept sessions.
    pub async fn accept_offload(&self, token: &SessionToken) -> Result<OffloadReceipt, ErmesError> {
        let rt = &self.runtime;
        let accepts = rt
            .with_connection(|conn| async move { rt.store.accepts_offloading(&*conn).await })
            .await?;

        if !accepts {
            let parent = rt.parent().ok_or_else(|| {
                ErmesError::OffloadRejected(format!(
                    "{} rejects sessions and has no parent",
                    rt.location_id()
                ))
            })?;
            tracing::info!(
                "Offloading not accepted, passing session {} on to {}",
                token.session_id,
                parent.location_id
            );
            return rt.peers.offload_session(&parent.gateway, token).await;
        }

        let session_id = self.import_session(token).await?;
        Ok(self.receipt(&session_id))
    }

    /// Pulls a session from the node `token` points at and onloads it locally.
    async fn import_session(&self, token: &SessionToken) -> Result<SessionId, ErmesError> {
        let rt = &self.runtime;
        let source = token.current_node_ip.as_str();
        let snapshot = rt.peers.migrate_session(source, &token.session_id).await?;
        let request_ids = rt.peers.migrate_request_ids(source, &token.session_id).await?;

        rt.with_connection(|conn| async move {
            let session_id = rt.coordinator.onload_under_fresh_id(&*conn, &snapshot).await?;

            let finished = async {
                for request_id in &request_ids {
                    rt.store
                        .record_request(&*conn, &session_id, request_id, snapshot.expires_at)
                        .await?;
                }
                rt.coordinator.onload_finish(&*conn, &session_id).await
            }
            .await;

            if let Err(e) = finished {
                if let Err(cleanup) = rt.coordinator.delete_session(&*conn, &session_id).await {
                    tracing::warn!("Could not remove partial onload {}: {}", session_id, cleanup);
                }
                return Err(e);
            }

            if let Err(e) = rt.store.bump(&*conn, INDICATOR_SESSIONS_ONLOADED).await {
                tracing::warn!("Could not count onload of session {}: {}", session_id, e);
            }
            tracing::info!(
                "Session {} from {} onloaded as {}",
                token.session_id,
                token.current_location_id,
                session_id
            );
            Ok(session_id)
        })
        .await
    }

    /// Child side of an onload: takes one session off the parent node.
    pub async fn request_onload(&self) -> Result<Option<OffloadReceipt>, ErmesError> {
        let rt = &self.runtime;
        let parent = rt.parent().cloned().ok_or_else(|| {
            let detail = format!("{} has no parent to onload from", rt.location_id());
            ErmesError::OffloadRejected(detail)
        })?;
        let location_id = rt.location_id();

        let Some((token, nonce)) = rt.peers.onload_get_session(&parent.gateway, location_id).await?
        else {
            return Ok(None);
        };

        let session_id = match self.import_session(&token).await {
            Ok(session_id) => session_id,
            Err(e) => {
                if let Err(cancel) = rt
                    .peers
                    .onload_release_session(
                        &parent.gateway,
                        location_id,
                        &token.session_id,
                        &nonce,
                        None,
                    )
                    .await
                {
                    tracing::error!(
                        "Could not cancel onload of session {}: {}",
                        token.session_id,
                        cancel
                    );
                }
                return Err(e);
            }
        };

        if let Err(e) = rt
            .peers
            .onload_release_session(
                &parent.gateway,
                location_id,
                &token.session_id,
                &nonce,
                Some(&session_id),
            )
            .await
        {
            tracing::error!("Parent refused to release session {}: {}", token.session_id, e);
            rt.with_connection(|conn| async move {
                rt.coordinator.delete_session(&*conn, &session_id).await
            })
            .await?;
            return Err(e);
        }

        Ok(Some(self.receipt(&session_id)))
    }

    // ============================================================
    // NODE ADMINISTRATION
    // ============================================================

    pub async fn garbage_collect(
        &self,
        session_id: &str,
        policy: CollectionPolicy,
    ) -> Result<(), ErmesError> {
        let rt = &self.runtime;
        let session_id = &parse_session_id(session_id)?;

        rt.with_connection(|conn| async move {
            match policy {
                CollectionPolicy::Forced => rt.coordinator.delete_session(&*conn, session_id).await,
                CollectionPolicy::Offloaded => {
                    let record = rt
                        .store
                        .read_record(&*conn, session_id)
                        .await?
                        .ok_or_else(|| ProtocolError::SessionNotFound(session_id.to_string()))?;
                    if record.state(now_ms()) != SessionState::Offloaded {
                        return Err(ProtocolError::NotOffloading(format!(
                            "session {} still holds its data",
                            session_id
                        ))
                        .into());
                    }
                    rt.coordinator
                        .delete_session_metadata(&*conn, session_id)
                        .await
                }
            }
        })
        .await?;

        tracing::info!("Collected session {} ({})", session_id, policy.as_str());
        Ok(())
    }

    pub async fn set_offload_status(&self, accept: bool) -> Result<(), ErmesError> {
        let rt = &self.runtime;
        rt.with_connection(|conn| async move {
            rt.store.set_offloading_status(&*conn, accept).await
        })
        .await?;

        tracing::info!(
            "Node {} now {} sessions",
            rt.location_id(),
            if accept { "accepts" } else { "rejects" }
        );
        Ok(())
    }

    pub async fn status(&self) -> Result<NodeStatus, ErmesError> {
        let rt = &self.runtime;
        rt.with_connection(|conn| async move {
            Ok(NodeStatus {
                location_id: rt.location_id().to_string(),
                accepts_offloading: rt.store.accepts_offloading(&*conn).await?,
                indicators: rt.store.indicators(&*conn).await?,
            })
        })
        .await
    }
}

fn onload_nonce_key(session_id: &SessionId) -> StoreKey {
    StoreKey::node(format!("{}{}", ONLOAD_NONCE_PREFIX, session_id))
}

fn parse_session_id(raw: &str) -> Result<SessionId, ErmesError> {
    SessionId::parse(raw)
        .map_err(|e| ProtocolError::InvalidArgument(format!("session id {}: {}", raw, e)).into())
}
