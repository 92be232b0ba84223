//! Persisted Session Record
//!
//! The JSON document stored under a session's metadata key. Both engines apply the same
//! rules to it; the in-process engine calls the methods below, `ermes.lua` mirrors them.

use crate::error::ProtocolError;
use crate::topology::types::GeoCoordinates;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Mode a request holds a session in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Single writer (rw).
    Exclusive,
    /// Any number of readers (ro).
    Shared,
}

impl LockMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::Exclusive => "exclusive",
            LockMode::Shared => "shared",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "exclusive" => Some(LockMode::Exclusive),
            "shared" => Some(LockMode::Shared),
            _ => None,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pointer left behind by a completed offload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingRecord {
    /// Gateway of the node now holding the session.
    pub endpoint: String,
    /// Id the session was onloaded under.
    pub session_id: String,
    pub location_id: String,
}

/// State of a session as seen by one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unlocked,
    LockedExclusive,
    LockedShared(u32),
    OffloadPending,
    /// Only a forwarding pointer remains.
    Offloaded,
    Onloading,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Proprietary location of the session.
    pub created_in: String,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<GeoCoordinates>,
    /// Id of the session at its proprietary node, set on every onloaded copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_mode: Option<LockMode>,
    /// Holder id of every request holding the lock, with the end of its lease.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub holders: BTreeMap<String, u64>,
    #[serde(default)]
    pub offloading: bool,
    #[serde(default)]
    pub onloading: bool,
    /// Written by `offload_finish`. Never present without `offloading`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<ForwardingRecord>,
}

impl SessionRecord {
    pub fn new(created_in: impl Into<String>, created_at: u64) -> Self {
        Self {
            created_in: created_in.into(),
            created_at,
            updated_at: Some(created_at),
            expires_at: None,
            coordinates: None,
            origin_session_id: None,
            lock_mode: None,
            holders: BTreeMap::new(),
            offloading: false,
            onloading: false,
            forward: None,
        }
    }

    pub fn state(&self, now: u64) -> SessionState {
        if self.forward.is_some() {
            return SessionState::Offloaded;
        }
        if self.onloading {
            return SessionState::Onloading;
        }
        if self.offloading {
            return SessionState::OffloadPending;
        }
        match self.live_lock(now) {
            None => SessionState::Unlocked,
            Some((LockMode::Exclusive, _)) => SessionState::LockedExclusive,
            Some((LockMode::Shared, holders)) => SessionState::LockedShared(holders),
        }
    }

    /// Current lock and its number of holders, ignoring leases that have run out.
    pub fn live_lock(&self, now: u64) -> Option<(LockMode, u32)> {
        let holders = self.live_holders(now).count() as u32;
        match self.lock_mode {
            Some(mode) if holders > 0 => Some((mode, holders)),
            _ => None,
        }
    }

    fn live_holders(&self, now: u64) -> impl Iterator<Item = &str> {
        self.holders
            .iter()
            .filter(move |(_, lease)| **lease > now)
            .map(|(holder, _)| holder.as_str())
    }

    fn drop_expired_holders(&mut self, now: u64) {
        self.holders.retain(|_, lease| *lease > now);
        if self.holders.is_empty() {
            self.lock_mode = None;
        }
    }

    fn clear_lock(&mut self) {
        self.lock_mode = None;
        self.holders.clear();
    }

    /// Grants `holder` a lock in `mode`.
    ///
    /// Returns the forwarding pointer instead when the session has moved.
    pub fn acquire(
        &mut self,
        mode: LockMode,
        holder: &str,
        allow_during_offload: bool,
        now: u64,
        lease_ms: u64,
    ) -> Result<Option<ForwardingRecord>, ProtocolError> {
        if let Some(forward) = &self.forward {
            return Ok(Some(forward.clone()));
        }
        if self.onloading {
            return Err(ProtocolError::LockUnavailable("session is onloading".into()));
        }
        if self.offloading && !allow_during_offload {
            return Err(ProtocolError::OffloadInProgress(
                "session is being offloaded".into(),
            ));
        }
        if holder.is_empty() {
            return Err(ProtocolError::InvalidArgument("holder id is required".into()));
        }

        self.drop_expired_holders(now);
        match (self.lock_mode, mode) {
            (None, _) => self.lock_mode = Some(mode),
            (Some(LockMode::Shared), LockMode::Shared) => {}
            (Some(held), _) => {
                return Err(ProtocolError::LockUnavailable(format!(
                    "session is locked {}",
                    held
                )));
            }
        }

        self.holders.insert(holder.to_string(), now + lease_ms);
        self.updated_at = Some(now);
        Ok(None)
    }

    /// Gives up `holder`'s lock. A holder whose lease ran out no longer holds anything,
    /// even if someone else has locked the session since.
    pub fn release(&mut self, mode: LockMode, holder: &str, now: u64) -> Result<(), ProtocolError> {
        self.drop_expired_holders(now);
        if self.lock_mode != Some(mode) || self.holders.remove(holder).is_none() {
            return Err(ProtocolError::NotHeld(format!(
                "{} lock is not held by {}",
                mode, holder
            )));
        }
        if self.holders.is_empty() {
            self.lock_mode = None;
        }
        Ok(())
    }

    /// Extends `holder`'s lease, provided it has not run out already.
    pub fn renew(&mut self, holder: &str, now: u64, lease_ms: u64) -> Result<(), ProtocolError> {
        match self.holders.get_mut(holder) {
            Some(lease) if *lease > now => {
                *lease = now + lease_ms;
                Ok(())
            }
            _ => Err(ProtocolError::NotHeld(format!("lease of {} has run out", holder))),
        }
    }

    /// Marks the session as offloading.
    ///
    /// `held_by` is the caller's own holder id, if it holds the session. Any other live
    /// holder makes the session unavailable.
    pub fn begin_offload(&mut self, held_by: Option<&str>, now: u64) -> Result<(), ProtocolError> {
        if self.offloading {
            return Err(ProtocolError::OffloadInProgress(
                "session is already offloading".into(),
            ));
        }
        if self.onloading {
            return Err(ProtocolError::LockUnavailable("session is onloading".into()));
        }

        if self.live_holders(now).any(|holder| Some(holder) != held_by) {
            return Err(ProtocolError::LockUnavailable(
                "session is held by another request".into(),
            ));
        }

        self.offloading = true;
        Ok(())
    }

    /// Leaves a forwarding pointer. Accepted again on an offloaded session, which only
    /// rewrites the pointer.
    pub fn finish_offload(&mut self, forward: ForwardingRecord) -> Result<(), ProtocolError> {
        if !self.offloading {
            return Err(ProtocolError::NotOffloading("offload was not started".into()));
        }
        self.forward = Some(forward);
        self.clear_lock();
        Ok(())
    }

    pub fn cancel_offload(&mut self) -> Result<(), ProtocolError> {
        if !self.offloading || self.forward.is_some() {
            return Err(ProtocolError::NotOffloading("no pending offload".into()));
        }
        self.offloading = false;
        Ok(())
    }

    pub fn finish_onload(&mut self) -> Result<(), ProtocolError> {
        if !self.onloading {
            return Err(ProtocolError::NotOnloading("session is not onloading".into()));
        }
        self.onloading = false;
        Ok(())
    }
}
