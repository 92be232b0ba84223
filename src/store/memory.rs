//! In-Process Store Engine
//!
//! A single-node implementation of the store interface. Keys live in one map behind a
//! mutex; a procedure takes the mutex once and runs to completion, which gives it the
//! same all-or-nothing behaviour a scripted transaction has on a real store.
//!
//! Expired keys are dropped lazily, the first time they are touched after their deadline.

use super::driver::{ProcedureReply, StoreBackend, StoreConnection};
use super::protocol::*;
use super::record::{ForwardingRecord, LockMode, SessionRecord};
use crate::error::{ProtocolError, StoreError};
use crate::keys::StoreKey;
use crate::topology::types::GeoCoordinates;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<u64>,
}

impl Entry {
    fn new(value: Vec<u8>) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

type Entries = HashMap<Vec<u8>, Entry>;

struct MemoryEngine {
    entries: Mutex<Entries>,
    lock_lease_ms: u64,
}

impl MemoryEngine {
    fn with_entries<R>(&self, f: impl FnOnce(&mut Entries, u64) -> R) -> Result<R, StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Communication("in-process store is poisoned".into()))?;
        Ok(f(&mut entries, now_ms()))
    }
}

fn live<'a>(entries: &'a mut Entries, key: &[u8], now: u64) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn matches_pattern(key: &[u8], pattern: &[u8]) -> bool {
    match pattern.strip_suffix(b"*") {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[derive(Default)]
struct ConnectionStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Shared in-process store. Cloning the backend shares the data.
#[derive(Clone)]
pub struct MemoryBackend {
    engine: Arc<MemoryEngine>,
    stats: Arc<ConnectionStats>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_lock_lease(Duration::from_millis(LOCK_LEASE_MS))
    }

    pub fn with_lock_lease(lease: Duration) -> Self {
        Self {
            engine: Arc::new(MemoryEngine {
                entries: Mutex::new(HashMap::new()),
                lock_lease_ms: lease.as_millis() as u64,
            }),
            stats: Arc::new(ConnectionStats::default()),
        }
    }

    pub fn connections_opened(&self) -> usize {
        self.stats.opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> usize {
        self.stats.closed.load(Ordering::SeqCst)
    }

    /// Number of keys that have not expired.
    pub fn key_count(&self) -> usize {
        self.engine
            .with_entries(|entries, now| entries.values().filter(|e| !e.is_expired(now)).count())
            .unwrap_or(0)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn connect(&self) -> Result<Arc<dyn StoreConnection>, StoreError> {
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            engine: self.engine.clone(),
            stats: self.stats.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct MemoryConnection {
    engine: Arc<MemoryEngine>,
    stats: Arc<ConnectionStats>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn engine(&self) -> Result<&MemoryEngine, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionClosed);
        }
        Ok(&self.engine)
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        let key = key.encode();
        self.engine()?
            .with_entries(|entries, now| live(entries, &key, now).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &StoreKey, value: &[u8]) -> Result<(), StoreError> {
        let key = key.encode();
        self.engine()?.with_entries(|entries, now| {
            match live(entries, &key, now) {
                Some(entry) => entry.value = value.to_vec(),
                None => {
                    entries.insert(key, Entry::new(value.to_vec()));
                }
            };
        })
    }

    async fn set_nx(&self, key: &StoreKey, value: &[u8]) -> Result<bool, StoreError> {
        let key = key.encode();
        self.engine()?.with_entries(|entries, now| {
            if live(entries, &key, now).is_some() {
                return false;
            }
            entries.insert(key, Entry::new(value.to_vec()));
            true
        })
    }

    async fn incr(&self, key: &StoreKey) -> Result<i64, StoreError> {
        let key = key.encode();
        self.engine()?.with_entries(|entries, now| {
            let current = match live(entries, &key, now) {
                Some(entry) => std::str::from_utf8(&entry.value)
                    .ok()
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .ok_or_else(|| {
                        StoreError::Procedure("value is not an integer or out of range".into())
                    })?,
                None => 0,
            };

            let next = current + 1;
            match live(entries, &key, now) {
                Some(entry) => entry.value = next.to_string().into_bytes(),
                None => {
                    entries.insert(key, Entry::new(next.to_string().into_bytes()));
                }
            }
            Ok(next)
        })?
    }

    async fn del(&self, keys: &[StoreKey]) -> Result<u64, StoreError> {
        let keys: Vec<Vec<u8>> = keys.iter().map(StoreKey::encode).collect();
        self.engine()?.with_entries(|entries, now| {
            let mut removed = 0;
            for key in &keys {
                if live(entries, key, now).is_some() {
                    entries.remove(key);
                    removed += 1;
                }
            }
            removed
        })
    }

    async fn expire_at(&self, key: &StoreKey, at_ms: u64) -> Result<bool, StoreError> {
        let key = key.encode();
        self.engine()?
            .with_entries(|entries, now| expire_entry(entries, &key, at_ms, now))
    }

    async fn scan(&self, pattern: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        self.engine()?.with_entries(|entries, now| {
            entries.retain(|_, entry| !entry.is_expired(now));
            entries
                .keys()
                .filter(|key| matches_pattern(key, pattern))
                .cloned()
                .collect()
        })
    }

    async fn call_procedure(
        &self,
        name: &str,
        keys: &[StoreKey],
        args: &[Vec<u8>],
    ) -> Result<ProcedureReply, StoreError> {
        let engine = self.engine()?;
        let [metadata_key, data_key] = keys else {
            return Err(StoreError::Procedure(
                ProtocolError::InvalidArgument("expected metadata and data keys".into())
                    .to_store_message(),
            ));
        };
        let session = metadata_key
            .session_id()
            .map(|id| id.to_string())
            .unwrap_or_default();

        engine.with_entries(|entries, now| {
            let mut tx = Transaction {
                entries,
                metadata_key: metadata_key.encode(),
                data_key: data_key.encode(),
                session,
                now,
                lease_ms: engine.lock_lease_ms,
            };
            tx.run(name, args)
        })?
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn expire_entry(entries: &mut Entries, key: &[u8], at_ms: u64, now: u64) -> bool {
    if live(entries, key, now).is_none() {
        return false;
    }
    if at_ms <= now {
        entries.remove(key);
    } else if let Some(entry) = entries.get_mut(key) {
        entry.expires_at = Some(at_ms);
    }
    true
}

/// One procedure invocation, holding the engine lock for its whole duration.
struct Transaction<'a> {
    entries: &'a mut Entries,
    metadata_key: Vec<u8>,
    data_key: Vec<u8>,
    session: String,
    now: u64,
    lease_ms: u64,
}

impl Transaction<'_> {
    fn run(&mut self, name: &str, args: &[Vec<u8>]) -> Result<ProcedureReply, StoreError> {
        let result = match name {
            CREATE_AND_ACQUIRE_EXCLUSIVE => self.create_and_acquire(LockMode::Exclusive, args),
            CREATE_AND_ACQUIRE_SHARED => self.create_and_acquire(LockMode::Shared, args),
            ONLOAD_START => self.onload_start(args),
            ONLOAD_FINISH => self.update(|record, _| record.finish_onload()),
            ACQUIRE_EXCLUSIVE => self.acquire(LockMode::Exclusive, args),
            ACQUIRE_SHARED => self.acquire(LockMode::Shared, args),
            RELEASE_EXCLUSIVE => self.release(LockMode::Exclusive, args),
            RELEASE_SHARED => self.release(LockMode::Shared, args),
            RENEW_LOCK => self.renew(args),
            OFFLOAD_START => self.offload_start(args),
            OFFLOAD_FINISH => self.offload_finish(args),
            OFFLOAD_CANCEL => self.update(|record, _| record.cancel_offload()),
            DELETE_SESSION => Ok(self.delete_session()),
            DELETE_SESSION_METADATA => Ok(self.delete_session_metadata()),
            SET_EXPIRE_TIME => self.set_expire_time(args),
            UPDATE_COORDINATES => self.update_coordinates(args),
            GET_SESSION_DATA => self.get_session_data(),
            _ => return Err(StoreError::Procedure(format!("function '{}' not found", name))),
        };
        result.map_err(|err| StoreError::Procedure(err.to_store_message()))
    }

    fn load(&mut self) -> Result<Option<SessionRecord>, ProtocolError> {
        match live(self.entries, &self.metadata_key, self.now) {
            Some(entry) => serde_json::from_slice(&entry.value)
                .map(Some)
                .map_err(|e| {
                    ProtocolError::InvalidArgument(format!("corrupt session record: {}", e))
                }),
            None => Ok(None),
        }
    }

    fn require(&mut self) -> Result<SessionRecord, ProtocolError> {
        self.load()?
            .ok_or_else(|| ProtocolError::SessionNotFound(self.session.clone()))
    }

    /// Writes the record back, keeping the metadata key's expiry.
    fn save(&mut self, record: &SessionRecord) -> Result<(), ProtocolError> {
        let value = serde_json::to_vec(record)
            .map_err(|e| ProtocolError::InvalidArgument(e.to_string()))?;
        match live(self.entries, &self.metadata_key, self.now) {
            Some(entry) => entry.value = value,
            None => {
                self.entries
                    .insert(self.metadata_key.clone(), Entry::new(value));
            }
        }
        Ok(())
    }

    fn update(
        &mut self,
        apply: impl FnOnce(&mut SessionRecord, u64) -> Result<(), ProtocolError>,
    ) -> Result<ProcedureReply, ProtocolError> {
        let mut record = self.require()?;
        apply(&mut record, self.now)?;
        self.save(&record)?;
        Ok(ProcedureReply::ok())
    }

    fn apply_expiry(&mut self, expires_at: Option<u64>) {
        if let Some(at) = expires_at {
            let now = self.now;
            expire_entry(self.entries, &self.metadata_key, at, now);
            expire_entry(self.entries, &self.data_key, at, now);
        }
    }

    fn create_and_acquire(
        &mut self,
        mode: LockMode,
        args: &[Vec<u8>],
    ) -> Result<ProcedureReply, ProtocolError> {
        if self.load()?.is_some() {
            return Err(ProtocolError::SessionExists(self.session.clone()));
        }

        let mut record = SessionRecord::new(text_arg(args, 2)?, self.now);
        record.coordinates = coordinates_arg(args, 0)?;
        record.expires_at = u64_arg(args, 3)?;
        record.acquire(mode, text_arg(args, 4)?, false, self.now, self.lease_ms)?;

        self.save(&record)?;
        self.entries
            .insert(self.data_key.clone(), Entry::new(EMPTY_PAYLOAD.to_vec()));
        self.apply_expiry(record.expires_at);
        Ok(ProcedureReply::ok())
    }

    fn onload_start(&mut self, args: &[Vec<u8>]) -> Result<ProcedureReply, ProtocolError> {
        if self.load()?.is_some() {
            return Err(ProtocolError::SessionExists(self.session.clone()));
        }

        let created_at = u64_arg(args, 3)?
            .ok_or_else(|| ProtocolError::InvalidArgument("createdAt is required".into()))?;
        let mut record = SessionRecord::new(text_arg(args, 2)?, created_at);
        record.coordinates = coordinates_arg(args, 0)?;
        record.updated_at = u64_arg(args, 4)?;
        record.expires_at = u64_arg(args, 5)?;
        record.origin_session_id = Some(text_arg(args, 6)?)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        record.onloading = true;

        let data = args.get(7).cloned().unwrap_or_default();
        self.save(&record)?;
        self.entries.insert(self.data_key.clone(), Entry::new(data));
        self.apply_expiry(record.expires_at);
        Ok(ProcedureReply::ok())
    }

    fn acquire(
        &mut self,
        mode: LockMode,
        args: &[Vec<u8>],
    ) -> Result<ProcedureReply, ProtocolError> {
        let allow_during_offload = args.first().is_some_and(|arg| arg.as_slice() == b"1");
        let holder = text_arg(args, 1)?;
        let mut record = self.require()?;

        match record.acquire(mode, holder, allow_during_offload, self.now, self.lease_ms)? {
            Some(forward) => moved_reply(&forward),
            None => {
                self.save(&record)?;
                Ok(ProcedureReply::ok())
            }
        }
    }

    fn release(
        &mut self,
        mode: LockMode,
        args: &[Vec<u8>],
    ) -> Result<ProcedureReply, ProtocolError> {
        let holder = text_arg(args, 0)?.to_string();
        self.update(|record, now| record.release(mode, &holder, now))
    }

    fn renew(&mut self, args: &[Vec<u8>]) -> Result<ProcedureReply, ProtocolError> {
        let holder = text_arg(args, 0)?.to_string();
        let lease_ms = self.lease_ms;
        self.update(|record, now| record.renew(&holder, now, lease_ms))
    }

    fn offload_start(&mut self, args: &[Vec<u8>]) -> Result<ProcedureReply, ProtocolError> {
        let held_by = Some(text_arg(args, 0)?.to_string()).filter(|holder| !holder.is_empty());
        self.update(|record, now| record.begin_offload(held_by.as_deref(), now))
    }

    fn offload_finish(&mut self, args: &[Vec<u8>]) -> Result<ProcedureReply, ProtocolError> {
        let forward = ForwardingRecord {
            endpoint: text_arg(args, 0)?.to_string(),
            session_id: text_arg(args, 1)?.to_string(),
            location_id: text_arg(args, 2)?.to_string(),
        };
        self.update(|record, _| record.finish_offload(forward))?;

        let prefix = self.data_key.clone();
        self.entries.retain(|key, _| !key.starts_with(&prefix));
        Ok(ProcedureReply::ok())
    }

    fn delete_session(&mut self) -> ProcedureReply {
        let metadata = self.metadata_key.clone();
        let data = self.data_key.clone();
        self.entries
            .retain(|key, _| !key.starts_with(&metadata) && !key.starts_with(&data));
        ProcedureReply::ok()
    }

    fn delete_session_metadata(&mut self) -> ProcedureReply {
        let metadata = self.metadata_key.clone();
        self.entries.retain(|key, _| !key.starts_with(&metadata));
        ProcedureReply::ok()
    }

    fn set_expire_time(&mut self, args: &[Vec<u8>]) -> Result<ProcedureReply, ProtocolError> {
        let expires_at = u64_arg(args, 0)?
            .ok_or_else(|| ProtocolError::InvalidArgument("expiresAt is required".into()))?;
        self.update(|record, _| {
            record.expires_at = Some(expires_at);
            Ok(())
        })?;
        self.apply_expiry(Some(expires_at));
        Ok(ProcedureReply::ok())
    }

    fn update_coordinates(&mut self, args: &[Vec<u8>]) -> Result<ProcedureReply, ProtocolError> {
        let coordinates = coordinates_arg(args, 0)?;
        self.update(|record, _| {
            record.coordinates = coordinates;
            Ok(())
        })
    }

    fn get_session_data(&mut self) -> Result<ProcedureReply, ProtocolError> {
        let record = self.require()?;
        if let Some(forward) = &record.forward {
            return moved_reply(forward);
        }

        let data = live(self.entries, &self.data_key, self.now)
            .map(|entry| entry.value.clone())
            .unwrap_or_else(|| EMPTY_PAYLOAD.to_vec());
        Ok(ProcedureReply::Array(vec![
            ProcedureReply::Status(REPLY_DATA.to_string()),
            ProcedureReply::Data(data),
        ]))
    }
}

fn moved_reply(forward: &ForwardingRecord) -> Result<ProcedureReply, ProtocolError> {
    let body =
        serde_json::to_vec(forward).map_err(|e| ProtocolError::InvalidArgument(e.to_string()))?;
    Ok(ProcedureReply::Array(vec![
        ProcedureReply::Status(REPLY_MOVED.to_string()),
        ProcedureReply::Data(body),
    ]))
}

fn text_arg(args: &[Vec<u8>], index: usize) -> Result<&str, ProtocolError> {
    let raw = args.get(index).map(Vec::as_slice).unwrap_or_default();
    std::str::from_utf8(raw)
        .map_err(|_| ProtocolError::InvalidArgument(format!("argument {} is not utf-8", index)))
}

fn u64_arg(args: &[Vec<u8>], index: usize) -> Result<Option<u64>, ProtocolError> {
    match text_arg(args, index)? {
        "" => Ok(None),
        raw => raw.parse().map(Some).map_err(|_| {
            ProtocolError::InvalidArgument(format!("argument {} is not a timestamp", index))
        }),
    }
}

/// Reads a latitude/longitude pair starting at `index`. Both empty means absent.
fn coordinates_arg(
    args: &[Vec<u8>],
    index: usize,
) -> Result<Option<GeoCoordinates>, ProtocolError> {
    match (text_arg(args, index)?, text_arg(args, index + 1)?) {
        ("", "") => Ok(None),
        (lat, lon) => {
            let parsed = lat.parse::<f64>().ok().zip(lon.parse::<f64>().ok());
            parsed
                .and_then(|(lat, lon)| GeoCoordinates::new(lat, lon))
                .map(Some)
                .ok_or_else(|| {
                    let detail = format!("invalid coordinates ({}, {})", lat, lon);
                    ProtocolError::InvalidArgument(detail)
                })
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
