use crate::error::ErmesError;
use crate::keys::SessionId;
use crate::offload::types::LockMode;
use super::token::SessionToken;

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// How a registered function wants its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandlerOptions {
    /// Take a shared lock instead of an exclusive one.
    pub read_only: bool,
    /// Keep the request's store connection open while the handler runs.
    pub reuse_internal_connection: bool,
    /// Run even while the session is being offloaded.
    pub execution_during_offload: bool,
}

impl HandlerOptions {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn lock_mode(&self) -> LockMode {
        if self.read_only {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        }
    }
}

/// An inbound function call, detached from the HTTP server that received it.
#[derive(Debug, Clone, Default)]
pub struct ErmesRequest {
    pub method: String,
    /// Path plus query string, exactly as received.
    pub path_and_query: String,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ErmesRequest {
    pub fn new(method: impl Into<String>, path_and_query: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path_and_query: path_and_query.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        let (_, query) = self.path_and_query.split_once('?')?;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErmesResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ErmesResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(body.into().into_bytes())
    }

    pub fn json<T: Serialize>(status: u16, body: &T) -> Result<Self, ErmesError> {
        Ok(Self::new(status)
            .with_header("Content-Type", "application/json")
            .with_body(serde_json::to_vec(body)?))
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

struct ContextState {
    session_id: SessionId,
    token: SessionToken,
    mode: LockMode,
    payload: RwLock<Map<String, Value>>,
    dirty: AtomicBool,
}

/// The session bound to one handler invocation.
///
/// Clones share the same payload. Writes are refused when the session is held shared.
#[derive(Clone)]
pub struct SessionContext {
    state: Arc<ContextState>,
}

impl SessionContext {
    pub fn new(token: SessionToken, mode: LockMode, payload: Map<String, Value>) -> Self {
        Self {
            state: Arc::new(ContextState {
                session_id: token.session_id.clone(),
                token,
                mode,
                payload: RwLock::new(payload),
                dirty: AtomicBool::new(false),
            }),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.state.session_id
    }

    pub fn token(&self) -> &SessionToken {
        &self.state.token
    }

    pub fn is_read_only(&self) -> bool {
        self.state.mode == LockMode::Shared
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.state.payload.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: impl Into<String>, value: Value) -> Result<(), ErmesError> {
        if self.is_read_only() {
            return Err(ErmesError::ReadOnlySession);
        }
        self.state.payload.write().await.insert(key.into(), value);
        self.state.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<Option<Value>, ErmesError> {
        if self.is_read_only() {
            return Err(ErmesError::ReadOnlySession);
        }
        let removed = self.state.payload.write().await.remove(key);
        if removed.is_some() {
            self.state.dirty.store(true, Ordering::SeqCst);
        }
        Ok(removed)
    }

    pub async fn snapshot(&self) -> Map<String, Value> {
        self.state.payload.read().await.clone()
    }

    /// True once the handler changed the payload.
    pub fn is_dirty(&self) -> bool {
        self.state.dirty.load(Ordering::SeqCst)
    }
}
