//! Store Driver Interface
//!
//! A connection exposes the handful of primitive commands the session layer needs and a
//! single entry point for the store-side atomic procedures. Engines implement it directly
//! against their client.

use crate::error::StoreError;
use crate::keys::StoreKey;
use async_trait::async_trait;
use std::sync::Arc;

/// Reply of a store-side procedure.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcedureReply {
    Nil,
    Status(String),
    Int(i64),
    Data(Vec<u8>),
    Array(Vec<ProcedureReply>),
}

impl ProcedureReply {
    pub fn ok() -> Self {
        ProcedureReply::Status("OK".to_string())
    }

    /// Textual view of a status or bulk reply.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ProcedureReply::Status(status) => Some(status),
            ProcedureReply::Data(data) => std::str::from_utf8(data).ok(),
            _ => None,
        }
    }

    /// Splits a `[tag, body]` reply, as returned by procedures with more than one outcome.
    pub fn tagged(&self) -> Option<(&str, &[u8])> {
        match self {
            ProcedureReply::Array(items) if items.len() == 2 => {
                let tag = items[0].as_text()?;
                match &items[1] {
                    ProcedureReply::Data(body) => Some((tag, body.as_slice())),
                    ProcedureReply::Status(body) => Some((tag, body.as_bytes())),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

#[async_trait]
pub trait StoreConnection: Send + Sync {
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Overwrites a value, keeping any expiry already set on the key.
    async fn set(&self, key: &StoreKey, value: &[u8]) -> Result<(), StoreError>;

    async fn set_nx(&self, key: &StoreKey, value: &[u8]) -> Result<bool, StoreError>;

    async fn incr(&self, key: &StoreKey) -> Result<i64, StoreError>;

    async fn del(&self, keys: &[StoreKey]) -> Result<u64, StoreError>;

    /// Sets an absolute expiry in milliseconds since the epoch. `false` if the key is absent.
    async fn expire_at(&self, key: &StoreKey, at_ms: u64) -> Result<bool, StoreError>;

    /// Raw keys matching a glob such as `M:<sid>:*`.
    async fn scan(&self, pattern: &[u8]) -> Result<Vec<Vec<u8>>, StoreError>;

    async fn call_procedure(
        &self,
        name: &str,
        keys: &[StoreKey],
        args: &[Vec<u8>],
    ) -> Result<ProcedureReply, StoreError>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn StoreConnection>, StoreError>;
}
