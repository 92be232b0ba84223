//! Redis Engine
//!
//! Implements the store interface over a multiplexed async Redis connection. The
//! procedures are Redis Functions (`ermes.lua`), installed with `FUNCTION LOAD REPLACE`
//! and invoked with `FCALL`.

use super::driver::{ProcedureReply, StoreBackend, StoreConnection};
use super::protocol::FUNCTIONS_LIBRARY;
use crate::error::StoreError;
use crate::keys::StoreKey;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        // Server-side error replies carry a code; procedure failures travel that way.
        match err.code() {
            Some(code) => StoreError::Procedure(match err.detail() {
                Some(detail) => format!("{} {}", code, detail),
                None => code.to_string(),
            }),
            None => StoreError::Communication(err.to_string()),
        }
    }
}

fn reply_from(value: redis::Value) -> ProcedureReply {
    match value {
        redis::Value::Nil => ProcedureReply::Nil,
        redis::Value::Int(value) => ProcedureReply::Int(value),
        redis::Value::Data(data) => ProcedureReply::Data(data),
        redis::Value::Bulk(items) => {
            ProcedureReply::Array(items.into_iter().map(reply_from).collect())
        }
        redis::Value::Status(status) => ProcedureReply::Status(status),
        redis::Value::Okay => ProcedureReply::ok(),
    }
}

pub struct RedisBackend {
    client: redis::Client,
}

impl RedisBackend {
    pub fn open(uri: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(uri)?;
        Ok(Self { client })
    }

    /// Installs (or replaces) the procedures library on the server.
    pub async fn load_functions(&self) -> Result<(), StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let library: String = redis::cmd("FUNCTION")
            .arg("LOAD")
            .arg("REPLACE")
            .arg(FUNCTIONS_LIBRARY)
            .query_async(&mut conn)
            .await?;
        tracing::info!("Loaded store functions library '{}'", library);
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for RedisBackend {
    async fn connect(&self) -> Result<Arc<dyn StoreConnection>, StoreError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(Arc::new(RedisConnection {
            conn,
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct RedisConnection {
    conn: MultiplexedConnection,
    closed: AtomicBool,
}

impl RedisConnection {
    fn handle(&self) -> Result<MultiplexedConnection, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionClosed);
        }
        Ok(self.conn.clone())
    }
}

#[async_trait]
impl StoreConnection for RedisConnection {
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.handle()?;
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key.encode())
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &StoreKey, value: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.handle()?;
        redis::cmd("SET")
            .arg(key.encode())
            .arg(value)
            .arg("KEEPTTL")
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx(&self, key: &StoreKey, value: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.handle()?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key.encode())
            .arg(value)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn incr(&self, key: &StoreKey) -> Result<i64, StoreError> {
        let mut conn = self.handle()?;
        let value: i64 = redis::cmd("INCR")
            .arg(key.encode())
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn del(&self, keys: &[StoreKey]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.handle()?;
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key.encode());
        }
        let removed: u64 = cmd.query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn expire_at(&self, key: &StoreKey, at_ms: u64) -> Result<bool, StoreError> {
        let mut conn = self.handle()?;
        let applied: i64 = redis::cmd("PEXPIREAT")
            .arg(key.encode())
            .arg(at_ms)
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn scan(&self, pattern: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut conn = self.handle()?;
        let mut cursor = 0u64;
        let mut keys = Vec::new();

        loop {
            let (next, page): (u64, Vec<Vec<u8>>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(page);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    async fn call_procedure(
        &self,
        name: &str,
        keys: &[StoreKey],
        args: &[Vec<u8>],
    ) -> Result<ProcedureReply, StoreError> {
        let mut conn = self.handle()?;
        let mut cmd = redis::cmd("FCALL");
        cmd.arg(name).arg(keys.len());
        for key in keys {
            cmd.arg(key.encode());
        }
        for arg in args {
            cmd.arg(arg.as_slice());
        }

        let value: redis::Value = cmd.query_async(&mut conn).await?;
        Ok(reply_from(value))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
