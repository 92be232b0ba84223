//! Session Store Module
//!
//! Everything that talks to the shared key-value store.
//!
//! ## Components
//! - **`driver`**: The explicit `StoreBackend` / `StoreConnection` interface every engine
//!   implements (primitive commands plus named atomic procedures).
//! - **`record`**: The persisted session record and the lock/offload rules applied to it.
//! - **`protocol`**: Procedure names and their argument layout.
//! - **`memory`**: In-process engine. Runs every procedure under one mutex, so each is atomic.
//! - **`redis`**: Redis engine. Procedures are Redis Functions from `ermes.lua`.
//! - **`session`**: `SessionStore`, the single-round-trip primitives used by the coordinator.

pub mod driver;
pub mod memory;
pub mod protocol;
pub mod record;
pub mod redis;
pub mod session;
