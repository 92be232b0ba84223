//! Key Encoding Module
//!
//! Every logical keyspace shares one physical store namespace. A key is encoded as a
//! one-byte keyspace tag, `:`, the 36-byte session id plus `:` for session-scoped
//! keyspaces, and finally the optional sub-key bytes:
//!
//! ```text
//! S:3f0c5a8e-8d57-4c1e-9a57-0c8f4a3b2d11:cart
//! N:sessions-created
//! ```
//!
//! The layout keeps every keyspace, and every session inside a session-scoped keyspace,
//! prefix-scannable (`S:*`, `S:<sid>:*`).

pub mod codec;

pub use codec::{Keyspace, MalformedKey, SESSION_ID_LEN, SessionId, StoreKey};

#[cfg(test)]
mod tests;
