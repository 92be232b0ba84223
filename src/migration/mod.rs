//! Migration Module
//!
//! The node-to-node half of session mobility: moving a session's payload, record and
//! processed request ids between edge nodes over HTTP.
//!
//! ## Flows
//! - **Offload**: a node pushes a session to another (`force-offload`, `offload-session`).
//! - **Onload**: a child pulls a session from its parent (`request-onload`, `onload-session`).
//! - **Update**: the proprietary node learns where its session went (`update-session`).

pub mod client;
pub mod handlers;
pub mod protocol;
pub mod service;
