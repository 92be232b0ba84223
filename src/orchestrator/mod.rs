//! Orchestrator Module
//!
//! The client-facing half of the node. Every `/function/:name` call goes through the
//! `RequestOrchestrator`, which resolves the caller's session, locks it for the duration
//! of the registered handler and hands the (possibly refreshed) token back.

pub mod handlers;
pub mod orchestrator;
pub mod registry;
pub mod token;
pub mod types;

#[cfg(test)]
mod tests;
