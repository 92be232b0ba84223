//! Ermes: Session Mobility at the Edge
//!
//! This library crate defines the modules of an edge node that keeps per-user sessions
//! close to the user. It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//!
//! - **`keys`**: The typed key codec every stored value is addressed by.
//! - **`store`**: The atomic session primitives, over Redis 7 functions or an in-process engine.
//! - **`connection`**: Per-execution-context connection cache to the node's store.
//! - **`offload`**: Lock/offload state machine driving a session between two nodes.
//! - **`topology`**: The infrastructure tree: where a location is and who its parent is.
//! - **`migration`**: The HTTP protocol nodes speak to move sessions between each other.
//! - **`orchestrator`**: Wraps user functions with session acquisition and release.
//! - **`node`**: Assembles all of the above into one servable edge node.

pub mod config;
pub mod connection;
pub mod error;
pub mod keys;
pub mod migration;
pub mod node;
pub mod offload;
pub mod orchestrator;
pub mod store;
pub mod topology;
