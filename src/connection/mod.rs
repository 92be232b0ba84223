//! Connection Management Module
//!
//! One store connection per execution context, shared by every nested user inside that
//! context and closed when the outermost user lets go.
//!
//! - **`manager`**: `ExecutionContext`, the ref-counted `Connection` handle and the
//!   `ConnectionManager` cache.

pub mod manager;

pub use manager::{Connection, ConnectionManager, ExecutionContext};

#[cfg(test)]
mod tests;
