//! Topology Module
//!
//! Read-only view of the edge infrastructure: a forest of areas (city, region, country...)
//! each served by a main node. The core only ever asks two questions of it: "where is
//! location X" and "who is the parent of location X".
//!
//! - **`types`**: The infrastructure tree as it is serialized.
//! - **`resolver`**: `Topology`, an index over the tree built once at startup.

pub mod resolver;
pub mod types;
