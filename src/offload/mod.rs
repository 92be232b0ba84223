//! Offload Coordination Module
//!
//! The per-session state machine spread across nodes:
//!
//! ```text
//! Unlocked <-> LockedExclusive / LockedShared(n)
//!    |  offload_start
//!    v
//! OffloadPending --offload_cancel--> Unlocked
//!    |  offload_finish
//!    v
//! Offloaded (forwarding pointer only)
//!
//! destination: onload_start -> Onloading --onload_finish--> Unlocked
//! ```
//!
//! Every transition is one atomic store-side procedure; this module only issues them and
//! turns their failures into typed errors.
//!
//! - **`types`**: Outcomes and the snapshot moved between nodes.
//! - **`retry`**: Bounded exponential backoff used wherever we wait on someone else's lock.
//! - **`coordinator`**: `OffloadCoordinator`.

pub mod coordinator;
pub mod retry;
pub mod types;
