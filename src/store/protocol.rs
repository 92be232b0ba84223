//! Store-Side Procedure Definitions
//!
//! Every procedure receives `KEYS = [metadata key, data key]` of one session and a list
//! of byte-string arguments. Absent optional arguments are sent as empty strings.
//!
//! | Procedure | Arguments |
//! |---|---|
//! | `create_and_acquire_*` | lat, lon, createdIn, expiresAt, holderId |
//! | `onload_start` | lat, lon, createdIn, createdAt, updatedAt, expiresAt, originSessionId, data |
//! | `acquire_*` | allowDuringOffload (`1`/`0`), holderId |
//! | `release_*`, `renew_lock` | holderId |
//! | `offload_start` | holderId of the caller (empty if it holds no lock) |
//! | `offload_finish` | endpoint, newSessionId, locationId |
//! | `set_expire_time` | expiresAt |
//! | `update_coordinates` | lat, lon |
//!
//! The remaining procedures take no arguments.

pub const CREATE_AND_ACQUIRE_EXCLUSIVE: &str = "ermes_create_and_acquire_exclusive";
pub const CREATE_AND_ACQUIRE_SHARED: &str = "ermes_create_and_acquire_shared";
pub const ONLOAD_START: &str = "ermes_onload_start";
pub const ONLOAD_FINISH: &str = "ermes_onload_finish";
pub const ACQUIRE_EXCLUSIVE: &str = "ermes_acquire_exclusive";
pub const ACQUIRE_SHARED: &str = "ermes_acquire_shared";
pub const RELEASE_EXCLUSIVE: &str = "ermes_release_exclusive";
pub const RELEASE_SHARED: &str = "ermes_release_shared";
pub const RENEW_LOCK: &str = "ermes_renew_lock";
pub const OFFLOAD_START: &str = "ermes_offload_start";
pub const OFFLOAD_FINISH: &str = "ermes_offload_finish";
pub const OFFLOAD_CANCEL: &str = "ermes_offload_cancel";
pub const DELETE_SESSION: &str = "ermes_delete_session";
pub const DELETE_SESSION_METADATA: &str = "ermes_delete_session_metadata";
pub const SET_EXPIRE_TIME: &str = "ermes_set_expire_time";
pub const UPDATE_COORDINATES: &str = "ermes_update_coordinates";
pub const GET_SESSION_DATA: &str = "ermes_get_session_data";

/// Reply tag of a procedure that found a forwarding pointer instead of live data.
pub const REPLY_MOVED: &str = "moved";
/// Reply tag carrying session payload bytes.
pub const REPLY_DATA: &str = "data";

/// Payload written for a freshly created session.
pub const EMPTY_PAYLOAD: &[u8] = b"{}";

/// Lease of a session lock. A lock whose lease ran out counts as free.
pub const LOCK_LEASE_MS: u64 = 30_000;

/// The Redis Functions library implementing the procedures above.
pub const FUNCTIONS_LIBRARY: &str = include_str!("ermes.lua");

/// Encodes an optional argument, absent values travelling as empty strings.
pub fn optional_arg<T: ToString>(value: Option<T>) -> Vec<u8> {
    value.map(|v| v.to_string().into_bytes()).unwrap_or_default()
}
