//! Default values for the environment knobs named in spec.md §6.

/// Default per-(user, thread) retention for the message log and artifact
/// index (spec.md §3, §4.2).
pub const DEFAULT_RETENTION: usize = 200;

/// Default multi-dispatch aggregation timeout (spec.md §4.4 step 4).
pub const DEFAULT_MULTI_DISPATCH_TIMEOUT_MS: u64 = 15_000;

/// JSON-RPC error code used for all routing-layer failures (spec.md §4.7).
pub const ROUTING_ERROR_CODE: i64 = -32001;
