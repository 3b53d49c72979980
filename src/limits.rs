//! Engine limits and constants.
//!
//! Collect all hard limits in one place so they're easy to find and
//! reference from both the engine and the queue validators.

/// Absolute ceiling on attempts for one run, regardless of task retry config.
///
/// Reaching it forces a terminal SYSTEM_FAILURE instead of another retry.
pub const MAX_TASK_RUN_ATTEMPTS: u32 = 250;

/// Maximum bytes kept from an error name or message.
pub const MAX_ERROR_MESSAGE_BYTES: usize = 4 * 1024;

/// Maximum bytes kept from a raw (string/custom) error payload or stack trace.
pub const MAX_ERROR_RAW_BYTES: usize = 64 * 1024;

/// Stack traces are cut to this many frames before persistence.
pub const MAX_STACK_TRACE_LINES: usize = 50;

/// Capacity of a consumer's in-flight index; oldest entries are evicted first.
pub const IN_FLIGHT_INDEX_CAPACITY: usize = 1024;

/// Version tag carried on every worker channel envelope.
pub const CHANNEL_PROTOCOL_VERSION: &str = "v1";

/// Length of the random suffix of friendly ids.
pub const FRIENDLY_ID_LENGTH: usize = 21;

/// Lifetime of an idempotency key when the caller gives none.
pub const DEFAULT_IDEMPOTENCY_KEY_TTL_SECS: u64 = 30 * 24 * 60 * 60;
