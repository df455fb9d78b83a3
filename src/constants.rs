/// Application constants
///
/// Tunables for the delivery pipeline, organized by category.
// ============================================================================
// Retry Configuration
// ============================================================================
/// Maximum number of dead-letter hops before a message is parked in the
/// dead queue
pub const MAX_DELIVERY_RETRIES: i64 = 5;

/// Delay applied by the retry queue before a rejected message re-enters the
/// main queue, in milliseconds
pub const RETRY_QUEUE_TTL_MS: i32 = 15_000;

/// Maximum broker connection attempts per worker
pub const CONNECT_MAX_ATTEMPTS: u32 = 5;

// ============================================================================
// Idempotency TTLs
// ============================================================================

/// How long a `processing` claim is held before a crashed worker
/// relinquishes it (5 minutes)
pub const CLAIM_TTL_SECONDS: u64 = 5 * 60;

/// How long a `processed` record suppresses redeliveries (24 hours)
pub const PROCESSED_TTL_SECONDS: u64 = 24 * 60 * 60;

// ============================================================================
// Workers & Monitoring
// ============================================================================

/// Worker parallelism when `WORKER_COUNT` is unset
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Emit a per-worker metrics line every this many handled deliveries
pub const METRICS_LOG_INTERVAL: u64 = 10;
