use std::time::Duration;

/// Embedding length produced by the reference face extractor.
pub const DEFAULT_DIMENSION: usize = 128;

/// Maximum Euclidean distance accepted as a match.
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Distances closer than this are treated as equal (tie-break by identity key).
pub const TIE_EPSILON: f32 = 1e-6;

/// Images above this size are rejected before extraction (10 MiB).
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Upper bound on any lock acquisition before reporting contention.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(2);

/// Attempts a marker makes against a bucket retired by a concurrent reset.
pub const RETIRED_BUCKET_RETRIES: usize = 3;
