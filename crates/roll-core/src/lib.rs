//! Roll-call engine: turns a face embedding into a verified identity and
//! records that identity's attendance at most once per day.
//!
//! Components, leaf-first:
//!
//! 1. [`EmbeddingStore`]: one enrolled embedding per identity.
//! 2. [`Matcher`]: brute-force Euclidean nearest neighbor plus the
//!    acceptance threshold.
//! 3. [`AttendanceLedger`]: per-day `identity -> record` buckets with an
//!    atomic check-and-insert.
//! 4. [`EnrollmentManager`]: validates images through the external
//!    [`EmbeddingExtractor`] and the [`IdentityDirectory`] before writing.
//!
//! [`RollCall`] composes them into the recognition, enrollment and
//! attendance APIs. No file I/O here; persistence lives in `roll-store`.

pub mod constants;
pub mod directory;
pub mod embedding;
pub mod enrollment;
pub mod error;
pub mod extractor;
pub mod identity;
pub mod ledger;
pub mod matcher;
pub mod rollcall;
pub mod store;
pub mod time;

pub use constants::{
    DEFAULT_DIMENSION, DEFAULT_LOCK_WAIT, DEFAULT_THRESHOLD, MAX_IMAGE_BYTES, TIE_EPSILON,
};
pub use directory::{IdentityDirectory, MemoryDirectory};
pub use embedding::{Enrollment, euclidean_distance, validate_embedding};
pub use enrollment::{EnrollOutcome, EnrollmentManager, RegisteredFace, Rejection};
pub use error::{CoreError, Result};
pub use extractor::{DetectedFace, EmbeddingExtractor, FaceRegion, TimedExtractor, validate_image};
pub use identity::{Day, Identity, IdentityKey};
pub use ledger::{AttendanceLedger, AttendanceRecord, MarkOutcome, MemoryLedger, Status};
pub use matcher::{Match, MatchOutcome, Matcher, MatcherConfig, NoMatchReason};
pub use rollcall::{Recognition, RollCall};
pub use store::{EmbeddingStore, MemoryEmbeddingStore};
pub use time::{now_iso8601, now_unix_secs, unix_to_iso8601};
