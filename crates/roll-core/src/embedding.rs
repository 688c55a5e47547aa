use std::fmt;
use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::identity::IdentityKey;

/// One identity's enrolled face: the embedding plus the captured image kept
/// for audit and display.
///
/// Both buffers are shared and never mutated after construction; replacing an
/// enrollment means publishing a new `Enrollment`.
#[derive(Clone)]
pub struct Enrollment {
    pub identity: IdentityKey,
    pub embedding: Arc<[f32]>,
    pub image: Arc<[u8]>,
    pub enrolled_at: String,
}

impl Enrollment {
    pub fn new(identity: IdentityKey, embedding: Vec<f32>, image: Vec<u8>, enrolled_at: String) -> Self {
        Self {
            identity,
            embedding: embedding.into(),
            image: image.into(),
            enrolled_at,
        }
    }
}

impl fmt::Debug for Enrollment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enrollment")
            .field("identity", &self.identity)
            .field("embedding_len", &self.embedding.len())
            .field("image_bytes", &self.image.len())
            .field("enrolled_at", &self.enrolled_at)
            .finish()
    }
}

/// Checks length and finiteness of an embedding.
pub fn validate_embedding(embedding: &[f32], dimension: usize) -> Result<()> {
    if embedding.is_empty() {
        return Err(CoreError::Validation("embedding is empty".into()));
    }
    if embedding.len() != dimension {
        return Err(CoreError::DimensionMismatch {
            expected: dimension,
            got: embedding.len(),
        });
    }
    if let Some(i) = embedding.iter().position(|v| !v.is_finite()) {
        return Err(CoreError::Validation(format!(
            "embedding component {i} is not finite"
        )));
    }
    Ok(())
}

/// Euclidean distance. Callers guarantee equal lengths.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}
