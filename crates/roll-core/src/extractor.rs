use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_IMAGE_BYTES;
use crate::error::{CoreError, Result};

/// Bounding box of a detected face in image pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

/// One face found in an image together with its identity embedding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub region: FaceRegion,
    pub embedding: Vec<f32>,
}

/// External face-detection-and-embedding collaborator.
///
/// Returns every face found in `image`, possibly none. Callers decide what
/// to do with zero or several faces; an `Err` means the image could not be
/// processed at all.
///
/// Implementations must be safe for concurrent use.
pub trait EmbeddingExtractor: Send + Sync {
    fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>>;
}

impl<E: EmbeddingExtractor + ?Sized> EmbeddingExtractor for Arc<E> {
    fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>> {
        (**self).extract(image)
    }
}

/// Rejects missing and oversized images before extraction.
pub fn validate_image(image: &[u8]) -> Result<()> {
    if image.is_empty() {
        return Err(CoreError::Validation("image is empty".into()));
    }
    if image.len() > MAX_IMAGE_BYTES {
        return Err(CoreError::Validation(format!(
            "image is {} bytes, limit is {MAX_IMAGE_BYTES}",
            image.len()
        )));
    }
    Ok(())
}

/// Bounds an in-process extractor with a deadline.
///
/// The extraction runs on a helper thread; past the deadline the caller gets
/// [`CoreError::ExtractionTimeout`] and the late result is discarded.
pub struct TimedExtractor<E> {
    inner: Arc<E>,
    timeout: Duration,
}

impl<E> TimedExtractor<E> {
    pub fn new(inner: E, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(inner),
            timeout,
        }
    }
}

impl<E: EmbeddingExtractor + 'static> EmbeddingExtractor for TimedExtractor<E> {
    fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>> {
        let (tx, rx) = mpsc::sync_channel(1);
        let inner = Arc::clone(&self.inner);
        let image = image.to_vec();
        std::thread::Builder::new()
            .name("roll-extract".into())
            .spawn(move || {
                // Receiver may be gone after a timeout.
                let _ = tx.send(inner.extract(&image));
            })
            .map_err(|e| CoreError::Extraction(format!("failed to spawn extractor thread: {e}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(timeout = ?self.timeout, "embedding extraction timed out");
                Err(CoreError::ExtractionTimeout(self.timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(CoreError::Extraction(
                "extractor thread exited without a result".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<DetectedFace>);

    impl EmbeddingExtractor for Fixed {
        fn extract(&self, _image: &[u8]) -> Result<Vec<DetectedFace>> {
            Ok(self.0.clone())
        }
    }

    struct Slow(Duration);

    impl EmbeddingExtractor for Slow {
        fn extract(&self, _image: &[u8]) -> Result<Vec<DetectedFace>> {
            std::thread::sleep(self.0);
            Ok(vec![])
        }
    }

    struct Panics;

    impl EmbeddingExtractor for Panics {
        fn extract(&self, _image: &[u8]) -> Result<Vec<DetectedFace>> {
            panic!("model crashed");
        }
    }

    #[test]
    fn test_validate_image() {
        assert!(validate_image(b"jpeg").is_ok());
        assert!(matches!(validate_image(b""), Err(CoreError::Validation(_))));
        let big = vec![0u8; MAX_IMAGE_BYTES + 1];
        assert!(matches!(validate_image(&big), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_timed_passes_result_through() {
        let face = DetectedFace {
            region: FaceRegion::default(),
            embedding: vec![0.5; 4],
        };
        let timed = TimedExtractor::new(Fixed(vec![face.clone()]), Duration::from_secs(5));
        assert_eq!(timed.extract(b"img").unwrap(), vec![face]);
    }

    #[test]
    fn test_timed_times_out() {
        let timed = TimedExtractor::new(Slow(Duration::from_millis(500)), Duration::from_millis(20));
        let err = timed.extract(b"img").unwrap_err();
        assert!(matches!(err, CoreError::ExtractionTimeout(_)));
        assert!(err.is_validation());
    }

    #[test]
    fn test_timed_reports_crashed_extractor() {
        let timed = TimedExtractor::new(Panics, Duration::from_secs(5));
        assert!(matches!(
            timed.extract(b"img"),
            Err(CoreError::Extraction(_))
        ));
    }

    #[test]
    fn test_face_json_shape() {
        let json = r#"[{"region":{"top":1,"right":2,"bottom":3,"left":4},"embedding":[0.1,0.2]}]"#;
        let faces: Vec<DetectedFace> = serde_json::from_str(json).unwrap();
        assert_eq!(faces[0].region.left, 4);
        assert_eq!(faces[0].embedding.len(), 2);
    }
}
