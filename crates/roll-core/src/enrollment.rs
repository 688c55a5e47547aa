use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::directory::IdentityDirectory;
use crate::error::Result;
use crate::extractor::{DetectedFace, EmbeddingExtractor, validate_image};
use crate::identity::IdentityKey;
use crate::store::EmbeddingStore;

/// User-actionable reasons an image or identity was refused.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    NoFaceDetected,
    MultipleFacesDetected { count: usize },
    UnknownIdentity { identity: IdentityKey },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NoFaceDetected => write!(f, "no face detected, try again"),
            Rejection::MultipleFacesDetected { count } => write!(
                f,
                "{count} faces detected, capture exactly one face"
            ),
            Rejection::UnknownIdentity { identity } => write!(f, "unknown identity {identity}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnrollOutcome {
    Enrolled,
    Rejected(Rejection),
}

/// An enrolled identity as shown to operators.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RegisteredFace {
    pub identity: IdentityKey,
    /// Directory name, empty if the identity has since left the directory.
    pub name: String,
    pub enrolled_at: String,
    #[serde(skip)]
    pub image: Arc<[u8]>,
}

/// Requires exactly one face in an extraction result.
pub fn single_face(mut faces: Vec<DetectedFace>) -> std::result::Result<DetectedFace, Rejection> {
    match faces.len() {
        0 => Err(Rejection::NoFaceDetected),
        1 => Ok(faces.remove(0)),
        count => Err(Rejection::MultipleFacesDetected { count }),
    }
}

/// Writes and removes enrollments after validating the identity and image.
pub struct EnrollmentManager {
    directory: Arc<dyn IdentityDirectory>,
    store: Arc<dyn EmbeddingStore>,
    extractor: Arc<dyn EmbeddingExtractor>,
}

impl EnrollmentManager {
    pub fn new(
        directory: Arc<dyn IdentityDirectory>,
        store: Arc<dyn EmbeddingStore>,
        extractor: Arc<dyn EmbeddingExtractor>,
    ) -> Self {
        Self {
            directory,
            store,
            extractor,
        }
    }

    /// Extracts exactly one face from `image` and makes it `identity`'s
    /// enrollment, replacing any previous one.
    pub fn enroll(&self, identity: &IdentityKey, image: &[u8]) -> Result<EnrollOutcome> {
        validate_image(image)?;

        if self.directory.lookup(identity)?.is_none() {
            tracing::warn!(%identity, "enrollment refused: identity not in directory");
            return Ok(EnrollOutcome::Rejected(Rejection::UnknownIdentity {
                identity: identity.clone(),
            }));
        }

        let face = match single_face(self.extractor.extract(image)?) {
            Ok(face) => face,
            Err(rejection) => {
                tracing::warn!(%identity, %rejection, "enrollment refused");
                return Ok(EnrollOutcome::Rejected(rejection));
            }
        };

        self.store.enroll(identity, face.embedding, image.to_vec())?;
        tracing::info!(%identity, "enrolled face");
        Ok(EnrollOutcome::Enrolled)
    }

    /// Removes `identity`'s enrollment. Idempotent; returns whether one existed.
    pub fn unenroll(&self, identity: &IdentityKey) -> Result<bool> {
        let removed = self.store.remove(identity)?;
        if removed {
            tracing::info!(%identity, "removed face");
        }
        Ok(removed)
    }

    pub fn clear_all(&self) -> Result<usize> {
        let removed = self.store.remove_all()?;
        tracing::info!(removed, "cleared all faces");
        Ok(removed)
    }

    /// Enrolled identities sorted by key, with their directory names.
    pub fn registered(&self) -> Result<Vec<RegisteredFace>> {
        let enrolled = self.store.scan_all()?;
        let mut out = Vec::with_capacity(enrolled.len());
        for e in enrolled {
            let name = self
                .directory
                .lookup(&e.identity)?
                .map(|i| i.name)
                .unwrap_or_default();
            out.push(RegisteredFace {
                identity: e.identity,
                name,
                enrolled_at: e.enrolled_at,
                image: e.image,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::error::CoreError;
    use crate::extractor::FaceRegion;
    use crate::identity::Identity;
    use crate::store::MemoryEmbeddingStore;

    /// Returns whatever faces were queued, counting calls.
    struct Scripted {
        faces: Mutex<Vec<DetectedFace>>,
        calls: Mutex<usize>,
    }

    impl Scripted {
        fn new(embeddings: &[Vec<f32>]) -> Self {
            Self {
                faces: Mutex::new(
                    embeddings
                        .iter()
                        .map(|e| DetectedFace {
                            region: FaceRegion::default(),
                            embedding: e.clone(),
                        })
                        .collect(),
                ),
                calls: Mutex::new(0),
            }
        }
    }

    impl EmbeddingExtractor for Scripted {
        fn extract(&self, _image: &[u8]) -> Result<Vec<DetectedFace>> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.faces.lock().unwrap().clone())
        }
    }

    fn key(s: &str) -> IdentityKey {
        IdentityKey::parse(s).unwrap()
    }

    fn setup(faces: &[Vec<f32>]) -> (EnrollmentManager, Arc<MemoryEmbeddingStore>, Arc<Scripted>) {
        let dir = Arc::new(MemoryDirectory::new());
        dir.insert(Identity::new(key("S001"), "Alice")).unwrap();
        let store = Arc::new(MemoryEmbeddingStore::new(3));
        let extractor = Arc::new(Scripted::new(faces));
        let mgr = EnrollmentManager::new(dir, store.clone(), extractor.clone());
        (mgr, store, extractor)
    }

    #[test]
    fn test_enroll_single_face() {
        let (mgr, store, _) = setup(&[vec![0.1, 0.2, 0.3]]);
        assert_eq!(mgr.enroll(&key("S001"), b"img").unwrap(), EnrollOutcome::Enrolled);

        let e = store.get(&key("S001")).unwrap().unwrap();
        assert_eq!(&*e.embedding, &[0.1, 0.2, 0.3]);
        assert_eq!(&*e.image, b"img");
    }

    #[test]
    fn test_no_face_rejected() {
        let (mgr, store, _) = setup(&[]);
        assert_eq!(
            mgr.enroll(&key("S001"), b"img").unwrap(),
            EnrollOutcome::Rejected(Rejection::NoFaceDetected)
        );
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_multiple_faces_rejected() {
        let (mgr, store, _) = setup(&[vec![0.0; 3], vec![1.0; 3]]);
        assert_eq!(
            mgr.enroll(&key("S001"), b"img").unwrap(),
            EnrollOutcome::Rejected(Rejection::MultipleFacesDetected { count: 2 })
        );
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_unknown_identity_skips_extraction() {
        let (mgr, store, extractor) = setup(&[vec![0.0; 3]]);
        let out = mgr.enroll(&key("S404"), b"img").unwrap();
        assert!(matches!(
            out,
            EnrollOutcome::Rejected(Rejection::UnknownIdentity { .. })
        ));
        assert_eq!(*extractor.calls.lock().unwrap(), 0);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_wrong_dimension_is_validation_error() {
        let (mgr, store, _) = setup(&[vec![0.0; 5]]);
        let err = mgr.enroll(&key("S001"), b"img").unwrap_err();
        assert!(matches!(err, CoreError::DimensionMismatch { .. }));
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_empty_image_is_validation_error() {
        let (mgr, _, extractor) = setup(&[vec![0.0; 3]]);
        assert!(matches!(
            mgr.enroll(&key("S001"), b""),
            Err(CoreError::Validation(_))
        ));
        assert_eq!(*extractor.calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_unenroll_idempotent_and_registered() {
        let (mgr, _, _) = setup(&[vec![0.0; 3]]);
        mgr.enroll(&key("S001"), b"img").unwrap();

        let reg = mgr.registered().unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg[0].name, "Alice");

        assert!(mgr.unenroll(&key("S001")).unwrap());
        assert!(!mgr.unenroll(&key("S001")).unwrap());
        assert!(mgr.registered().unwrap().is_empty());
    }

    #[test]
    fn test_rejection_messages() {
        assert_eq!(Rejection::NoFaceDetected.to_string(), "no face detected, try again");
        assert_eq!(
            Rejection::MultipleFacesDetected { count: 3 }.to_string(),
            "3 faces detected, capture exactly one face"
        );
    }
}
