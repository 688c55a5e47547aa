use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::directory::IdentityDirectory;
use crate::enrollment::{EnrollOutcome, EnrollmentManager, RegisteredFace, Rejection, single_face};
use crate::error::Result;
use crate::extractor::{EmbeddingExtractor, validate_image};
use crate::identity::{Day, Identity, IdentityKey};
use crate::ledger::{AttendanceLedger, AttendanceRecord, MarkOutcome};
use crate::matcher::{MatchOutcome, Matcher, MatcherConfig, NoMatchReason};
use crate::store::EmbeddingStore;
use crate::time::now_iso8601;

/// Result of a recognition attempt.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Recognition {
    /// Matched and newly marked present.
    Marked {
        identity: IdentityKey,
        name: String,
        distance: f32,
        record: AttendanceRecord,
    },
    /// Matched, but already marked today. Success-equivalent for callers.
    AlreadyMarked {
        identity: IdentityKey,
        name: String,
        distance: f32,
        record: AttendanceRecord,
    },
    NoMatch(NoMatchReason),
    /// The image did not contain exactly one face.
    Rejected(Rejection),
}

impl Recognition {
    pub fn identity(&self) -> Option<&IdentityKey> {
        match self {
            Recognition::Marked { identity, .. } | Recognition::AlreadyMarked { identity, .. } => {
                Some(identity)
            }
            _ => None,
        }
    }
}

/// Recognition, enrollment and attendance APIs over injected collaborators.
pub struct RollCall {
    directory: Arc<dyn IdentityDirectory>,
    store: Arc<dyn EmbeddingStore>,
    ledger: Arc<dyn AttendanceLedger>,
    extractor: Arc<dyn EmbeddingExtractor>,
    matcher: Matcher,
    enrollment: EnrollmentManager,
}

impl RollCall {
    pub fn new(
        directory: Arc<dyn IdentityDirectory>,
        store: Arc<dyn EmbeddingStore>,
        ledger: Arc<dyn AttendanceLedger>,
        extractor: Arc<dyn EmbeddingExtractor>,
        cfg: MatcherConfig,
    ) -> Self {
        if cfg.dimension != store.dimension() {
            tracing::warn!(
                matcher = cfg.dimension,
                store = store.dimension(),
                "matcher and embedding store disagree on dimension"
            );
        }
        let enrollment = EnrollmentManager::new(directory.clone(), store.clone(), extractor.clone());
        Self {
            directory,
            store,
            ledger,
            extractor,
            matcher: Matcher::new(cfg),
            enrollment,
        }
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    // --- Recognition ---

    /// Extracts the single face in `image`, matches it and marks the match
    /// present on `day`.
    pub fn submit_probe(&self, image: &[u8], day: &Day) -> Result<Recognition> {
        validate_image(image)?;
        let face = match single_face(self.extractor.extract(image)?) {
            Ok(face) => face,
            Err(rejection) => {
                tracing::warn!(%rejection, "probe refused");
                return Ok(Recognition::Rejected(rejection));
            }
        };
        self.recognize_embedding(&face.embedding, day)
    }

    /// Matches an already extracted probe embedding and marks the match
    /// present on `day`.
    pub fn recognize_embedding(&self, probe: &[f32], day: &Day) -> Result<Recognition> {
        self.recognize_embedding_at(probe, day, &now_iso8601())
    }

    pub fn recognize_embedding_at(
        &self,
        probe: &[f32],
        day: &Day,
        timestamp: &str,
    ) -> Result<Recognition> {
        let found = match self.matcher.find(self.store.as_ref(), probe)? {
            MatchOutcome::Matched(m) => m,
            MatchOutcome::NoMatch(reason) => {
                tracing::debug!(?reason, "no match");
                return Ok(Recognition::NoMatch(reason));
            }
        };

        let name = self
            .directory
            .lookup(&found.identity)?
            .map(|i| i.name)
            .unwrap_or_default();

        let outcome = self
            .ledger
            .try_mark_present(day, &found.identity, &name, timestamp)?;
        let identity = found.identity;
        let distance = found.distance;
        Ok(match outcome {
            MarkOutcome::Marked(record) => {
                tracing::info!(%identity, %day, distance, "marked present");
                Recognition::Marked {
                    identity,
                    name,
                    distance,
                    record,
                }
            }
            MarkOutcome::AlreadyMarked(record) => {
                tracing::info!(%identity, %day, "already marked");
                Recognition::AlreadyMarked {
                    identity,
                    name,
                    distance,
                    record,
                }
            }
        })
    }

    /// Matches without touching the ledger.
    pub fn match_embedding(&self, probe: &[f32]) -> Result<MatchOutcome> {
        self.matcher.find(self.store.as_ref(), probe)
    }

    // --- Enrollment ---

    pub fn enroll(&self, identity: &IdentityKey, image: &[u8]) -> Result<EnrollOutcome> {
        self.enrollment.enroll(identity, image)
    }

    pub fn unenroll(&self, identity: &IdentityKey) -> Result<bool> {
        self.enrollment.unenroll(identity)
    }

    pub fn clear_faces(&self) -> Result<usize> {
        self.enrollment.clear_all()
    }

    pub fn registered(&self) -> Result<Vec<RegisteredFace>> {
        self.enrollment.registered()
    }

    pub fn students(&self) -> Result<Vec<Identity>> {
        self.directory.list()
    }

    // --- Attendance ---

    pub fn get_day(&self, day: &Day) -> Result<BTreeMap<IdentityKey, AttendanceRecord>> {
        self.ledger.get_day(day)
    }

    pub fn reset_day(&self, day: &Day) -> Result<usize> {
        let removed = self.ledger.reset_day(day)?;
        tracing::info!(%day, removed, "reset attendance day");
        Ok(removed)
    }

    pub fn days(&self) -> Result<Vec<Day>> {
        self.ledger.days()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::extractor::{DetectedFace, FaceRegion};
    use crate::ledger::MemoryLedger;
    use crate::store::MemoryEmbeddingStore;

    /// Treats the image bytes as a comma-separated embedding; "none" and
    /// "two" script the rejection paths.
    struct TextExtractor;

    impl EmbeddingExtractor for TextExtractor {
        fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>> {
            let text = String::from_utf8_lossy(image);
            let face = |embedding: Vec<f32>| DetectedFace {
                region: FaceRegion::default(),
                embedding,
            };
            Ok(match text.as_ref() {
                "none" => vec![],
                "two" => vec![face(vec![0.0; 3]), face(vec![1.0; 3])],
                _ => vec![face(
                    text.split(',').map(|v| v.trim().parse().unwrap_or(f32::NAN)).collect(),
                )],
            })
        }
    }

    fn key(s: &str) -> IdentityKey {
        IdentityKey::parse(s).unwrap()
    }

    fn day() -> Day {
        Day::parse("2024-01-01").unwrap()
    }

    fn rollcall() -> RollCall {
        let dir = Arc::new(MemoryDirectory::new());
        dir.insert(Identity::new(key("S001"), "Alice")).unwrap();
        dir.insert(Identity::new(key("S002"), "Bob")).unwrap();
        RollCall::new(
            dir,
            Arc::new(MemoryEmbeddingStore::new(3)),
            Arc::new(MemoryLedger::new()),
            Arc::new(TextExtractor),
            MatcherConfig {
                dimension: 3,
                ..MatcherConfig::default()
            },
        )
    }

    #[test]
    fn test_submit_probe_marks_then_already_marked() {
        let rc = rollcall();
        assert_eq!(rc.enroll(&key("S001"), b"1,0,0").unwrap(), EnrollOutcome::Enrolled);
        assert_eq!(rc.enroll(&key("S002"), b"0,1,0").unwrap(), EnrollOutcome::Enrolled);

        let first = rc.submit_probe(b"1,0,0", &day()).unwrap();
        match &first {
            Recognition::Marked {
                identity,
                name,
                distance,
                ..
            } => {
                assert_eq!(identity.as_str(), "S001");
                assert_eq!(name, "Alice");
                assert_eq!(*distance, 0.0);
            }
            other => panic!("expected Marked, got {other:?}"),
        }

        let second = rc.submit_probe(b"0.95,0.05,0", &day()).unwrap();
        assert!(matches!(second, Recognition::AlreadyMarked { .. }));
        assert_eq!(second.identity().unwrap().as_str(), "S001");

        let records = rc.get_day(&day()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[&key("S001")].name, "Alice");
    }

    #[test]
    fn test_submit_probe_rejections() {
        let rc = rollcall();
        assert_eq!(
            rc.submit_probe(b"none", &day()).unwrap(),
            Recognition::Rejected(Rejection::NoFaceDetected)
        );
        assert_eq!(
            rc.submit_probe(b"two", &day()).unwrap(),
            Recognition::Rejected(Rejection::MultipleFacesDetected { count: 2 })
        );
        assert!(rc.submit_probe(b"", &day()).is_err());
    }

    #[test]
    fn test_no_match_writes_nothing() {
        let rc = rollcall();
        assert_eq!(
            rc.submit_probe(b"1,0,0", &day()).unwrap(),
            Recognition::NoMatch(NoMatchReason::Empty)
        );

        rc.enroll(&key("S001"), b"1,0,0").unwrap();
        let out = rc.submit_probe(b"0,0,1", &day()).unwrap();
        assert!(matches!(
            out,
            Recognition::NoMatch(NoMatchReason::AboveThreshold { .. })
        ));
        assert!(rc.get_day(&day()).unwrap().is_empty());
    }

    #[test]
    fn test_unenroll_stops_matching() {
        let rc = rollcall();
        rc.enroll(&key("S001"), b"1,0,0").unwrap();
        assert!(rc.match_embedding(&[1.0, 0.0, 0.0]).unwrap().is_match());
        rc.unenroll(&key("S001")).unwrap();
        assert!(!rc.match_embedding(&[1.0, 0.0, 0.0]).unwrap().is_match());
    }

    #[test]
    fn test_reset_day_and_days() {
        let rc = rollcall();
        rc.enroll(&key("S001"), b"1,0,0").unwrap();
        rc.recognize_embedding(&[1.0, 0.0, 0.0], &day()).unwrap();
        assert_eq!(rc.days().unwrap(), vec![day()]);
        assert_eq!(rc.reset_day(&day()).unwrap(), 1);
        assert!(rc.get_day(&day()).unwrap().is_empty());
        assert!(rc.days().unwrap().is_empty());
    }

    #[test]
    fn test_recognition_serializes() {
        let rc = rollcall();
        rc.enroll(&key("S001"), b"1,0,0").unwrap();
        let out = rc
            .recognize_embedding_at(&[1.0, 0.0, 0.0], &day(), "2024-01-01T08:00:00Z")
            .unwrap();
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["status"], "marked");
        assert_eq!(json["identity"], "S001");
        assert_eq!(json["name"], "Alice");
        assert_eq!(json["record"]["timestamp"], "2024-01-01T08:00:00Z");
    }
}
