use serde::Serialize;

use crate::constants::{DEFAULT_DIMENSION, DEFAULT_THRESHOLD, TIE_EPSILON};
use crate::embedding::{Enrollment, euclidean_distance, validate_embedding};
use crate::error::Result;
use crate::identity::IdentityKey;
use crate::store::EmbeddingStore;

/// Controls the acceptance decision.
#[derive(Clone, Debug, PartialEq)]
pub struct MatcherConfig {
    /// Probe and enrolled embedding length (128 for the reference extractor).
    pub dimension: usize,

    /// Largest Euclidean distance still accepted. A distance equal to the
    /// threshold is a match.
    pub threshold: f32,

    /// Required gap between the best and the runner-up identity.
    /// 0 disables the ambiguity check.
    pub min_margin: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_DIMENSION,
            threshold: DEFAULT_THRESHOLD,
            min_margin: 0.0,
        }
    }
}

/// An accepted match. Lower distance means higher confidence.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Match {
    pub identity: IdentityKey,
    pub distance: f32,
}

/// Why a probe was not accepted. None of these are errors.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NoMatchReason {
    /// Nobody is enrolled.
    Empty,
    /// The nearest enrollment is farther than the threshold.
    AboveThreshold { distance: f32 },
    /// The runner-up is within `min_margin` of the best candidate.
    Ambiguous { distance: f32, runner_up: f32 },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched(Match),
    NoMatch(NoMatchReason),
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Matched(_))
    }
}

/// Brute-force nearest-neighbor matcher over an [`EmbeddingStore`] snapshot.
///
/// Linear in the enrolled set, sized for a classroom. An approximate index
/// would plug in behind [`Matcher::find`] if populations grow.
#[derive(Clone, Debug, Default)]
pub struct Matcher {
    cfg: MatcherConfig,
}

impl Matcher {
    pub fn new(cfg: MatcherConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.cfg
    }

    /// Matches `probe` against the store's current snapshot.
    ///
    /// Fails with a validation error before scanning if the probe is empty,
    /// has the wrong length, or holds non-finite values.
    pub fn find(&self, store: &dyn EmbeddingStore, probe: &[f32]) -> Result<MatchOutcome> {
        validate_embedding(probe, self.cfg.dimension)?;
        let enrolled = store.scan_all()?;
        Ok(self.decide(&enrolled, probe))
    }

    /// Decision over an explicit candidate set; `candidates` may be in any order.
    pub fn decide(&self, candidates: &[Enrollment], probe: &[f32]) -> MatchOutcome {
        let mut best: Option<(&IdentityKey, f32)> = None;
        let mut runner_up: Option<f32> = None;

        for e in candidates {
            if e.embedding.len() != probe.len() {
                tracing::warn!(
                    identity = %e.identity,
                    len = e.embedding.len(),
                    "skipping enrollment with foreign dimension"
                );
                continue;
            }
            let d = euclidean_distance(probe, &e.embedding);
            match best {
                None => best = Some((&e.identity, d)),
                Some((best_id, best_d)) => {
                    let closer = d < best_d - TIE_EPSILON;
                    let tied_lower_key = (d - best_d).abs() <= TIE_EPSILON && e.identity < *best_id;
                    if closer || tied_lower_key {
                        runner_up = Some(runner_up.map_or(best_d, |r| r.min(best_d)));
                        best = Some((&e.identity, d));
                    } else {
                        runner_up = Some(runner_up.map_or(d, |r| r.min(d)));
                    }
                }
            }
        }

        let Some((identity, distance)) = best else {
            return MatchOutcome::NoMatch(NoMatchReason::Empty);
        };
        if distance > self.cfg.threshold {
            return MatchOutcome::NoMatch(NoMatchReason::AboveThreshold { distance });
        }
        if self.cfg.min_margin > 0.0
            && let Some(runner_up) = runner_up
            && runner_up - distance < self.cfg.min_margin
        {
            return MatchOutcome::NoMatch(NoMatchReason::Ambiguous {
                distance,
                runner_up,
            });
        }
        MatchOutcome::Matched(Match {
            identity: identity.clone(),
            distance,
        })
    }
}
