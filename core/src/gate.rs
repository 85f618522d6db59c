//! Image gates.
//!
//! ```text
//!             ┌──────────────────────────────┐
//!   bytes ───►│ AdvisoryGate  (client side)  │──► LikelySafe / LikelyUnsafe / Unavailable
//!             │  load budget, 1 pass,        │        (Unavailable ⇒ let it through)
//!             │  coarse thresholds           │
//!             └──────────────────────────────┘
//!             ┌──────────────────────────────┐
//!  handle ───►│ AuthoritativeGate (server)   │──► Verdict (fail-closed by default)
//!             │  storage → decode → N passes │
//!             │  → PolicyEngine              │
//!             └──────────────────────────────┘
//! ```
//!
//! Both share one [`LazyClassifier`]. Only the authoritative verdict gates
//! persistence; the advisory result is a UX hint.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::aggregate::{AggregateScore, ScoreAggregator};
use crate::classifier::{Label, LazyClassifier, PixelBuffer};
use crate::config::ModerationConfig;
use crate::decode::{decoder_for, PixelDecoder};
use crate::error::{ModerationError, Result};
use crate::policy::{PolicyEngine, Verdict, VerdictReason};
use crate::stats::ModerationStats;
use crate::storage::{ArtifactHandle, ArtifactStorage};

/// `Porn` probability at or above which the advisory gate warns.
pub const ADVISORY_PORN_LIMIT: f64 = 0.6;
/// `Hentai` probability at or above which the advisory gate warns.
pub const ADVISORY_HENTAI_LIMIT: f64 = 0.6;
/// `Sexy` probability at or above which the advisory gate warns.
pub const ADVISORY_SEXY_LIMIT: f64 = 0.8;

/// User-facing text shown when the advisory check could not run.
pub const MESSAGE_UNAVAILABLE: &str = "temporarily unavailable, try again";

/// How far a gate's verdict can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    /// Runs where the user controls execution; a hint only.
    Advisory,
    /// Runs server side; its verdict decides persistence.
    Authoritative,
}

/// Common shape of both gates, so one property suite covers them.
#[async_trait]
pub trait SafetyGate: Send + Sync {
    /// Where this gate sits.
    fn trust_level(&self) -> TrustLevel;

    /// Moderates encoded image bytes.
    async fn evaluate(&self, image: Bytes) -> Verdict;
}

/// Decodes `bytes` on the blocking pool.
async fn decode_blocking(decoder: &Arc<dyn PixelDecoder>, bytes: Bytes) -> Result<PixelBuffer> {
    let decoder = Arc::clone(decoder);
    tokio::task::spawn_blocking(move || decoder.decode(&bytes))
        .await
        .map_err(|e| ModerationError::DecodeFailure(format!("decode task failed: {e}")))?
}

// ---------------------------------------------------------------------------
// Authoritative gate
// ---------------------------------------------------------------------------

/// Server-side gate. Its verdict is the only one that decides persistence.
pub struct AuthoritativeGate {
    policy: PolicyEngine,
    classifier: Arc<LazyClassifier>,
    decoder: Arc<dyn PixelDecoder>,
    aggregator: ScoreAggregator,
    storage: Arc<dyn ArtifactStorage>,
    stats: Arc<ModerationStats>,
    load_timeout: Duration,
}

impl std::fmt::Debug for AuthoritativeGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthoritativeGate")
            .field("policy", &self.policy)
            .field("decoder", &self.decoder.name())
            .field("aggregator", &self.aggregator)
            .field("load_timeout", &self.load_timeout)
            .finish_non_exhaustive()
    }
}

impl AuthoritativeGate {
    /// Builds the gate from a validated configuration.
    #[must_use]
    pub fn new(
        config: &ModerationConfig,
        classifier: Arc<LazyClassifier>,
        storage: Arc<dyn ArtifactStorage>,
    ) -> Self {
        Self {
            policy: PolicyEngine::new(config.policy.clone()),
            classifier,
            decoder: decoder_for(config),
            aggregator: ScoreAggregator::from_config(config),
            storage,
            stats: Arc::new(ModerationStats::new()),
            load_timeout: config.model_load_timeout(),
        }
    }

    /// Records into `stats` instead of a private counter set.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<ModerationStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Replaces the configured decoder.
    #[must_use]
    pub fn with_decoder(mut self, decoder: Arc<dyn PixelDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Counters this gate records into.
    #[must_use]
    pub fn stats(&self) -> &Arc<ModerationStats> {
        &self.stats
    }

    /// Storage the gate reads artifacts from.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn ArtifactStorage> {
        &self.storage
    }

    /// Moderates a stored artifact.
    ///
    /// Never fails: storage, decode and classifier errors become a
    /// fail-open or fail-closed verdict according to the policy.
    pub async fn moderate_image(&self, handle: &ArtifactHandle) -> Verdict {
        if self.policy.config().disabled {
            return self.finish(Verdict::allow());
        }

        let started = Instant::now();
        let scored = match self.storage.get(handle).await {
            Ok(bytes) => self.score(bytes).await,
            Err(err) => Err(err.into()),
        };
        self.conclude(scored, started, Some(handle))
    }

    async fn score(&self, bytes: Bytes) -> Result<AggregateScore> {
        // 1) model (joins the in-flight load if there is one, bounded)
        let classifier = tokio::time::timeout(self.load_timeout, self.classifier.get())
            .await
            .map_err(|_| {
                ModerationError::ClassifierUnavailable(format!(
                    "model not loaded after {:?}",
                    self.load_timeout
                ))
            })??;
        // 2) decode off the async workers
        let image = decode_blocking(&self.decoder, bytes).await?;
        // 3) N passes, averaged
        self.aggregator.aggregate(classifier.as_ref(), image).await
    }

    fn conclude(
        &self,
        scored: Result<AggregateScore>,
        started: Instant,
        handle: Option<&ArtifactHandle>,
    ) -> Verdict {
        let handle = handle.map_or_else(String::new, ToString::to_string);
        let verdict = match scored {
            Ok(score) => {
                self.stats.record_latency(started.elapsed());
                let verdict = self.policy.decide(&score);
                if self.policy.config().log_scores {
                    info!(
                        %handle,
                        %score,
                        reason = %verdict.reason,
                        allowed = verdict.allowed,
                        strict = self.policy.config().strict_mode,
                        "image moderated"
                    );
                }
                verdict
            }
            Err(err) => {
                self.stats.record_classifier_error();
                let verdict = Verdict::classifier_error(self.policy.config().fail_open);
                warn!(%handle, error = %err, reason = %verdict.reason, "image moderation failed");
                verdict
            }
        };
        self.finish(verdict)
    }

    fn finish(&self, verdict: Verdict) -> Verdict {
        self.stats.record_verdict(&verdict);
        verdict
    }
}

#[async_trait]
impl SafetyGate for AuthoritativeGate {
    fn trust_level(&self) -> TrustLevel {
        TrustLevel::Authoritative
    }

    async fn evaluate(&self, image: Bytes) -> Verdict {
        if self.policy.config().disabled {
            return self.finish(Verdict::allow());
        }
        let started = Instant::now();
        let scored = self.score(image).await;
        self.conclude(scored, started, None)
    }
}

// ---------------------------------------------------------------------------
// Advisory gate
// ---------------------------------------------------------------------------

/// Coarse result of an advisory check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvisoryOutcome {
    /// Below every advisory threshold.
    LikelySafe,
    /// At or above an advisory threshold; the client should warn.
    LikelyUnsafe,
    /// The check could not run (model loading, unreadable file, …).
    Unavailable,
}

impl AdvisoryOutcome {
    /// Whether the client should let the upload proceed.
    #[must_use]
    pub const fn allows_upload(&self) -> bool {
        !matches!(self, Self::LikelyUnsafe)
    }

    /// Text to show the user, if any.
    #[must_use]
    pub const fn user_message(&self) -> Option<&'static str> {
        match self {
            Self::LikelySafe => None,
            Self::LikelyUnsafe => Some(crate::orchestrator::MESSAGE_IMAGE_POLICY),
            Self::Unavailable => Some(MESSAGE_UNAVAILABLE),
        }
    }
}

/// Client-side pre-check. Always fails open.
pub struct AdvisoryGate {
    classifier: Arc<LazyClassifier>,
    decoder: Arc<dyn PixelDecoder>,
    aggregator: ScoreAggregator,
    load_budget: Duration,
}

impl std::fmt::Debug for AdvisoryGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisoryGate")
            .field("decoder", &self.decoder.name())
            .field("load_budget", &self.load_budget)
            .finish_non_exhaustive()
    }
}

impl AdvisoryGate {
    /// Builds the gate. Uses a single identity pass whatever `config.augment` says.
    #[must_use]
    pub fn new(config: &ModerationConfig, classifier: Arc<LazyClassifier>) -> Self {
        Self {
            classifier,
            decoder: decoder_for(config),
            aggregator: ScoreAggregator::single_pass(config.inference_timeout()),
            load_budget: config.advisory_load_budget(),
        }
    }

    /// Runs the coarse check on encoded image bytes.
    pub async fn assess(&self, image: Bytes) -> AdvisoryOutcome {
        let verdict = self.advise(image).await;
        if verdict.reason.is_error() {
            AdvisoryOutcome::Unavailable
        } else if verdict.allowed {
            AdvisoryOutcome::LikelySafe
        } else {
            AdvisoryOutcome::LikelyUnsafe
        }
    }

    /// Reads `path` and reports whether it is likely safe.
    ///
    /// Any failure, including an unreadable file, reports `true`.
    pub async fn precheck(&self, path: &Path) -> bool {
        match tokio::fs::read(path).await {
            Ok(bytes) => self.assess(Bytes::from(bytes)).await.allows_upload(),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "advisory precheck could not read file");
                true
            }
        }
    }

    async fn advise(&self, image: Bytes) -> Verdict {
        match self.score(image).await {
            Ok(score) => coarse_verdict(score),
            Err(err) => {
                debug!(error = %err, "advisory check unavailable");
                Verdict::classifier_error(true)
            }
        }
    }

    async fn score(&self, image: Bytes) -> Result<AggregateScore> {
        let classifier = tokio::time::timeout(self.load_budget, self.classifier.get())
            .await
            .map_err(|_| ModerationError::ClassifierUnavailable("model still loading".into()))??;
        let pixels = decode_blocking(&self.decoder, image).await?;
        self.aggregator.aggregate(classifier.as_ref(), pixels).await
    }
}

fn coarse_verdict(score: AggregateScore) -> Verdict {
    let reason = if score.get(Label::Porn) >= ADVISORY_PORN_LIMIT
        || score.get(Label::Hentai) >= ADVISORY_HENTAI_LIMIT
    {
        VerdictReason::BlockedCore
    } else if score.get(Label::Sexy) >= ADVISORY_SEXY_LIMIT {
        VerdictReason::BlockedSexy
    } else {
        VerdictReason::Ok
    };
    Verdict {
        allowed: reason == VerdictReason::Ok,
        reason,
        scores: Some(score),
    }
}

#[async_trait]
impl SafetyGate for AdvisoryGate {
    fn trust_level(&self) -> TrustLevel {
        TrustLevel::Advisory
    }

    async fn evaluate(&self, image: Bytes) -> Verdict {
        self.advise(image).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use crate::storage::MemoryArtifactStorage;
    use crate::test_support::{
        png_bytes, ready, FailingClassifier, FixedClassifier, HangingLoader, ScriptedLoader,
    };

    fn memory() -> Arc<dyn ArtifactStorage> {
        Arc::new(MemoryArtifactStorage::new())
    }

    fn both_gates(
        config: &ModerationConfig,
        classifier: Arc<dyn Classifier>,
    ) -> Vec<Box<dyn SafetyGate>> {
        let lazy = ready(classifier);
        vec![
            Box::new(AuthoritativeGate::new(config, Arc::clone(&lazy), memory())),
            Box::new(AdvisoryGate::new(config, lazy)),
        ]
    }

    fn image() -> Bytes {
        png_bytes(8, 8, [120, 90, 60])
    }

    #[tokio::test]
    async fn neutral_image_passes_both_gates() {
        let gates = both_gates(
            &ModerationConfig::default(),
            Arc::new(FixedClassifier::neutral()),
        );
        for gate in &gates {
            let verdict = gate.evaluate(image()).await;
            assert!(verdict.allowed, "{:?}", gate.trust_level());
            assert_eq!(verdict.reason, VerdictReason::Ok);
            assert!(verdict.scores.is_some());
        }
    }

    #[tokio::test]
    async fn explicit_image_is_blocked_by_both_gates() {
        let gates = both_gates(
            &ModerationConfig::default(),
            Arc::new(FixedClassifier::explicit()),
        );
        for gate in &gates {
            let verdict = gate.evaluate(image()).await;
            assert!(!verdict.allowed, "{:?}", gate.trust_level());
            assert_eq!(verdict.reason, VerdictReason::BlockedCore);
        }
    }

    #[tokio::test]
    async fn classifier_failure_fails_closed_server_side_and_open_client_side() {
        let gates = both_gates(
            &ModerationConfig::default(),
            Arc::new(FailingClassifier::default()),
        );
        for gate in &gates {
            let verdict = gate.evaluate(image()).await;
            assert!(verdict.reason.is_error());
            match gate.trust_level() {
                TrustLevel::Authoritative => {
                    assert!(!verdict.allowed);
                    assert_eq!(verdict.reason, VerdictReason::ErrorFailClosed);
                }
                TrustLevel::Advisory => {
                    assert!(verdict.allowed);
                    assert_eq!(verdict.reason, VerdictReason::ErrorFailOpen);
                }
            }
        }
    }

    #[tokio::test]
    async fn fail_open_config_lets_errors_through() {
        let mut config = ModerationConfig::default();
        config.policy.fail_open = true;
        let gate = AuthoritativeGate::new(
            &config,
            ready(Arc::new(FailingClassifier::default())),
            memory(),
        );

        let verdict = gate.evaluate(image()).await;
        assert!(verdict.allowed);
        assert_eq!(verdict.reason, VerdictReason::ErrorFailOpen);
        assert_eq!(gate.stats().snapshot().classifier_errors, 1);
    }

    #[tokio::test]
    async fn undecodable_bytes_are_an_error_verdict() {
        let classifier = Arc::new(FixedClassifier::neutral());
        let gates = both_gates(&ModerationConfig::default(), classifier.clone());
        for gate in &gates {
            let verdict = gate.evaluate(Bytes::from_static(b"GIF89a-but-not-really")).await;
            assert!(verdict.reason.is_error(), "{:?}", gate.trust_level());
        }
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn disabled_moderation_never_touches_the_classifier() {
        let mut config = ModerationConfig::default();
        config.policy.disabled = true;
        let loader = Arc::new(ScriptedLoader::always_failing());
        let lazy = Arc::new(LazyClassifier::new(loader.clone()));
        let storage = Arc::new(MemoryArtifactStorage::new());
        let gate = AuthoritativeGate::new(&config, lazy, storage.clone());

        let ghost = ArtifactHandle::parse("missing.png").expect("handle");
        let verdict = gate.moderate_image(&ghost).await;
        assert_eq!(verdict, Verdict::allow());

        let verdict = gate.evaluate(Bytes::from_static(b"garbage")).await;
        assert!(verdict.allowed);
        assert_eq!(loader.loads(), 0);
        assert!(storage.ops().is_empty());
    }

    #[tokio::test]
    async fn moderate_image_reads_from_storage() {
        let storage = Arc::new(MemoryArtifactStorage::new());
        let handle = storage.put(image(), Some("png")).await.expect("put");
        let classifier = Arc::new(FixedClassifier::neutral());
        let gate = AuthoritativeGate::new(
            &ModerationConfig::default(),
            ready(classifier.clone()),
            storage,
        );

        let verdict = gate.moderate_image(&handle).await;
        assert!(verdict.allowed);
        // identity + mirror
        assert_eq!(classifier.calls(), 2);
        assert_eq!(verdict.scores.map(|s| s.passes()), Some(2));
        assert_eq!(gate.stats().snapshot().verdicts.ok, 1);
    }

    #[tokio::test]
    async fn missing_artifact_fails_closed() {
        let gate = AuthoritativeGate::new(
            &ModerationConfig::default(),
            ready(Arc::new(FixedClassifier::neutral())),
            memory(),
        );
        let ghost = ArtifactHandle::parse("ghost.png").expect("handle");
        let verdict = gate.moderate_image(&ghost).await;
        assert_eq!(verdict.reason, VerdictReason::ErrorFailClosed);
    }

    #[tokio::test]
    async fn inference_timeout_is_a_failure_verdict() {
        let mut config = ModerationConfig::default();
        config.inference_timeout_ms = 20;
        let slow = FixedClassifier::neutral().with_delay(Duration::from_millis(500));
        let gate = AuthoritativeGate::new(&config, ready(Arc::new(slow)), memory());

        let verdict = gate.evaluate(image()).await;
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, VerdictReason::ErrorFailClosed);
    }

    #[tokio::test]
    async fn failed_model_load_fails_closed() {
        let lazy = Arc::new(LazyClassifier::new(Arc::new(
            ScriptedLoader::always_failing(),
        )));
        let gate = AuthoritativeGate::new(&ModerationConfig::default(), lazy, memory());
        let verdict = gate.evaluate(image()).await;
        assert_eq!(verdict.reason, VerdictReason::ErrorFailClosed);
    }

    #[tokio::test]
    async fn stalled_model_load_fails_closed_within_the_load_timeout() {
        let mut config = ModerationConfig::default();
        config.model_load_timeout_ms = 50;
        config.inference_timeout_ms = 50;
        let lazy = Arc::new(LazyClassifier::new(Arc::new(HangingLoader)));
        let gate = AuthoritativeGate::new(&config, lazy, memory());

        let verdict = tokio::time::timeout(Duration::from_secs(2), gate.evaluate(image()))
            .await
            .expect("verdict arrives despite a stalled load");
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, VerdictReason::ErrorFailClosed);
        assert_eq!(gate.stats().snapshot().classifier_errors, 1);
    }

    #[tokio::test]
    async fn stalled_model_load_honours_fail_open() {
        let mut config = ModerationConfig::default();
        config.model_load_timeout_ms = 50;
        config.policy.fail_open = true;
        let lazy = Arc::new(LazyClassifier::new(Arc::new(HangingLoader)));
        let gate = AuthoritativeGate::new(&config, lazy, memory());

        let verdict = tokio::time::timeout(Duration::from_secs(2), gate.evaluate(image()))
            .await
            .expect("verdict");
        assert!(verdict.allowed);
        assert_eq!(verdict.reason, VerdictReason::ErrorFailOpen);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_evaluations_do_not_serialise() {
        const CALLS: u32 = 8;
        const DELAY: Duration = Duration::from_millis(100);

        let mut config = ModerationConfig::default();
        config.augment = false;
        let classifier = Arc::new(FixedClassifier::neutral().with_delay(DELAY));
        let gate = Arc::new(AuthoritativeGate::new(
            &config,
            ready(classifier.clone()),
            memory(),
        ));

        let started = Instant::now();
        let calls = (0..CALLS).map(|_| {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.evaluate(image()).await })
        });
        let verdicts = futures::future::join_all(calls).await;
        let elapsed = started.elapsed();

        for verdict in verdicts {
            assert!(verdict.expect("task").allowed);
        }
        assert_eq!(classifier.calls(), CALLS as usize);
        // Serialised calls would need CALLS * DELAY.
        assert!(elapsed < DELAY * (CALLS / 2), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn advisory_gate_gives_up_on_a_slow_load() {
        let mut config = ModerationConfig::default();
        config.advisory_load_budget_ms = 30;
        let lazy = Arc::new(LazyClassifier::new(Arc::new(ScriptedLoader::succeeding(
            Duration::from_secs(5),
        ))));
        let gate = AdvisoryGate::new(&config, lazy);

        let outcome = gate.assess(image()).await;
        assert_eq!(outcome, AdvisoryOutcome::Unavailable);
        assert!(outcome.allows_upload());
        assert_eq!(outcome.user_message(), Some(MESSAGE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn advisory_thresholds_are_coarse() {
        let config = ModerationConfig::default();
        // Sexy 0.75: below the advisory limit, although not SFW-dominated
        let borderline = FixedClassifier::new([0.1, 0.05, 0.75, 0.05, 0.05]);
        let gate = AdvisoryGate::new(&config, ready(Arc::new(borderline)));
        assert_eq!(gate.assess(image()).await, AdvisoryOutcome::LikelySafe);

        let sexy = FixedClassifier::new([0.05, 0.05, 0.85, 0.03, 0.02]);
        let gate = AdvisoryGate::new(&config, ready(Arc::new(sexy)));
        let outcome = gate.assess(image()).await;
        assert_eq!(outcome, AdvisoryOutcome::LikelyUnsafe);
        assert!(!outcome.allows_upload());
    }

    #[tokio::test]
    async fn advisory_gate_uses_a_single_pass() {
        let classifier = Arc::new(FixedClassifier::neutral());
        let gate = AdvisoryGate::new(&ModerationConfig::default(), ready(classifier.clone()));
        gate.assess(image()).await;
        assert_eq!(classifier.calls(), 1);
    }

    #[tokio::test]
    async fn precheck_reads_files_and_fails_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("upload.png");
        tokio::fs::write(&path, image()).await.expect("write");

        let explicit = AdvisoryGate::new(
            &ModerationConfig::default(),
            ready(Arc::new(FixedClassifier::explicit())),
        );
        assert!(!explicit.precheck(&path).await);
        assert!(explicit.precheck(&dir.path().join("missing.png")).await);
    }
}
