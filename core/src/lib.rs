//! discover-moderation: content-safety admission pipeline for the city feed.
//!
//! Every post or clip a user submits passes through this crate before it is
//! persisted. Text is checked against a keyword denylist, images are scored
//! by a pluggable image classifier and run through a configurable policy, and
//! uploaded media are only committed once both gates agree.
//!
//! # Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  ModerationPipeline                      │
//! │ ┌──────────────────────────────────────────────────────┐ │
//! │ │ UploadOrchestrator   validate → store → gates → commit│ │
//! │ └──────────────────────────────────────────────────────┘ │
//! │ ┌──────────────┐ ┌────────────────────┐ ┌─────────────┐ │
//! │ │  TextGate    │ │ AuthoritativeGate  │ │ AdvisoryGate│ │
//! │ │  denylist    │ │ decode → passes →  │ │ 1 pass,     │ │
//! │ │              │ │ PolicyEngine       │ │ fail-open   │ │
//! │ └──────────────┘ └─────────┬──────────┘ └──────┬──────┘ │
//! │                  ┌─────────▼───────────────────▼──────┐ │
//! │                  │ LazyClassifier (one shared load)   │ │
//! │                  └────────────────────────────────────┘ │
//! │ ┌──────────────────┐ ┌───────────────┐ ┌──────────────┐ │
//! │ │ ArtifactStorage  │ │ PostRepository│ │ OrphanSweeper│ │
//! │ └──────────────────┘ └───────────────┘ └──────────────┘ │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A process builds one [`ModerationPipeline`] at startup with
//! [`ModerationPipeline::bootstrap`] and routes submissions through
//! [`ModerationPipeline::orchestrator`].

#![deny(missing_docs)]
#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

/// Error taxonomy and result alias.
pub mod error;
/// Configuration: environment, YAML, defaults, validation.
pub mod config;
/// Classifier capability, labels, pixel buffers and the lazy shared load.
pub mod classifier;
/// Image decoding into pixel buffers.
pub mod decode;
/// Test-time augmentation and score averaging.
pub mod aggregate;
/// Policy decision over aggregate scores.
pub mod policy;
/// Keyword denylist over post text.
pub mod text;
/// Artifact storage backends.
pub mod storage;
/// Provisional artifact guard.
pub mod artifact;
/// Authoritative and advisory image gates.
pub mod gate;
/// Post and clip records and the persistence seam.
pub mod post;
/// Submission orchestration.
pub mod orchestrator;
/// Sweeper for orphaned provisional artifacts.
pub mod reconcile;
/// Moderation counters.
pub mod stats;

#[cfg(test)]
mod test_support;

pub use crate::aggregate::{AggregateScore, Augmentation, ScoreAggregator};
pub use crate::artifact::{ArtifactState, ProvisionalArtifact};
pub use crate::classifier::{
    ClassificationResult, Classifier, ClassifierLoader, Label, LazyClassifier, PixelBuffer,
};
pub use crate::config::{DecoderKind, ModerationConfig, PolicyConfig, UploadLimits};
pub use crate::decode::{decoder_for, NativeDecoder, PixelDecoder, ThumbnailDecoder};
pub use crate::error::{ModerationError, Result, StorageError};
pub use crate::gate::{AdvisoryGate, AdvisoryOutcome, AuthoritativeGate, SafetyGate, TrustLevel};
pub use crate::orchestrator::{ClipOutcome, Outcome, Rejection, SubmitOutcome, Upload, UploadOrchestrator};
pub use crate::policy::{PolicyEngine, Verdict, VerdictReason};
pub use crate::post::{
    Category, Clip, ClipDraft, Coordinates, MemoryPostRepository, NewClip, NewPost, Post,
    PostDraft, PostKind, PostRepository,
};
pub use crate::reconcile::OrphanSweeper;
pub use crate::stats::{ModerationSnapshot, ModerationStats};
pub use crate::storage::{
    ArtifactHandle, ArtifactStorage, FsArtifactStorage, MemoryArtifactStorage, StorageOp,
};
pub use crate::text::{PostText, TextGate};

/// Everything a server needs to moderate submissions, wired from one config.
pub struct ModerationPipeline {
    /// Validated configuration snapshot.
    pub config: Arc<ModerationConfig>,
    /// Shared, lazily loaded classifier.
    pub classifier: Arc<LazyClassifier>,
    /// Server-side image gate.
    pub image_gate: Arc<AuthoritativeGate>,
    /// Client-side pre-check, sharing the same classifier.
    pub advisory_gate: AdvisoryGate,
    /// Submission entry point.
    pub orchestrator: UploadOrchestrator,
    /// Counters shared by the gates and the orchestrator.
    pub stats: Arc<ModerationStats>,
    storage: Arc<dyn ArtifactStorage>,
}

impl std::fmt::Debug for ModerationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModerationPipeline")
            .field("config", &self.config)
            .field("classifier", &self.classifier)
            .finish_non_exhaustive()
    }
}

impl ModerationPipeline {
    /// Validates `config`, wires all components and starts loading the
    /// classifier in the background (unless moderation is disabled).
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`ModerationError::PolicyMisconfigured`] for an invalid configuration.
    pub fn bootstrap(
        config: ModerationConfig,
        loader: Arc<dyn ClassifierLoader>,
        storage: Arc<dyn ArtifactStorage>,
        repository: Arc<dyn PostRepository>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let stats = Arc::new(ModerationStats::new());
        let classifier = Arc::new(LazyClassifier::new(loader));

        let image_gate = Arc::new(
            AuthoritativeGate::new(&config, Arc::clone(&classifier), Arc::clone(&storage))
                .with_stats(Arc::clone(&stats)),
        );
        let advisory_gate = AdvisoryGate::new(&config, Arc::clone(&classifier));
        let orchestrator = UploadOrchestrator::new(&config, Arc::clone(&image_gate), repository)?;

        if config.policy.disabled {
            info!("image moderation disabled, classifier will not be loaded");
        } else {
            classifier.warm_up();
        }

        info!(
            decoder = ?config.decoder,
            augment = config.augment,
            strict = config.policy.strict_mode,
            fail_open = config.policy.fail_open,
            "moderation pipeline ready"
        );

        Ok(Self {
            config,
            classifier,
            image_gate,
            advisory_gate,
            orchestrator,
            stats,
            storage,
        })
    }

    /// Starts the orphan sweeper with the configured TTL.
    #[must_use]
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        OrphanSweeper::new(Arc::clone(&self.storage), self.config.provisional_ttl())
            .spawn(interval)
    }

    /// Storage backend shared by the pipeline.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn ArtifactStorage> {
        &self.storage
    }
}
