//! Upload orchestrator: the only path by which media reach a persisted post.
//!
//! ```text
//!  submit(upload?, draft)
//!    0) validate request ─────────────────────────────► Rejected (nothing stored)
//!    1) store artifact (provisional)
//!    2) text gate ──────── unsafe ──► purge ──────────► Rejected(TextPolicyViolation)
//!    3) image gate ─────── blocked ─► purge ──────────► Rejected(ImagePolicyViolation)
//!    4) commit ──► create post ── error ─► delete ────► Err
//!                              └─ ok ─────────────────► Accepted(post)
//! ```
//!
//! Every exit path purges the artifact or leaves it referenced by a persisted
//! record before returning. If the `submit` future itself is dropped, including
//! between commit and persistence, the [`ProvisionalArtifact`] guard schedules
//! the purge.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::artifact::ProvisionalArtifact;
use crate::config::{ModerationConfig, UploadLimits};
use crate::error::Result;
use crate::gate::AuthoritativeGate;
use crate::policy::{Verdict, VerdictReason};
use crate::post::{Clip, ClipDraft, NewClip, NewPost, Post, PostDraft, PostRepository};
use crate::stats::ModerationStats;
use crate::storage::ArtifactStorage;
use crate::text::{PostText, TextGate};

/// Shown when the image gate blocks an upload.
pub const MESSAGE_IMAGE_POLICY: &str = "image violates policy";
/// Shown when the text gate blocks a submission.
pub const MESSAGE_CONTENT_POLICY: &str = "content violates policy";

/// Uploaded media as received from the client.
#[derive(Clone, PartialEq, Eq)]
pub struct Upload {
    bytes: Bytes,
    content_type: String,
    file_name: Option<String>,
}

impl fmt::Debug for Upload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upload")
            .field("size", &self.bytes.len())
            .field("content_type", &self.content_type)
            .field("file_name", &self.file_name)
            .finish()
    }
}

impl Upload {
    /// Wraps raw bytes with their declared content type.
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into().trim().to_ascii_lowercase(),
            file_name: None,
        }
    }

    /// Keeps the client's original file name (used for the extension).
    #[must_use]
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    /// Parses `data:image/<fmt>;base64,<payload>`, as sent by JSON clients.
    ///
    /// # Errors
    ///
    /// [`Rejection::UnsupportedMediaType`] for anything but a base64 image
    /// data URL, [`Rejection::MalformedUpload`] when the payload is not
    /// valid base64.
    pub fn from_data_url(raw: &str) -> std::result::Result<Self, Rejection> {
        let (content_type, payload) = raw
            .trim()
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(";base64,"))
            .ok_or(Rejection::UnsupportedMediaType)?;

        let valid_type = content_type
            .strip_prefix("image/")
            .is_some_and(|sub| {
                !sub.is_empty()
                    && sub
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'+' | b'-'))
            });
        if !valid_type || payload.is_empty() {
            return Err(Rejection::UnsupportedMediaType);
        }

        let bytes = STANDARD
            .decode(payload.trim())
            .map_err(|_| Rejection::MalformedUpload)?;
        Ok(Self::new(bytes, content_type))
    }

    /// Payload.
    #[must_use]
    pub const fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Declared content type, lowercased.
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// `true` for an empty payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Extension for the stored file: from the file name if it has one,
    /// otherwise from the content subtype (`image/svg+xml` → `svgxml`).
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        let from_name = self
            .file_name
            .as_deref()
            .and_then(|n| n.rsplit_once('.'))
            .map(|(_, ext)| ext);
        let from_type = self.content_type.split_once('/').map(|(_, sub)| sub);
        from_name
            .or(from_type)
            .map(|ext| ext.replace('+', ""))
            .filter(|ext| !ext.is_empty())
    }

    fn has_media_type(&self, top: &str) -> bool {
        self.content_type
            .split_once('/')
            .is_some_and(|(t, sub)| t == top && !sub.is_empty())
    }
}

/// Why a submission was turned down. Expected outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Title (or another required field) missing or blank.
    MissingRequiredFields,
    /// Content type not accepted for this kind of submission.
    UnsupportedMediaType,
    /// Upload larger than the configured limit.
    FileTooLarge {
        /// Upload size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
    /// Clip longer than the configured limit.
    VideoTooLong,
    /// Upload that could not be interpreted (bad base64, bad duration).
    MalformedUpload,
    /// Text gate matched a denylisted term.
    TextPolicyViolation,
    /// Authoritative image gate disallowed the image.
    ImagePolicyViolation(VerdictReason),
}

impl Rejection {
    /// Stable text for the client. Never carries scores or policy branches.
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::MissingRequiredFields => "missing required fields",
            Self::UnsupportedMediaType => "unsupported media type",
            Self::FileTooLarge { .. } => "file too large",
            Self::VideoTooLong => "video too long",
            Self::MalformedUpload => "invalid upload",
            Self::TextPolicyViolation => MESSAGE_CONTENT_POLICY,
            Self::ImagePolicyViolation(_) => MESSAGE_IMAGE_POLICY,
        }
    }

    const fn is_request_validation(&self) -> bool {
        !matches!(self, Self::TextPolicyViolation | Self::ImagePolicyViolation(_))
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.user_message())
    }
}

/// Result of a submission that did not fail with an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// Persisted.
    Accepted(T),
    /// Turned down; nothing was persisted.
    Rejected(Rejection),
}

impl<T> Outcome<T> {
    /// The rejection, if any.
    #[must_use]
    pub const fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Accepted(_) => None,
            Self::Rejected(r) => Some(r),
        }
    }

    /// `true` for [`Outcome::Accepted`].
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Outcome of [`UploadOrchestrator::submit`].
pub type SubmitOutcome = Outcome<Post>;
/// Outcome of [`UploadOrchestrator::submit_clip`].
pub type ClipOutcome = Outcome<Clip>;

/// Runs submissions through validation, both gates, and persistence.
pub struct UploadOrchestrator {
    text_gate: TextGate,
    image_gate: Arc<AuthoritativeGate>,
    storage: Arc<dyn ArtifactStorage>,
    repository: Arc<dyn PostRepository>,
    limits: UploadLimits,
    stats: Arc<ModerationStats>,
}

impl fmt::Debug for UploadOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOrchestrator")
            .field("image_gate", &self.image_gate)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl UploadOrchestrator {
    /// Wires the orchestrator. Storage and stats are shared with `image_gate`.
    ///
    /// # Errors
    ///
    /// [`crate::ModerationError::PolicyMisconfigured`] when the configured
    /// denylist extension is unusable.
    pub fn new(
        config: &ModerationConfig,
        image_gate: Arc<AuthoritativeGate>,
        repository: Arc<dyn PostRepository>,
    ) -> Result<Self> {
        Ok(Self {
            text_gate: TextGate::with_extra_terms(&config.text_denylist_extra)?,
            storage: Arc::clone(image_gate.storage()),
            stats: Arc::clone(image_gate.stats()),
            image_gate,
            repository,
            limits: config.limits.clone(),
        })
    }

    /// Counters shared with the image gate.
    #[must_use]
    pub const fn stats(&self) -> &Arc<ModerationStats> {
        &self.stats
    }

    /// Submits a post with an optional image.
    ///
    /// # Errors
    ///
    /// Storage failures and [`crate::ModerationError::Persistence`]. Policy
    /// and validation outcomes are [`Outcome::Rejected`], not errors.
    pub async fn submit(&self, upload: Option<Upload>, draft: PostDraft) -> Result<SubmitOutcome> {
        let result = self.run_post(upload, draft).await;
        self.record(&result);
        result
    }

    /// Submits a short video clip. Clips go through the text gate only.
    ///
    /// # Errors
    ///
    /// Storage failures and [`crate::ModerationError::Persistence`].
    pub async fn submit_clip(&self, upload: Upload, draft: ClipDraft) -> Result<ClipOutcome> {
        let result = self.run_clip(upload, draft).await;
        self.record(&result);
        result
    }

    async fn run_post(&self, upload: Option<Upload>, draft: PostDraft) -> Result<SubmitOutcome> {
        // 0) validate before anything touches storage
        if let Some(rejection) = self.validate_post(upload.as_ref(), &draft) {
            return Ok(Outcome::Rejected(rejection));
        }

        // 1) provisional artifact
        let mut artifact = match upload {
            Some(upload) => Some(self.store(upload).await?),
            None => None,
        };

        // 2) text
        let text = PostText {
            title: &draft.title,
            description: &draft.description,
            hashtags: &draft.hashtags,
        };
        if !self.text_gate.moderate_text(&text) {
            return Ok(self.reject_text(artifact).await);
        }

        // 3) image
        if let Some(stored) = &artifact {
            let verdict = self.image_gate.moderate_image(stored.handle()).await;
            if !verdict.allowed {
                return Ok(self.reject_image(artifact, verdict).await);
            }
        }

        // 4) commit, then persist
        let image = match artifact.as_mut() {
            Some(stored) => {
                stored.commit().await?;
                Some(stored.handle().clone())
            }
            None => None,
        };
        match self.repository.create_post(NewPost { draft, image }).await {
            Ok(post) => {
                if let Some(stored) = artifact.as_mut() {
                    stored.persisted();
                }
                info!(post = %post.id, kind = %post.kind, image = ?post.image_url, "post accepted");
                Ok(Outcome::Accepted(post))
            }
            Err(err) => {
                warn!(error = %err, "post persistence failed, deleting committed artifact");
                if let Some(stored) = artifact {
                    stored.purge().await;
                }
                Err(err)
            }
        }
    }

    async fn run_clip(&self, upload: Upload, draft: ClipDraft) -> Result<ClipOutcome> {
        if let Some(rejection) = self.validate_clip(&upload, &draft) {
            return Ok(Outcome::Rejected(rejection));
        }

        let mut artifact = self.store(upload).await?;

        let text = PostText {
            title: &draft.caption,
            ..PostText::default()
        };
        if !self.text_gate.moderate_text(&text) {
            return Ok(self.reject_text(Some(artifact)).await);
        }

        artifact.commit().await?;
        let video = artifact.handle().clone();
        match self.repository.create_clip(NewClip { draft, video }).await {
            Ok(clip) => {
                artifact.persisted();
                info!(clip = %clip.id, seconds = clip.duration_seconds, "clip accepted");
                Ok(Outcome::Accepted(clip))
            }
            Err(err) => {
                warn!(error = %err, "clip persistence failed, deleting committed artifact");
                artifact.purge().await;
                Err(err)
            }
        }
    }

    fn validate_post(&self, upload: Option<&Upload>, draft: &PostDraft) -> Option<Rejection> {
        if draft.title.trim().is_empty() {
            return Some(Rejection::MissingRequiredFields);
        }
        let upload = upload?;
        if !upload.has_media_type("image") {
            return Some(Rejection::UnsupportedMediaType);
        }
        check_size(upload, self.limits.max_image_bytes)
    }

    fn validate_clip(&self, upload: &Upload, draft: &ClipDraft) -> Option<Rejection> {
        let seconds = draft.duration_seconds;
        if !seconds.is_finite() || seconds < 0.0 {
            return Some(Rejection::MalformedUpload);
        }
        if seconds > self.limits.max_clip_seconds {
            return Some(Rejection::VideoTooLong);
        }
        if !upload.has_media_type("video") {
            return Some(Rejection::UnsupportedMediaType);
        }
        check_size(upload, self.limits.max_video_bytes)
    }

    async fn store(&self, upload: Upload) -> Result<ProvisionalArtifact> {
        let extension = upload.extension();
        let artifact =
            ProvisionalArtifact::store(Arc::clone(&self.storage), upload.bytes, extension.as_deref())
                .await?;
        debug!(handle = %artifact.handle(), "artifact stored provisionally");
        Ok(artifact)
    }

    async fn reject_text<T>(&self, artifact: Option<ProvisionalArtifact>) -> Outcome<T> {
        self.stats.record_verdict(&Verdict::blocked_text());
        if let Some(stored) = artifact {
            stored.purge().await;
        }
        info!(reason = %VerdictReason::BlockedText, "submission rejected");
        Outcome::Rejected(Rejection::TextPolicyViolation)
    }

    async fn reject_image<T>(
        &self,
        artifact: Option<ProvisionalArtifact>,
        verdict: Verdict,
    ) -> Outcome<T> {
        if let Some(stored) = artifact {
            stored.purge().await;
        }
        info!(reason = %verdict.reason, "submission rejected");
        Outcome::Rejected(Rejection::ImagePolicyViolation(verdict.reason))
    }

    fn record<T>(&self, result: &Result<Outcome<T>>) {
        match result {
            Ok(Outcome::Accepted(_)) => self.stats.record_accepted(),
            Ok(Outcome::Rejected(Rejection::TextPolicyViolation)) => {
                self.stats.record_rejected_text();
            }
            Ok(Outcome::Rejected(Rejection::ImagePolicyViolation(_))) => {
                self.stats.record_rejected_image();
            }
            Ok(Outcome::Rejected(r)) => {
                debug_assert!(r.is_request_validation());
                debug!(rejection = %r, "submission failed validation");
                self.stats.record_rejected_invalid();
            }
            Err(_) => self.stats.record_failed(),
        }
    }
}

fn check_size(upload: &Upload, limit: usize) -> Option<Rejection> {
    (upload.len() > limit).then_some(Rejection::FileTooLarge {
        size: upload.len(),
        limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classifier, LazyClassifier};
    use crate::error::ModerationError;
    use crate::post::{MemoryPostRepository, PostKind};
    use crate::storage::{MemoryArtifactStorage, StorageOp};
    use crate::test_support::{
        png_bytes, ready, FailingClassifier, FixedClassifier, ScriptedLoader,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    /// Repository whose writes never complete.
    struct StalledRepository;

    #[async_trait]
    impl PostRepository for StalledRepository {
        async fn create_post(&self, _new: NewPost) -> Result<Post> {
            std::future::pending::<Result<Post>>().await
        }

        async fn create_clip(&self, _new: NewClip) -> Result<Clip> {
            std::future::pending::<Result<Clip>>().await
        }
    }

    async fn wait_until_empty(storage: &MemoryArtifactStorage) {
        for _ in 0..50 {
            if storage.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    struct Harness {
        storage: Arc<MemoryArtifactStorage>,
        repo: Arc<MemoryPostRepository>,
        orchestrator: UploadOrchestrator,
    }

    fn harness_with(
        config: &ModerationConfig,
        classifier: Arc<LazyClassifier>,
        repo: MemoryPostRepository,
    ) -> Harness {
        let storage = Arc::new(MemoryArtifactStorage::new());
        let repo = Arc::new(repo);
        let gate = Arc::new(AuthoritativeGate::new(config, classifier, storage.clone()));
        let orchestrator =
            UploadOrchestrator::new(config, gate, repo.clone()).expect("orchestrator");
        Harness {
            storage,
            repo,
            orchestrator,
        }
    }

    fn harness(classifier: Arc<dyn Classifier>) -> Harness {
        harness_with(
            &ModerationConfig::default(),
            ready(classifier),
            MemoryPostRepository::new(),
        )
    }

    fn png() -> Upload {
        Upload::new(png_bytes(6, 6, [30, 140, 200]), "image/png")
    }

    fn draft(title: &str) -> PostDraft {
        PostDraft::new(title, PostKind::Discovery)
            .with_description("Hidden courtyard with murals")
            .with_location("Chisinau")
    }

    fn clip(seconds: f64) -> ClipDraft {
        ClipDraft {
            caption: "Sunset over the lake".into(),
            duration_seconds: seconds,
            location: "Chisinau".into(),
            coordinates: None,
        }
    }

    fn mp4() -> Upload {
        Upload::new(Bytes::from_static(b"\0\0\0\x18ftypmp42"), "video/mp4")
    }

    fn put_handle(ops: &[StorageOp]) -> crate::storage::ArtifactHandle {
        match ops.first() {
            Some(StorageOp::Put(h)) => h.clone(),
            other => panic!("expected put first, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn text_violation_purges_the_stored_image() {
        let classifier = Arc::new(FixedClassifier::neutral());
        let h = harness(classifier.clone());

        let outcome = h
            .orchestrator
            .submit(Some(png()), draft("Check out this xxx deal!!"))
            .await
            .expect("submit");

        assert_eq!(outcome, Outcome::Rejected(Rejection::TextPolicyViolation));
        let ops = h.storage.ops();
        let handle = put_handle(&ops);
        assert_eq!(ops, vec![StorageOp::Put(handle.clone()), StorageOp::Delete(handle)]);
        assert!(h.storage.is_empty());
        assert!(h.repo.posts().is_empty());
        // the image gate never ran
        assert_eq!(classifier.calls(), 0);
        assert_eq!(
            outcome.rejection().map(Rejection::user_message),
            Some("content violates policy")
        );
    }

    #[tokio::test]
    async fn blocked_image_is_purged() {
        let h = harness(Arc::new(FixedClassifier::explicit()));

        let outcome = h
            .orchestrator
            .submit(Some(png()), draft("Courtyard"))
            .await
            .expect("submit");

        assert_eq!(
            outcome,
            Outcome::Rejected(Rejection::ImagePolicyViolation(VerdictReason::BlockedCore))
        );
        let ops = h.storage.ops();
        let handle = put_handle(&ops);
        assert_eq!(
            ops,
            vec![
                StorageOp::Put(handle.clone()),
                StorageOp::Get(handle.clone()),
                StorageOp::Delete(handle),
            ]
        );
        assert!(h.repo.posts().is_empty());
        assert_eq!(
            outcome.rejection().map(Rejection::user_message),
            Some("image violates policy")
        );
    }

    #[tokio::test]
    async fn classifier_failure_rejects_by_default() {
        let h = harness(Arc::new(FailingClassifier::default()));

        let outcome = h
            .orchestrator
            .submit(Some(png()), draft("Courtyard"))
            .await
            .expect("submit");

        assert_eq!(
            outcome,
            Outcome::Rejected(Rejection::ImagePolicyViolation(
                VerdictReason::ErrorFailClosed
            ))
        );
        assert!(h.storage.is_empty());
    }

    #[tokio::test]
    async fn accepted_post_commits_its_image() {
        let h = harness(Arc::new(FixedClassifier::neutral()));

        let outcome = h
            .orchestrator
            .submit(Some(png()), draft("Courtyard"))
            .await
            .expect("submit");

        let post = match outcome {
            Outcome::Accepted(post) => post,
            other => panic!("expected acceptance, got {other:?}"),
        };
        let ops = h.storage.ops();
        let handle = put_handle(&ops);
        assert_eq!(
            ops,
            vec![
                StorageOp::Put(handle.clone()),
                StorageOp::Get(handle.clone()),
                StorageOp::Commit(handle.clone()),
            ]
        );
        assert_eq!(h.storage.is_committed(&handle), Some(true));
        assert_eq!(post.image_url, Some(handle.url()));
        assert!(handle.as_str().ends_with(".png"));
        assert_eq!(h.repo.posts(), vec![post]);
        assert_eq!(h.orchestrator.stats().snapshot().submissions.accepted, 1);
    }

    #[tokio::test]
    async fn text_only_post_skips_storage() {
        let classifier = Arc::new(FixedClassifier::neutral());
        let h = harness(classifier.clone());

        let outcome = h
            .orchestrator
            .submit(None, draft("Jazz night"))
            .await
            .expect("submit");

        assert!(outcome.is_accepted());
        assert!(h.storage.ops().is_empty());
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn persistence_failure_deletes_the_committed_artifact() {
        let h = harness_with(
            &ModerationConfig::default(),
            ready(Arc::new(FixedClassifier::neutral())),
            MemoryPostRepository::failing(),
        );

        let err = h
            .orchestrator
            .submit(Some(png()), draft("Courtyard"))
            .await
            .expect_err("repository is down");

        assert!(matches!(err, ModerationError::Persistence(_)));
        let ops = h.storage.ops();
        let handle = put_handle(&ops);
        assert_eq!(
            ops,
            vec![
                StorageOp::Put(handle.clone()),
                StorageOp::Get(handle.clone()),
                StorageOp::Commit(handle.clone()),
                StorageOp::Delete(handle),
            ]
        );
        assert!(h.storage.is_empty());
        assert_eq!(h.orchestrator.stats().snapshot().submissions.failed, 1);
    }

    #[tokio::test]
    async fn abandoned_submission_after_commit_deletes_the_artifact() {
        let config = ModerationConfig::default();
        let storage = Arc::new(MemoryArtifactStorage::new());
        let gate = Arc::new(AuthoritativeGate::new(
            &config,
            ready(Arc::new(FixedClassifier::neutral())),
            storage.clone(),
        ));
        let orchestrator =
            UploadOrchestrator::new(&config, gate, Arc::new(StalledRepository)).expect("orchestrator");

        let submitted = tokio::time::timeout(
            Duration::from_millis(200),
            orchestrator.submit(Some(png()), draft("Courtyard")),
        )
        .await;
        assert!(submitted.is_err(), "repository never answers");

        wait_until_empty(&storage).await;
        let ops = storage.ops();
        let handle = put_handle(&ops);
        assert_eq!(
            ops,
            vec![
                StorageOp::Put(handle.clone()),
                StorageOp::Get(handle.clone()),
                StorageOp::Commit(handle.clone()),
                StorageOp::Delete(handle),
            ]
        );
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn abandoned_clip_after_commit_deletes_the_video() {
        let config = ModerationConfig::default();
        let storage = Arc::new(MemoryArtifactStorage::new());
        let gate = Arc::new(AuthoritativeGate::new(
            &config,
            ready(Arc::new(FixedClassifier::neutral())),
            storage.clone(),
        ));
        let orchestrator =
            UploadOrchestrator::new(&config, gate, Arc::new(StalledRepository)).expect("orchestrator");

        let submitted =
            tokio::time::timeout(Duration::from_millis(200), orchestrator.submit_clip(mp4(), clip(12.0)))
                .await;
        assert!(submitted.is_err());

        wait_until_empty(&storage).await;
        assert!(storage.is_empty());
        assert!(matches!(storage.ops().last(), Some(StorageOp::Delete(_))));
    }

    #[tokio::test]
    async fn accepted_artifacts_outlive_the_submission() {
        let h = harness(Arc::new(FixedClassifier::neutral()));
        let outcome = h
            .orchestrator
            .submit(Some(png()), draft("Courtyard"))
            .await
            .expect("submit");
        assert!(outcome.is_accepted());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let handle = put_handle(&h.storage.ops());
        assert_eq!(h.storage.is_committed(&handle), Some(true));
        assert!(!h.storage.ops().iter().any(|op| matches!(op, StorageOp::Delete(_))));
    }

    #[tokio::test]
    async fn disabled_moderation_accepts_without_loading_the_model() {
        let mut config = ModerationConfig::default();
        config.policy.disabled = true;
        let loader = Arc::new(ScriptedLoader::always_failing());
        let h = harness_with(
            &config,
            Arc::new(LazyClassifier::new(loader.clone())),
            MemoryPostRepository::new(),
        );

        let outcome = h
            .orchestrator
            .submit(Some(png()), draft("Courtyard"))
            .await
            .expect("submit");

        assert!(outcome.is_accepted());
        assert_eq!(loader.loads(), 0);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_storage() {
        let h = harness(Arc::new(FixedClassifier::neutral()));
        let mut small = ModerationConfig::default();
        small.limits.max_image_bytes = 16;
        let tight = harness_with(
            &small,
            ready(Arc::new(FixedClassifier::neutral())),
            MemoryPostRepository::new(),
        );

        let cases = [
            (
                h.orchestrator.submit(Some(png()), draft("   ")).await,
                Rejection::MissingRequiredFields,
            ),
            (
                h.orchestrator
                    .submit(Some(Upload::new(Bytes::from_static(b"%PDF"), "application/pdf")), draft("Menu"))
                    .await,
                Rejection::UnsupportedMediaType,
            ),
        ];
        for (result, expected) in cases {
            assert_eq!(result.expect("submit"), Outcome::Rejected(expected));
        }
        assert!(h.storage.ops().is_empty());

        let outcome = tight
            .orchestrator
            .submit(Some(png()), draft("Courtyard"))
            .await
            .expect("submit");
        assert!(matches!(
            outcome.rejection(),
            Some(Rejection::FileTooLarge { limit: 16, .. })
        ));
        assert!(tight.storage.ops().is_empty());
        assert_eq!(
            outcome.rejection().map(Rejection::user_message),
            Some("file too large")
        );
    }

    #[tokio::test]
    async fn configured_extra_terms_reach_the_text_gate() {
        let mut config = ModerationConfig::default();
        config.text_denylist_extra = vec!["casino".into()];
        let h = harness_with(
            &config,
            ready(Arc::new(FixedClassifier::neutral())),
            MemoryPostRepository::new(),
        );
        let outcome = h
            .orchestrator
            .submit(None, draft("Casino night"))
            .await
            .expect("submit");
        assert_eq!(outcome, Outcome::Rejected(Rejection::TextPolicyViolation));
    }

    #[tokio::test]
    async fn clip_within_limit_is_committed() {
        let h = harness(Arc::new(FixedClassifier::neutral()));

        let outcome = h
            .orchestrator
            .submit_clip(mp4().with_file_name("sunset.MP4"), clip(30.5))
            .await
            .expect("submit");

        let saved = match outcome {
            Outcome::Accepted(saved) => saved,
            other => panic!("expected acceptance, got {other:?}"),
        };
        let ops = h.storage.ops();
        let handle = put_handle(&ops);
        assert_eq!(
            ops,
            vec![StorageOp::Put(handle.clone()), StorageOp::Commit(handle.clone())]
        );
        assert_eq!(saved.video_url, handle.url());
        assert!(handle.as_str().ends_with(".mp4"));
        assert_eq!(h.repo.clips().len(), 1);
    }

    #[tokio::test]
    async fn clip_limits_are_enforced() {
        let h = harness(Arc::new(FixedClassifier::neutral()));

        let too_long = h.orchestrator.submit_clip(mp4(), clip(31.0)).await;
        assert_eq!(too_long.expect("submit"), Outcome::Rejected(Rejection::VideoTooLong));

        let nonsense = h.orchestrator.submit_clip(mp4(), clip(f64::NAN)).await;
        assert_eq!(nonsense.expect("submit"), Outcome::Rejected(Rejection::MalformedUpload));

        let image = h.orchestrator.submit_clip(png(), clip(5.0)).await;
        assert_eq!(
            image.expect("submit"),
            Outcome::Rejected(Rejection::UnsupportedMediaType)
        );

        assert!(h.storage.ops().is_empty());
        assert_eq!(h.orchestrator.stats().snapshot().submissions.rejected_invalid, 3);
    }

    #[tokio::test]
    async fn clip_caption_goes_through_the_text_gate() {
        let h = harness(Arc::new(FixedClassifier::neutral()));
        let mut draft = clip(10.0);
        draft.caption = "nsfw stuff".into();

        let outcome = h.orchestrator.submit_clip(mp4(), draft).await.expect("submit");

        assert_eq!(outcome, Outcome::Rejected(Rejection::TextPolicyViolation));
        let ops = h.storage.ops();
        let handle = put_handle(&ops);
        assert_eq!(ops, vec![StorageOp::Put(handle.clone()), StorageOp::Delete(handle)]);
    }

    #[test]
    fn data_urls_are_decoded() {
        let upload = Upload::from_data_url("data:image/png;base64,aGVsbG8=").expect("data url");
        assert_eq!(upload.content_type(), "image/png");
        assert_eq!(upload.bytes().as_ref(), b"hello");
        assert_eq!(upload.extension().as_deref(), Some("png"));

        let svg = Upload::from_data_url("data:image/svg+xml;base64,PHN2Zy8+").expect("svg");
        assert_eq!(svg.extension().as_deref(), Some("svgxml"));
    }

    #[test]
    fn bad_data_urls_are_rejected() {
        assert_eq!(
            Upload::from_data_url("data:text/plain;base64,aGk="),
            Err(Rejection::UnsupportedMediaType)
        );
        assert_eq!(
            Upload::from_data_url("https://example.org/cat.png"),
            Err(Rejection::UnsupportedMediaType)
        );
        assert_eq!(
            Upload::from_data_url("data:image/png;base64,@@not base64@@"),
            Err(Rejection::MalformedUpload)
        );
    }
}
