//! Classifier capability: the contract the pipeline consumes from the
//! (external) image model, plus the single-flight lazy loader around it.
//!
//! The model itself is out of scope. Anything that can turn an RGB pixel
//! buffer into probabilities over the five [`Label`]s can sit behind the
//! [`Classifier`] trait; [`ClassifierLoader`] describes how to bring one up.
//!
//! # Loading
//!
//! Loading is slow, asynchronous and must happen at most once at a time for
//! the whole process. [`LazyClassifier`] keeps one shared load future:
//!
//! ```text
//! caller A ──┐
//! caller B ──┼──► shared load future ──► spawned loader task ──► Arc<dyn Classifier>
//! caller C ──┘         (one per attempt)
//! ```
//!
//! The loader runs on its own task, so a caller that gives up waiting (the
//! advisory gate under a time budget, a cancelled request) does not abort it.
//! A failed attempt is reported to everyone waiting on it and then forgotten,
//! so the next caller starts a fresh attempt.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{info, warn};

use crate::error::{ModerationError, Result};

/// Closed label set produced by the image model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Label {
    /// Explicit photographic content.
    Porn,
    /// Explicit drawn/animated content.
    Hentai,
    /// Suggestive but not explicit content.
    Sexy,
    /// Ordinary photographic content.
    Neutral,
    /// Ordinary drawn content.
    Drawing,
}

impl Label {
    /// Every label, in the model's canonical order.
    pub const ALL: [Self; 5] = [
        Self::Porn,
        Self::Hentai,
        Self::Sexy,
        Self::Neutral,
        Self::Drawing,
    ];

    /// The class name the model uses for this label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Porn => "Porn",
            Self::Hentai => "Hentai",
            Self::Sexy => "Sexy",
            Self::Neutral => "Neutral",
            Self::Drawing => "Drawing",
        }
    }

    /// Position of the label in [`Label::ALL`].
    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::Porn => 0,
            Self::Hentai => 1,
            Self::Sexy => 2,
            Self::Neutral => 3,
            Self::Drawing => 4,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = ModerationError;

    fn from_str(raw: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|label| label.as_str().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| ModerationError::InferenceFailure(format!("unknown label {raw:?}")))
    }
}

/// Output of one inference pass over one image.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    predictions: Vec<(Label, f64)>,
}

impl ClassificationResult {
    /// Wraps the `(label, probability)` pairs returned by the model.
    #[must_use]
    pub fn new(predictions: Vec<(Label, f64)>) -> Self {
        Self { predictions }
    }

    /// Builds a result from per-label probabilities in [`Label::ALL`] order.
    #[must_use]
    pub fn from_scores(scores: [f64; 5]) -> Self {
        Self::new(Label::ALL.into_iter().zip(scores).collect())
    }

    /// Probability for `label`, or `0.0` when the model did not report it.
    #[must_use]
    pub fn probability(&self, label: Label) -> f64 {
        self.predictions
            .iter()
            .find(|(l, _)| *l == label)
            .map_or(0.0, |(_, p)| *p)
    }

    /// The raw pairs, in the order the model returned them.
    #[must_use]
    pub fn predictions(&self) -> &[(Label, f64)] {
        &self.predictions
    }

    /// Rejects probabilities that are not finite or fall outside `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`ModerationError::InferenceFailure`] describing the bad pair.
    pub fn validate(&self) -> Result<()> {
        match self
            .predictions
            .iter()
            .find(|(_, p)| !p.is_finite() || !(0.0..=1.0).contains(p))
        {
            Some((label, p)) => Err(ModerationError::InferenceFailure(format!(
                "probability for {label} out of range: {p}"
            ))),
            None => Ok(()),
        }
    }
}

/// Decoded RGB image, row-major, three `u8` channels per pixel (H×W×3).
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl PixelBuffer {
    /// Wraps raw RGB data.
    ///
    /// # Errors
    ///
    /// Returns [`ModerationError::DecodeFailure`] for zero dimensions or when
    /// `data.len() != width * height * 3`.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(3));
        match expected {
            _ if width == 0 || height == 0 => Err(ModerationError::DecodeFailure(format!(
                "empty image ({width}x{height})"
            ))),
            Some(len) if len == data.len() => Ok(Self {
                width,
                height,
                data,
            }),
            _ => Err(ModerationError::DecodeFailure(format!(
                "buffer of {} bytes does not match {width}x{height}x3",
                data.len()
            ))),
        }
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Raw channel data.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// RGB value at `(x, y)`, or `None` when out of bounds.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let at = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.data[at], self.data[at + 1], self.data[at + 2]])
    }

    /// Horizontally mirrored copy (left/right swapped, rows unchanged).
    #[must_use]
    pub fn mirrored(&self) -> Self {
        let row_len = self.width as usize * 3;
        let mut data = Vec::with_capacity(self.data.len());
        for row in self.data.chunks_exact(row_len) {
            for px in row.chunks_exact(3).rev() {
                data.extend_from_slice(px);
            }
        }
        Self {
            width: self.width,
            height: self.height,
            data,
        }
    }
}

/// A loaded image model.
///
/// Implementations must be idempotent for a given buffer and must tolerate
/// concurrent calls on independent buffers.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classifies one image into probabilities over [`Label::ALL`].
    async fn classify(&self, image: &PixelBuffer) -> Result<ClassificationResult>;

    /// Human-readable model name, used in logs.
    fn name(&self) -> &str {
        "classifier"
    }
}

/// Brings a [`Classifier`] up. Called at most once at a time by [`LazyClassifier`].
#[async_trait]
pub trait ClassifierLoader: Send + Sync {
    /// Loads the model.
    async fn load(&self) -> Result<Arc<dyn Classifier>>;
}

type LoadOutput = std::result::Result<Arc<dyn Classifier>, String>;
type SharedLoad = Shared<BoxFuture<'static, LoadOutput>>;

#[derive(Default)]
struct LoadSlot {
    attempt: u64,
    inflight: Option<SharedLoad>,
}

/// Lazily loaded, process-wide classifier handle.
pub struct LazyClassifier {
    loader: Arc<dyn ClassifierLoader>,
    slot: Mutex<LoadSlot>,
    /// Set by the loader task itself, so readiness does not depend on a
    /// caller having polled the shared future.
    loaded: Arc<OnceLock<Arc<dyn Classifier>>>,
}

impl fmt::Debug for LazyClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyClassifier")
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl LazyClassifier {
    /// Wraps `loader`. Nothing is loaded until the first [`Self::get`] or
    /// [`Self::warm_up`].
    #[must_use]
    pub fn new(loader: Arc<dyn ClassifierLoader>) -> Self {
        Self {
            loader,
            slot: Mutex::new(LoadSlot::default()),
            loaded: Arc::new(OnceLock::new()),
        }
    }

    /// Wraps an already loaded classifier; [`Self::get`] never waits.
    #[must_use]
    pub fn ready(classifier: Arc<dyn Classifier>) -> Self {
        let output: LoadOutput = Ok(Arc::clone(&classifier));
        let inflight = futures::future::ready(output).boxed().shared();
        Self {
            loader: Arc::new(AlreadyLoaded(Arc::clone(&classifier))),
            slot: Mutex::new(LoadSlot {
                attempt: 1,
                inflight: Some(inflight),
            }),
            loaded: Arc::new(OnceLock::from(classifier)),
        }
    }

    /// Returns the classifier, joining the in-flight load or starting one.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ModerationError::ClassifierUnavailable`] when the load
    /// attempt this call waited on failed.
    pub async fn get(&self) -> Result<Arc<dyn Classifier>> {
        let (attempt, load) = self.current_load();
        match load.await {
            Ok(classifier) => Ok(classifier),
            Err(msg) => {
                self.forget_failed(attempt);
                Err(ModerationError::ClassifierUnavailable(msg))
            }
        }
    }

    /// Starts loading in the background without waiting for it.
    pub fn warm_up(&self) {
        let _ = self.current_load();
    }

    /// The classifier, if a load has already completed successfully.
    #[must_use]
    pub fn try_get(&self) -> Option<Arc<dyn Classifier>> {
        self.loaded.get().cloned()
    }

    /// `true` once [`Self::try_get`] would return a classifier.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.try_get().is_some()
    }

    /// Atomic get-or-create of the shared load future.
    fn current_load(&self) -> (u64, SharedLoad) {
        let mut slot = self.lock();
        if let Some(load) = &slot.inflight {
            return (slot.attempt, load.clone());
        }

        slot.attempt += 1;
        let attempt = slot.attempt;
        let loader = Arc::clone(&self.loader);
        let ready = Arc::clone(&self.loaded);
        let task = tokio::spawn(async move {
            info!(attempt, "loading image classifier");
            let loaded = loader.load().await;
            match &loaded {
                Ok(classifier) => {
                    let _ = ready.set(Arc::clone(classifier));
                    info!(attempt, model = classifier.name(), "image classifier ready");
                }
                Err(err) => warn!(attempt, error = %err, "image classifier load failed"),
            }
            loaded
        });

        let load: SharedLoad = async move {
            match task.await {
                Ok(Ok(classifier)) => Ok(classifier),
                Ok(Err(err)) => Err(err.to_string()),
                Err(join) => Err(format!("classifier load task aborted: {join}")),
            }
        }
        .boxed()
        .shared();

        slot.inflight = Some(load.clone());
        (attempt, load)
    }

    /// Drops a failed attempt so the next caller retries; a newer attempt
    /// started in the meantime is left alone.
    fn forget_failed(&self, attempt: u64) {
        let mut slot = self.lock();
        if slot.attempt == attempt {
            slot.inflight = None;
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoadSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct AlreadyLoaded(Arc<dyn Classifier>);

#[async_trait]
impl ClassifierLoader for AlreadyLoaded {
    async fn load(&self) -> Result<Arc<dyn Classifier>> {
        Ok(Arc::clone(&self.0))
    }
}
