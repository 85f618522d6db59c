//! Score aggregation across augmented inference passes.
//!
//! A single pass is noisy near the thresholds, so the image is classified as
//! given and (optionally) mirrored, and per-label probabilities are averaged
//! over the passes that succeeded:
//!
//! ```text
//! base ──► classify ─┐
//!                    ├──► mean per label ──► AggregateScore { passes: N }
//! mirror ► classify ─┘
//! ```
//!
//! A failing variant is dropped and N shrinks; N = 0 is an error, never a
//! "safe" score.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use tracing::{debug, warn};

use crate::classifier::{ClassificationResult, Classifier, Label, PixelBuffer};
use crate::config::ModerationConfig;
use crate::error::{ModerationError, Result};

/// Per-label mean probabilities over `passes` successful inference passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateScore {
    means: [f64; 5],
    passes: usize,
}

impl AggregateScore {
    /// Averages `results` label by label.
    ///
    /// # Errors
    ///
    /// Returns [`ModerationError::InferenceFailure`] if `results` is empty.
    pub fn from_passes(results: &[ClassificationResult]) -> Result<Self> {
        if results.is_empty() {
            return Err(ModerationError::InferenceFailure(
                "no inference pass succeeded".into(),
            ));
        }

        let mut means = [0.0; 5];
        for label in Label::ALL {
            let sum: f64 = results.iter().map(|r| r.probability(label)).sum();
            #[allow(clippy::cast_precision_loss)]
            let mean = sum / results.len() as f64;
            means[label.index()] = mean.clamp(0.0, 1.0);
        }

        Ok(Self {
            means,
            passes: results.len(),
        })
    }

    /// Builds a score directly from means in [`Label::ALL`] order (one pass).
    #[must_use]
    pub fn from_means(means: [f64; 5]) -> Self {
        Self {
            means: means.map(|p| if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 }),
            passes: 1,
        }
    }

    /// Mean probability for `label`.
    #[must_use]
    pub const fn get(&self, label: Label) -> f64 {
        self.means[label.index()]
    }

    /// Number of passes that contributed.
    #[must_use]
    pub const fn passes(&self) -> usize {
        self.passes
    }

    /// Core signal: `max(Porn, Hentai)`.
    #[must_use]
    pub fn core(&self) -> f64 {
        self.get(Label::Porn).max(self.get(Label::Hentai))
    }

    /// Safe signal: `Neutral + Drawing`.
    #[must_use]
    pub fn sfw(&self) -> f64 {
        self.get(Label::Neutral) + self.get(Label::Drawing)
    }

    /// `Porn + Hentai + Sexy`.
    #[must_use]
    pub fn explicit_sum(&self) -> f64 {
        self.get(Label::Porn) + self.get(Label::Hentai) + self.get(Label::Sexy)
    }
}

impl fmt::Display for AggregateScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, label) in Label::ALL.into_iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{label}={:.3}", self.get(label))?;
        }
        write!(f, "] passes={}", self.passes)
    }
}

/// Geometric variant of the base image fed to the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Augmentation {
    /// The image as decoded.
    Identity,
    /// Left/right mirrored copy.
    MirrorHorizontal,
}

impl Augmentation {
    /// Produces the variant. `Identity` borrows the base buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ModerationError::DecodeFailure`] if the base buffer cannot
    /// be transformed.
    pub fn apply<'a>(&self, base: &'a PixelBuffer) -> Result<Cow<'a, PixelBuffer>> {
        match self {
            Self::Identity => Ok(Cow::Borrowed(base)),
            Self::MirrorHorizontal if base.width() < 2 => Err(ModerationError::DecodeFailure(
                "image too narrow to mirror".into(),
            )),
            Self::MirrorHorizontal => Ok(Cow::Owned(base.mirrored())),
        }
    }
}

/// Runs the classifier over each augmentation and averages the results.
#[derive(Debug, Clone)]
pub struct ScoreAggregator {
    augmentations: Vec<Augmentation>,
    inference_timeout: Duration,
}

impl ScoreAggregator {
    /// Creates an aggregator with an explicit variant list.
    #[must_use]
    pub fn new(augmentations: Vec<Augmentation>, inference_timeout: Duration) -> Self {
        Self {
            augmentations,
            inference_timeout,
        }
    }

    /// Aggregator for the authoritative gate: identity plus mirror when
    /// `config.augment` is set.
    #[must_use]
    pub fn from_config(config: &ModerationConfig) -> Self {
        let augmentations = if config.augment {
            vec![Augmentation::Identity, Augmentation::MirrorHorizontal]
        } else {
            vec![Augmentation::Identity]
        };
        Self::new(augmentations, config.inference_timeout())
    }

    /// Single identity pass, as used by the advisory gate.
    #[must_use]
    pub fn single_pass(inference_timeout: Duration) -> Self {
        Self::new(vec![Augmentation::Identity], inference_timeout)
    }

    /// Classifies `base` and its variants and averages the successful passes.
    ///
    /// Each variant buffer is dropped as soon as its inference returns.
    ///
    /// # Errors
    ///
    /// Returns the last variant error when no pass succeeded.
    pub async fn aggregate(
        &self,
        classifier: &dyn Classifier,
        base: PixelBuffer,
    ) -> Result<AggregateScore> {
        let mut passes = Vec::with_capacity(self.augmentations.len());
        let mut last_error = None;

        for augmentation in &self.augmentations {
            let outcome = match augmentation.apply(&base) {
                Ok(variant) => self.classify_once(classifier, &variant).await,
                Err(err) => Err(err),
            };

            match outcome {
                Ok(result) => passes.push(result),
                Err(err) => {
                    warn!(?augmentation, error = %err, "dropping inference variant");
                    last_error = Some(err);
                }
            }
        }
        drop(base);

        if passes.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                ModerationError::InferenceFailure("no augmentation configured".into())
            }));
        }

        let score = AggregateScore::from_passes(&passes)?;
        debug!(%score, "aggregated classifier passes");
        Ok(score)
    }

    async fn classify_once(
        &self,
        classifier: &dyn Classifier,
        image: &PixelBuffer,
    ) -> Result<ClassificationResult> {
        let result = tokio::time::timeout(self.inference_timeout, classifier.classify(image))
            .await
            .map_err(|_| ModerationError::InferenceTimeout(self.inference_timeout))??;
        result.validate()?;
        Ok(result)
    }
}
