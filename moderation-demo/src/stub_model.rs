//! Stand-in image model for the demo.
//!
//! No network, no weights: the loader sleeps to mimic a model download and
//! the classifier derives scores from the image itself so that different
//! files give different verdicts. `DEMO_SCORES="p,h,s,n,d"` pins the output
//! instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use discover_moderation::{
    ClassificationResult, Classifier, ClassifierLoader, ModerationError, PixelBuffer, Result,
};
use tracing::info;

/// Fake classifier.
#[derive(Debug, Clone, Copy)]
pub struct StubClassifier {
    fixed: Option<[f64; 5]>,
}

impl StubClassifier {
    /// Scores from `DEMO_SCORES` if set, otherwise from pixel statistics.
    ///
    /// # Errors
    ///
    /// Fails when `DEMO_SCORES` is set but is not five comma separated numbers.
    pub fn from_env() -> Result<Self> {
        let fixed = match std::env::var("DEMO_SCORES") {
            Ok(raw) => Some(parse_scores(&raw)?),
            Err(_) => None,
        };
        Ok(Self { fixed })
    }
}

#[async_trait]
impl Classifier for StubClassifier {
    async fn classify(&self, image: &PixelBuffer) -> Result<ClassificationResult> {
        if let Some(scores) = self.fixed {
            return Ok(ClassificationResult::from_scores(scores));
        }
        Ok(ClassificationResult::from_scores(skin_tone_scores(image)))
    }

    fn name(&self) -> &str {
        "stub"
    }
}

/// Share of roughly skin-coloured pixels, mapped onto the five labels.
fn skin_tone_scores(image: &PixelBuffer) -> [f64; 5] {
    let mut skin = 0_u64;
    let mut total = 0_u64;
    for px in image.as_bytes().chunks_exact(3) {
        let (r, g, b) = (i32::from(px[0]), i32::from(px[1]), i32::from(px[2]));
        if r > 95 && g > 40 && b > 20 && r > g && r > b && (r - g) > 15 {
            skin += 1;
        }
        total += 1;
    }

    #[allow(clippy::cast_precision_loss)]
    let ratio = if total == 0 { 0.0 } else { skin as f64 / total as f64 };
    let porn = ratio * 0.7;
    let sexy = ratio * 0.2;
    let neutral = 1.0 - porn - sexy;
    [porn, 0.0, sexy, neutral, 0.0]
}

fn parse_scores(raw: &str) -> Result<[f64; 5]> {
    let values: Vec<f64> = raw
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| ModerationError::PolicyMisconfigured(format!("DEMO_SCORES: {e}")))?;
    <[f64; 5]>::try_from(values).map_err(|v| {
        ModerationError::PolicyMisconfigured(format!(
            "DEMO_SCORES needs 5 values, got {}",
            v.len()
        ))
    })
}

/// Loader that pretends to download the model.
#[derive(Debug)]
pub struct StubLoader {
    delay: Duration,
}

impl StubLoader {
    /// Loader taking `delay` to "download" the model.
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ClassifierLoader for StubLoader {
    async fn load(&self) -> Result<Arc<dyn Classifier>> {
        info!(delay = ?self.delay, "downloading stub model");
        tokio::time::sleep(self.delay).await;
        Ok(Arc::new(StubClassifier::from_env()?))
    }
}
