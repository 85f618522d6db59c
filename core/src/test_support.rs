//! Fakes shared by the unit tests of several modules.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::classifier::{
    ClassificationResult, Classifier, ClassifierLoader, LazyClassifier, PixelBuffer,
};
use crate::error::{ModerationError, Result};

/// Classifier returning the same scores for every image.
pub struct FixedClassifier {
    scores: [f64; 5],
    delay: Duration,
    calls: AtomicUsize,
}

impl FixedClassifier {
    pub fn new(scores: [f64; 5]) -> Self {
        Self {
            scores,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn neutral() -> Self {
        Self::new([0.01, 0.01, 0.03, 0.9, 0.05])
    }

    pub fn explicit() -> Self {
        Self::new([0.8, 0.1, 0.1, 0.0, 0.0])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for FixedClassifier {
    async fn classify(&self, _image: &PixelBuffer) -> Result<ClassificationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(ClassificationResult::from_scores(self.scores))
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

/// Classifier that always errors.
#[derive(Default)]
pub struct FailingClassifier {
    calls: AtomicUsize,
}

impl FailingClassifier {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for FailingClassifier {
    async fn classify(&self, _image: &PixelBuffer) -> Result<ClassificationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ModerationError::InferenceFailure("backend exploded".into()))
    }
}

/// Loader that counts attempts, optionally sleeps, and can fail the first N.
pub struct ScriptedLoader {
    delay: Duration,
    fail_first: usize,
    loads: AtomicUsize,
}

impl ScriptedLoader {
    pub fn succeeding(delay: Duration) -> Self {
        Self {
            delay,
            fail_first: 0,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn failing_first(n: usize) -> Self {
        Self {
            delay: Duration::ZERO,
            fail_first: n,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_first(usize::MAX)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassifierLoader for ScriptedLoader {
    async fn load(&self) -> Result<Arc<dyn Classifier>> {
        let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if attempt < self.fail_first {
            return Err(ModerationError::ClassifierUnavailable(
                "model download failed".into(),
            ));
        }
        Ok(Arc::new(FixedClassifier::neutral()))
    }
}

/// Loader whose download never finishes.
pub struct HangingLoader;

#[async_trait]
impl ClassifierLoader for HangingLoader {
    async fn load(&self) -> Result<Arc<dyn Classifier>> {
        futures::future::pending::<Result<Arc<dyn Classifier>>>().await
    }
}

/// A ready [`LazyClassifier`] around `classifier`.
pub fn ready(classifier: Arc<dyn Classifier>) -> Arc<LazyClassifier> {
    Arc::new(LazyClassifier::ready(classifier))
}

/// Encodes a solid-colour PNG.
pub fn png_bytes(width: u32, height: u32, rgb: [u8; 3]) -> Bytes {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, image::ImageOutputFormat::Png)
        .expect("encode png");
    Bytes::from(out.into_inner())
}
