//! Image decoding: stored artifact bytes → [`PixelBuffer`].
//!
//! The decoder is picked once at startup from [`DecoderKind`], never probed
//! per request. Both implementations sniff the container format from the
//! bytes themselves (the declared content type is not trusted).
//!
//! Decoding is CPU bound; callers on the async path run it through
//! `tokio::task::spawn_blocking`.

use std::sync::Arc;

use image::imageops::FilterType;
use image::DynamicImage;

use crate::classifier::PixelBuffer;
use crate::config::{DecoderKind, ModerationConfig};
use crate::error::{ModerationError, Result};

/// Turns encoded image bytes into an RGB pixel buffer.
pub trait PixelDecoder: Send + Sync {
    /// Decodes `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`ModerationError::DecodeFailure`] when the bytes are not a
    /// supported image.
    fn decode(&self, bytes: &[u8]) -> Result<PixelBuffer>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Full-resolution decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeDecoder;

impl PixelDecoder for NativeDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<PixelBuffer> {
        into_pixel_buffer(load(bytes)?)
    }

    fn name(&self) -> &'static str {
        "native"
    }
}

/// Decoder that downsamples so the longest edge is at most `max_edge`.
///
/// Keeps the per-request buffer bounded regardless of the upload's
/// resolution. Images already within the bound are left untouched.
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailDecoder {
    max_edge: u32,
}

impl ThumbnailDecoder {
    /// Creates a decoder bounding the longest edge to `max_edge` pixels.
    #[must_use]
    pub const fn new(max_edge: u32) -> Self {
        Self { max_edge }
    }
}

impl PixelDecoder for ThumbnailDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<PixelBuffer> {
        let image = load(bytes)?;
        let image = if image.width().max(image.height()) > self.max_edge {
            image.resize(self.max_edge, self.max_edge, FilterType::Triangle)
        } else {
            image
        };
        into_pixel_buffer(image)
    }

    fn name(&self) -> &'static str {
        "thumbnail"
    }
}

/// Builds the decoder selected by `config`.
#[must_use]
pub fn decoder_for(config: &ModerationConfig) -> Arc<dyn PixelDecoder> {
    match config.decoder {
        DecoderKind::Native => Arc::new(NativeDecoder),
        DecoderKind::Thumbnail => Arc::new(ThumbnailDecoder::new(config.thumbnail_edge)),
    }
}

fn load(bytes: &[u8]) -> Result<DynamicImage> {
    if bytes.is_empty() {
        return Err(ModerationError::DecodeFailure("empty artifact".into()));
    }
    image::load_from_memory(bytes).map_err(|e| ModerationError::DecodeFailure(e.to_string()))
}

fn into_pixel_buffer(image: DynamicImage) -> Result<PixelBuffer> {
    let rgb = image.into_rgb8();
    let (width, height) = rgb.dimensions();
    PixelBuffer::new(width, height, rgb.into_raw())
}
