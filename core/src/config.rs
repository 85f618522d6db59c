//! Configuration handling for the moderation pipeline.
//!
//! Settings are read once at process start, validated, and then shared
//! immutably (behind an `Arc`) by every gate. Two sources are supported:
//!
//! - environment variables ([`ModerationConfig::from_env`]), the way the
//!   upload service has always been configured;
//! - a YAML file ([`ModerationConfig::from_yaml`]) for deployments that keep
//!   their settings next to the binary.
//!
//! Invalid values are a startup error ([`ModerationError::PolicyMisconfigured`]),
//! never something discovered while a request is in flight.

use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::error::{ModerationError, Result};

/// Default absolute threshold for the core (`max(Porn, Hentai)`) signal.
pub const DEFAULT_BLOCK_CORE: f64 = 0.55;
/// Default margin the core signal must exceed the SFW signal by.
pub const DEFAULT_MARGIN_CORE: f64 = 0.15;
/// Default absolute threshold for the `Sexy` signal.
pub const DEFAULT_BLOCK_SEXY: f64 = 0.90;
/// Default margin the `Sexy` signal must exceed the SFW signal by.
pub const DEFAULT_MARGIN_SEXY: f64 = 0.20;

/// Thresholds and switches consumed by the policy decision and the gates.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// On classifier error, allow (`true`) or block (`false`, the default).
    pub fail_open: bool,
    /// Absolute threshold for the core signal in default mode.
    pub block_core_threshold: f64,
    /// Required gap between core and SFW signals in default mode.
    pub core_margin: f64,
    /// Absolute threshold for the `Sexy` signal in default mode.
    pub block_sexy_threshold: f64,
    /// Required gap between `Sexy` and SFW signals in default mode.
    pub sexy_margin: f64,
    /// Use the fixed strict constants instead of the thresholds above.
    pub strict_mode: bool,
    /// Moderation off switch: every image is allowed without classification.
    pub disabled: bool,
    /// Log aggregate scores and the decision branch for each image.
    pub log_scores: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            fail_open: false,
            block_core_threshold: DEFAULT_BLOCK_CORE,
            core_margin: DEFAULT_MARGIN_CORE,
            block_sexy_threshold: DEFAULT_BLOCK_SEXY,
            sexy_margin: DEFAULT_MARGIN_SEXY,
            strict_mode: false,
            disabled: false,
            log_scores: false,
        }
    }
}

impl PolicyConfig {
    /// Checks that thresholds lie in `[0, 1]` and margins in `[-1, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`ModerationError::PolicyMisconfigured`] naming the first
    /// offending field.
    pub fn validate(&self) -> Result<()> {
        check_range("block_core_threshold", self.block_core_threshold, 0.0, 1.0)?;
        check_range("block_sexy_threshold", self.block_sexy_threshold, 0.0, 1.0)?;
        check_range("core_margin", self.core_margin, -1.0, 1.0)?;
        check_range("sexy_margin", self.sexy_margin, -1.0, 1.0)?;
        Ok(())
    }
}

/// Which [`crate::decode::PixelDecoder`] implementation to build at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    /// Full-resolution decode.
    #[default]
    Native,
    /// Decode then downsample to a bounded edge length.
    Thumbnail,
}

impl FromStr for DecoderKind {
    type Err = ModerationError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "native" | "full" => Ok(Self::Native),
            "thumbnail" | "thumb" => Ok(Self::Thumbnail),
            other => Err(ModerationError::PolicyMisconfigured(format!(
                "unknown decoder {other:?} (expected \"native\" or \"thumbnail\")"
            ))),
        }
    }
}

/// Request-level limits checked before anything is written to storage.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct UploadLimits {
    /// Largest accepted image, in bytes.
    pub max_image_bytes: usize,
    /// Largest accepted video clip, in bytes.
    pub max_video_bytes: usize,
    /// Longest accepted clip, in seconds (inclusive).
    pub max_clip_seconds: f64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_image_bytes: 10_000_000,
            max_video_bytes: 200_000_000,
            max_clip_seconds: 30.5,
        }
    }
}

/// Complete configuration snapshot for the pipeline.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    /// Policy thresholds and switches.
    pub policy: PolicyConfig,
    /// Upload size and duration limits.
    pub limits: UploadLimits,
    /// Decoder implementation.
    pub decoder: DecoderKind,
    /// Longest edge produced by the thumbnail decoder.
    pub thumbnail_edge: u32,
    /// Run a second, horizontally mirrored inference pass.
    pub augment: bool,
    /// Upper bound for a single classifier call, in milliseconds.
    pub inference_timeout_ms: u64,
    /// How long the advisory gate waits for the model to finish loading.
    pub advisory_load_budget_ms: u64,
    /// How long the authoritative gate waits for the model to finish loading.
    pub model_load_timeout_ms: u64,
    /// Age after which an uncommitted artifact is considered orphaned.
    pub provisional_ttl_secs: u64,
    /// Extra denylist terms appended to the built-in list.
    pub text_denylist_extra: Vec<String>,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            limits: UploadLimits::default(),
            decoder: DecoderKind::Native,
            thumbnail_edge: 512,
            augment: true,
            inference_timeout_ms: 10_000,
            advisory_load_budget_ms: 3_000,
            model_load_timeout_ms: 60_000,
            provisional_ttl_secs: 15 * 60,
            text_denylist_extra: Vec::new(),
        }
    }
}

impl ModerationConfig {
    /// Loads configuration from the process environment, falling back to defaults.
    ///
    /// Policy keys follow the upload service's historical names and are
    /// accepted both with and without the `NSFW_` prefix (the prefixed form
    /// wins when both are set):
    ///
    /// - `FAIL_OPEN`, `STRICT`, `DISABLE`, `LOG_SCORES` – booleans
    ///   (`"1"`, `"true"`, `"yes"`, `"on"` → `true`, anything else → `false`);
    /// - `BLOCK_CORE`, `MARGIN_CORE`, `BLOCK_SEXY`, `MARGIN_SEXY` – floats.
    ///
    /// Pipeline keys: `MODERATION_DECODER`, `MODERATION_THUMBNAIL_EDGE`,
    /// `MODERATION_AUGMENT`, `MODERATION_INFERENCE_TIMEOUT_MS`,
    /// `MODERATION_ADVISORY_BUDGET_MS`, `MODERATION_MODEL_LOAD_TIMEOUT_MS`,
    /// `MODERATION_PROVISIONAL_TTL_SECS`,
    /// `MODERATION_MAX_IMAGE_BYTES`, `MODERATION_MAX_VIDEO_BYTES`,
    /// `MODERATION_MAX_CLIP_SECONDS`, `TEXT_DENYLIST_EXTRA` (comma separated).
    ///
    /// # Errors
    ///
    /// Returns [`ModerationError::PolicyMisconfigured`] for unparsable or
    /// out-of-range values.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Self::from_env`] but reads values through `lookup`.
    ///
    /// # Errors
    ///
    /// See [`Self::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let first = |keys: &[&str]| first_set(&lookup, keys);

        // Policy switches
        if let Some(raw) = first(&["NSFW_FAIL_OPEN", "FAIL_OPEN"]) {
            cfg.policy.fail_open = parse_bool(&raw);
        }
        if let Some(raw) = first(&["NSFW_STRICT", "STRICT"]) {
            cfg.policy.strict_mode = parse_bool(&raw);
        }
        if let Some(raw) = first(&["NSFW_DISABLE", "DISABLE"]) {
            cfg.policy.disabled = parse_bool(&raw);
        }
        if let Some(raw) = first(&["NSFW_LOG_SCORES", "LOG_SCORES"]) {
            cfg.policy.log_scores = parse_bool(&raw);
        }

        // Policy thresholds
        if let Some(raw) = first(&["NSFW_BLOCK_CORE", "BLOCK_CORE"]) {
            cfg.policy.block_core_threshold = parse_number("BLOCK_CORE", &raw)?;
        }
        if let Some(raw) = first(&["NSFW_MARGIN_CORE", "MARGIN_CORE"]) {
            cfg.policy.core_margin = parse_number("MARGIN_CORE", &raw)?;
        }
        if let Some(raw) = first(&["NSFW_BLOCK_SEXY", "BLOCK_SEXY"]) {
            cfg.policy.block_sexy_threshold = parse_number("BLOCK_SEXY", &raw)?;
        }
        if let Some(raw) = first(&["NSFW_MARGIN_SEXY", "MARGIN_SEXY"]) {
            cfg.policy.sexy_margin = parse_number("MARGIN_SEXY", &raw)?;
        }

        // Pipeline
        if let Some(raw) = first(&["MODERATION_DECODER"]) {
            cfg.decoder = raw.parse()?;
        }
        if let Some(raw) = first(&["MODERATION_THUMBNAIL_EDGE"]) {
            cfg.thumbnail_edge = parse_number("MODERATION_THUMBNAIL_EDGE", &raw)?;
        }
        if let Some(raw) = first(&["MODERATION_AUGMENT"]) {
            cfg.augment = parse_bool(&raw);
        }
        if let Some(raw) = first(&["MODERATION_INFERENCE_TIMEOUT_MS"]) {
            cfg.inference_timeout_ms = parse_number("MODERATION_INFERENCE_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = first(&["MODERATION_ADVISORY_BUDGET_MS"]) {
            cfg.advisory_load_budget_ms = parse_number("MODERATION_ADVISORY_BUDGET_MS", &raw)?;
        }
        if let Some(raw) = first(&["MODERATION_MODEL_LOAD_TIMEOUT_MS"]) {
            cfg.model_load_timeout_ms = parse_number("MODERATION_MODEL_LOAD_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = first(&["MODERATION_PROVISIONAL_TTL_SECS"]) {
            cfg.provisional_ttl_secs = parse_number("MODERATION_PROVISIONAL_TTL_SECS", &raw)?;
        }

        // Upload limits
        if let Some(raw) = first(&["MODERATION_MAX_IMAGE_BYTES"]) {
            cfg.limits.max_image_bytes = parse_number("MODERATION_MAX_IMAGE_BYTES", &raw)?;
        }
        if let Some(raw) = first(&["MODERATION_MAX_VIDEO_BYTES"]) {
            cfg.limits.max_video_bytes = parse_number("MODERATION_MAX_VIDEO_BYTES", &raw)?;
        }
        if let Some(raw) = first(&["MODERATION_MAX_CLIP_SECONDS"]) {
            cfg.limits.max_clip_seconds = parse_number("MODERATION_MAX_CLIP_SECONDS", &raw)?;
        }

        // Denylist
        if let Some(raw) = first(&["NSFW_TEXT_DENYLIST_EXTRA", "TEXT_DENYLIST_EXTRA"]) {
            cfg.text_denylist_extra = raw
                .split(',')
                .map(str::trim)
                .filter(|term| !term.is_empty())
                .map(str::to_owned)
                .collect();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads configuration from a YAML file. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed, or if validation fails.
    pub fn from_yaml(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Unable to read moderation config {}", path.display()))?;
        let cfg: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("Invalid moderation config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates the whole snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ModerationError::PolicyMisconfigured`] naming the first
    /// offending field.
    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;

        if self.inference_timeout_ms == 0 {
            return Err(misconfigured("inference_timeout_ms must be > 0"));
        }
        if self.model_load_timeout_ms == 0 {
            return Err(misconfigured("model_load_timeout_ms must be > 0"));
        }
        if self.decoder == DecoderKind::Thumbnail && self.thumbnail_edge == 0 {
            return Err(misconfigured("thumbnail_edge must be > 0"));
        }
        if self.limits.max_image_bytes == 0 || self.limits.max_video_bytes == 0 {
            return Err(misconfigured("upload size limits must be > 0"));
        }
        if !self.limits.max_clip_seconds.is_finite() || self.limits.max_clip_seconds <= 0.0 {
            return Err(misconfigured("max_clip_seconds must be a positive number"));
        }
        if self.text_denylist_extra.iter().any(|t| t.trim().is_empty()) {
            return Err(misconfigured("text_denylist_extra contains an empty term"));
        }
        Ok(())
    }

    /// Upper bound for a single classifier call.
    #[must_use]
    pub const fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    /// How long the advisory gate waits for the model to load.
    #[must_use]
    pub const fn advisory_load_budget(&self) -> Duration {
        Duration::from_millis(self.advisory_load_budget_ms)
    }

    /// How long the authoritative gate waits for the model to load.
    #[must_use]
    pub const fn model_load_timeout(&self) -> Duration {
        Duration::from_millis(self.model_load_timeout_ms)
    }

    /// Age after which an uncommitted artifact may be swept.
    #[must_use]
    pub const fn provisional_ttl(&self) -> Duration {
        Duration::from_secs(self.provisional_ttl_secs)
    }
}

/// Returns the first key in `keys` for which `lookup` yields a value.
fn first_set<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter().find_map(|key| lookup(key))
}

/// Parses a loose boolean value from a string.
///
/// Accepted as `true`: `"1"`, `"true"`, `"yes"`, `"on"` (any case).
/// Any other value → `false` (`FAIL_OPEN=ture` stays fail-closed).
fn parse_bool(raw: &str) -> bool {
    let v = raw.trim().to_ascii_lowercase();
    matches!(v.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
{
    raw.trim()
        .parse()
        .map_err(|_| misconfigured(format!("invalid value for {key}: {raw:?}")))
}

fn check_range(field: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(misconfigured(format!(
            "{field} must be within [{min}, {max}], got {value}"
        )))
    }
}

fn misconfigured(msg: impl Into<String>) -> ModerationError {
    ModerationError::PolicyMisconfigured(msg.into())
}
