//! Policy decision: aggregate scores + configuration → verdict.
//!
//! Definitions used by both modes:
//!
//! ```text
//! core = max(Porn, Hentai)
//! sfw  = Neutral + Drawing
//! ```
//!
//! - **Default mode** blocks only when a signal is both absolutely high and
//!   dominant over the safe signal by a configurable margin.
//! - **Strict mode** uses fixed constants and ignores the configured
//!   thresholds and margins.
//!
//! The reason code tells operators which branch fired. It is never shown to
//! end users.

use std::fmt;

use crate::aggregate::AggregateScore;
use crate::classifier::Label;
use crate::config::PolicyConfig;

/// Strict mode: core signal that blocks on its own.
pub const STRICT_CORE: f64 = 0.35;
/// Strict mode: lower core signal that blocks when the safe signal is weak.
pub const STRICT_CORE_WEAK_SFW: f64 = 0.30;
/// Strict mode: safe signal at or below which [`STRICT_CORE_WEAK_SFW`] applies.
pub const STRICT_WEAK_SFW: f64 = 0.20;
/// Strict mode: `Sexy` signal that blocks when it also exceeds the safe signal.
pub const STRICT_SEXY: f64 = 0.50;
/// Strict mode: `Porn + Hentai + Sexy` sum that blocks alongside [`STRICT_SUM_CORE`].
pub const STRICT_SUM: f64 = 0.60;
/// Strict mode: core signal required for the sum branch.
pub const STRICT_SUM_CORE: f64 = 0.25;

/// Why a verdict came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerdictReason {
    /// Nothing triggered a block.
    Ok,
    /// The core (`Porn`/`Hentai`) branch fired.
    BlockedCore,
    /// The `Sexy` branch fired.
    BlockedSexy,
    /// The strict-mode sum branch fired.
    BlockedStrictSum,
    /// The text gate rejected the metadata.
    BlockedText,
    /// Classification failed and the gate is configured to fail open.
    ErrorFailOpen,
    /// Classification failed and the gate is configured to fail closed.
    ErrorFailClosed,
}

impl VerdictReason {
    /// Stable upper-case code for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BlockedCore => "BLOCKED_CORE",
            Self::BlockedSexy => "BLOCKED_SEXY",
            Self::BlockedStrictSum => "BLOCKED_STRICT_SUM",
            Self::BlockedText => "BLOCKED_TEXT",
            Self::ErrorFailOpen => "ERROR_FAIL_OPEN",
            Self::ErrorFailClosed => "ERROR_FAIL_CLOSED",
        }
    }

    /// `true` for the two classifier-error reasons.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::ErrorFailOpen | Self::ErrorFailClosed)
    }
}

impl fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of moderating one piece of content. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    /// Whether the content may be persisted and served.
    pub allowed: bool,
    /// Which branch produced the outcome.
    pub reason: VerdictReason,
    /// Aggregate scores, when classification ran.
    pub scores: Option<AggregateScore>,
}

impl Verdict {
    /// Allowed without classification (moderation disabled, text-only, …).
    #[must_use]
    pub const fn allow() -> Self {
        Self {
            allowed: true,
            reason: VerdictReason::Ok,
            scores: None,
        }
    }

    /// Verdict for a classification error under the given fail policy.
    #[must_use]
    pub const fn classifier_error(fail_open: bool) -> Self {
        Self {
            allowed: fail_open,
            reason: if fail_open {
                VerdictReason::ErrorFailOpen
            } else {
                VerdictReason::ErrorFailClosed
            },
            scores: None,
        }
    }

    /// Text gate rejection.
    #[must_use]
    pub const fn blocked_text() -> Self {
        Self {
            allowed: false,
            reason: VerdictReason::BlockedText,
            scores: None,
        }
    }
}

/// Applies a [`PolicyConfig`] to aggregate scores.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    /// Creates an engine over an already validated configuration.
    #[must_use]
    pub const fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// The configuration this engine applies.
    #[must_use]
    pub const fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Decides on `score`. Never returns one of the error reasons.
    #[must_use]
    pub fn decide(&self, score: &AggregateScore) -> Verdict {
        let reason = if self.config.disabled {
            VerdictReason::Ok
        } else if self.config.strict_mode {
            strict_reason(score)
        } else {
            default_reason(&self.config, score)
        };

        Verdict {
            allowed: reason == VerdictReason::Ok,
            reason,
            scores: Some(*score),
        }
    }
}

fn default_reason(config: &PolicyConfig, score: &AggregateScore) -> VerdictReason {
    let core = score.core();
    let sexy = score.get(Label::Sexy);
    let sfw = score.sfw();

    // 1) Core signal high and dominant over the safe signal
    if core >= config.block_core_threshold && core > sfw + config.core_margin {
        return VerdictReason::BlockedCore;
    }

    // 2) Sexy signal high and dominant over the safe signal
    if sexy >= config.block_sexy_threshold && sexy > sfw + config.sexy_margin {
        return VerdictReason::BlockedSexy;
    }

    VerdictReason::Ok
}

fn strict_reason(score: &AggregateScore) -> VerdictReason {
    let core = score.core();
    let sexy = score.get(Label::Sexy);
    let sfw = score.sfw();

    if core >= STRICT_CORE || (core >= STRICT_CORE_WEAK_SFW && sfw <= STRICT_WEAK_SFW) {
        return VerdictReason::BlockedCore;
    }
    if sexy >= STRICT_SEXY && sexy > sfw {
        return VerdictReason::BlockedSexy;
    }
    if score.explicit_sum() >= STRICT_SUM && core > STRICT_SUM_CORE {
        return VerdictReason::BlockedStrictSum;
    }

    VerdictReason::Ok
}
