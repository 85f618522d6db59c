//! Moderation stats: lock-free counters shared by the gates and the orchestrator.
//!
//! Everything here is an atomic, so recording never blocks the submission
//! path. [`ModerationStats::snapshot`] copies the counters into plain structs
//! for logging or an API response.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::policy::{Verdict, VerdictReason};

/// EMA smoothing factor for classification latency.
const LATENCY_ALPHA: f64 = 0.1;

/// Latency of authoritative classifications (read, decode, inference).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LatencyStats {
    /// Most recent classification, in milliseconds.
    pub last_ms: f64,
    /// Exponential moving average, in milliseconds.
    pub avg_ms_ema: f64,
    /// Slowest classification observed, in milliseconds.
    pub max_ms: f64,
    /// Fastest classification observed, in milliseconds.
    pub min_ms: f64,
}

/// Verdicts by reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerdictBreakdown {
    /// `OK`
    pub ok: u64,
    /// `BLOCKED_CORE`
    pub blocked_core: u64,
    /// `BLOCKED_SEXY`
    pub blocked_sexy: u64,
    /// `BLOCKED_STRICT_SUM`
    pub blocked_strict_sum: u64,
    /// `BLOCKED_TEXT`
    pub blocked_text: u64,
    /// `ERROR_FAIL_OPEN`
    pub error_fail_open: u64,
    /// `ERROR_FAIL_CLOSED`
    pub error_fail_closed: u64,
}

/// Submission outcomes as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubmissionBreakdown {
    /// Posts and clips persisted.
    pub accepted: u64,
    /// Rejected by the text gate.
    pub rejected_text: u64,
    /// Rejected by the authoritative image gate.
    pub rejected_image: u64,
    /// Rejected before storage (missing fields, size, type, duration).
    pub rejected_invalid: u64,
    /// Failed with an error (storage or persistence).
    pub failed: u64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ModerationSnapshot {
    /// Milliseconds since the Unix epoch of the last update (0 if none).
    pub last_update_ms: u64,
    /// Verdicts by reason.
    pub verdicts: VerdictBreakdown,
    /// Submission outcomes.
    pub submissions: SubmissionBreakdown,
    /// Classifier-side errors (unavailable, decode, inference, timeout).
    pub classifier_errors: u64,
    /// Classification latency.
    pub latency: LatencyStats,
}

/// Shared counters. Cheap to record into from any task.
#[derive(Debug)]
pub struct ModerationStats {
    verdicts: [AtomicU64; 7],
    accepted: AtomicU64,
    rejected_text: AtomicU64,
    rejected_image: AtomicU64,
    rejected_invalid: AtomicU64,
    failed: AtomicU64,
    classifier_errors: AtomicU64,
    classifications: AtomicU64,
    latency_last: AtomicU64,
    latency_ema: AtomicU64,
    latency_max: AtomicU64,
    latency_min: AtomicU64,
    last_update_ms: AtomicU64,
}

impl Default for ModerationStats {
    fn default() -> Self {
        Self {
            verdicts: Default::default(),
            accepted: AtomicU64::new(0),
            rejected_text: AtomicU64::new(0),
            rejected_image: AtomicU64::new(0),
            rejected_invalid: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            classifier_errors: AtomicU64::new(0),
            classifications: AtomicU64::new(0),
            latency_last: AtomicU64::new(0),
            latency_ema: AtomicU64::new(0),
            latency_max: AtomicU64::new(0),
            latency_min: AtomicU64::new(f64::INFINITY.to_bits()),
            last_update_ms: AtomicU64::new(0),
        }
    }
}

impl ModerationStats {
    /// All counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one verdict.
    pub fn record_verdict(&self, verdict: &Verdict) {
        self.verdicts[reason_slot(verdict.reason)].fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Counts one classifier-side error.
    pub fn record_classifier_error(&self) {
        self.classifier_errors.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Records the duration of one authoritative classification.
    pub fn record_latency(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1_000.0;
        let first = self.classifications.fetch_add(1, Ordering::Relaxed) == 0;

        self.latency_last.store(ms.to_bits(), Ordering::Relaxed);
        update_f64(&self.latency_ema, |ema| {
            if first {
                ms
            } else {
                (1.0 - LATENCY_ALPHA).mul_add(ema, LATENCY_ALPHA * ms)
            }
        });
        update_f64(&self.latency_max, |max| max.max(ms));
        update_f64(&self.latency_min, |min| min.min(ms));
        self.touch();
    }

    /// Counts an accepted submission.
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Counts a text gate rejection.
    pub fn record_rejected_text(&self) {
        self.rejected_text.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Counts an image gate rejection.
    pub fn record_rejected_image(&self) {
        self.rejected_image.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Counts a request rejected by validation.
    pub fn record_rejected_invalid(&self) {
        self.rejected_invalid.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Counts a submission that ended in an error.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Copies the current counters.
    ///
    /// Counters are read one by one, so a snapshot taken under load may mix
    /// values from adjacent updates.
    #[must_use]
    pub fn snapshot(&self) -> ModerationSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let load_f64 = |c: &AtomicU64| f64::from_bits(c.load(Ordering::Relaxed));
        let verdict = |r: VerdictReason| load(&self.verdicts[reason_slot(r)]);

        let min = load_f64(&self.latency_min);
        ModerationSnapshot {
            last_update_ms: load(&self.last_update_ms),
            verdicts: VerdictBreakdown {
                ok: verdict(VerdictReason::Ok),
                blocked_core: verdict(VerdictReason::BlockedCore),
                blocked_sexy: verdict(VerdictReason::BlockedSexy),
                blocked_strict_sum: verdict(VerdictReason::BlockedStrictSum),
                blocked_text: verdict(VerdictReason::BlockedText),
                error_fail_open: verdict(VerdictReason::ErrorFailOpen),
                error_fail_closed: verdict(VerdictReason::ErrorFailClosed),
            },
            submissions: SubmissionBreakdown {
                accepted: load(&self.accepted),
                rejected_text: load(&self.rejected_text),
                rejected_image: load(&self.rejected_image),
                rejected_invalid: load(&self.rejected_invalid),
                failed: load(&self.failed),
            },
            classifier_errors: load(&self.classifier_errors),
            latency: LatencyStats {
                last_ms: load_f64(&self.latency_last),
                avg_ms_ema: load_f64(&self.latency_ema),
                max_ms: load_f64(&self.latency_max),
                min_ms: if min.is_finite() { min } else { 0.0 },
            },
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        let fresh = Self::default();
        let pairs = self
            .verdicts
            .iter()
            .zip(fresh.verdicts.iter())
            .chain([
                (&self.accepted, &fresh.accepted),
                (&self.rejected_text, &fresh.rejected_text),
                (&self.rejected_image, &fresh.rejected_image),
                (&self.rejected_invalid, &fresh.rejected_invalid),
                (&self.failed, &fresh.failed),
                (&self.classifier_errors, &fresh.classifier_errors),
                (&self.classifications, &fresh.classifications),
                (&self.latency_last, &fresh.latency_last),
                (&self.latency_ema, &fresh.latency_ema),
                (&self.latency_max, &fresh.latency_max),
                (&self.latency_min, &fresh.latency_min),
                (&self.last_update_ms, &fresh.last_update_ms),
            ]);
        for (counter, initial) in pairs {
            counter.store(initial.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    fn touch(&self) {
        self.last_update_ms
            .store(current_unix_time_ms(), Ordering::Relaxed);
    }
}

const fn reason_slot(reason: VerdictReason) -> usize {
    match reason {
        VerdictReason::Ok => 0,
        VerdictReason::BlockedCore => 1,
        VerdictReason::BlockedSexy => 2,
        VerdictReason::BlockedStrictSum => 3,
        VerdictReason::BlockedText => 4,
        VerdictReason::ErrorFailOpen => 5,
        VerdictReason::ErrorFailClosed => 6,
    }
}

fn update_f64(cell: &AtomicU64, f: impl Fn(f64) -> f64) {
    // The closure always returns `Some`, so the update cannot fail.
    let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
        Some(f(f64::from_bits(bits)).to_bits())
    });
}

/// Milliseconds since the Unix epoch; 0 if the clock is before it.
fn current_unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn new_stats_are_zero() {
        let snap = ModerationStats::new().snapshot();
        assert_eq!(snap, ModerationSnapshot::default());
    }

    #[test]
    fn verdicts_are_counted_by_reason() {
        let stats = ModerationStats::new();
        stats.record_verdict(&Verdict::allow());
        stats.record_verdict(&Verdict::allow());
        stats.record_verdict(&Verdict::blocked_text());
        stats.record_verdict(&Verdict::classifier_error(false));

        let snap = stats.snapshot();
        assert_eq!(snap.verdicts.ok, 2);
        assert_eq!(snap.verdicts.blocked_text, 1);
        assert_eq!(snap.verdicts.error_fail_closed, 1);
        assert_eq!(snap.verdicts.error_fail_open, 0);
        assert!(snap.last_update_ms > 0);
    }

    #[test]
    fn latency_tracks_last_min_max_and_ema() {
        let stats = ModerationStats::new();
        stats.record_latency(Duration::from_millis(100));
        let first = stats.snapshot().latency;
        assert!((first.avg_ms_ema - 100.0).abs() < 1e-9);

        stats.record_latency(Duration::from_millis(200));
        let lat = stats.snapshot().latency;
        assert!((lat.last_ms - 200.0).abs() < 1e-9);
        assert!((lat.max_ms - 200.0).abs() < 1e-9);
        assert!((lat.min_ms - 100.0).abs() < 1e-9);
        assert!((lat.avg_ms_ema - 110.0).abs() < 1e-9);
    }

    #[test]
    fn counters_are_safe_across_threads() {
        let stats = Arc::new(ModerationStats::new());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        stats.record_accepted();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().expect("worker");
        }
        assert_eq!(stats.snapshot().submissions.accepted, 8_000);
    }

    #[test]
    fn reset_clears_everything() {
        let stats = ModerationStats::new();
        stats.record_rejected_image();
        stats.record_classifier_error();
        stats.record_latency(Duration::from_millis(5));

        stats.reset();
        assert_eq!(stats.snapshot(), ModerationSnapshot::default());
    }
}
