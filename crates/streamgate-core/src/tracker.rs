//! Sampled per-stage execution timing.
//!
//! Requests are sampled by a deterministic hash of the thread
//! identifier, so every stage of a request is tracked or none is, and
//! every instance in the fleet makes the same decision for the same
//! identifier. Samples land in per-stage bounded rings; statistics are
//! computed over the most recent samples on demand.
//!
//! The sampling hash is SHA-256: the first eight digest bytes as a
//! big-endian integer, modulo 100, compared against `sample_rate * 100`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use sha2::{Digest, Sha256};

/// One recorded stage execution.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StageSample {
    /// Stage identifier ("1", "2", "2.1", ...).
    pub stage: String,
    /// Correlation key of the request.
    pub thread_id: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
    /// How the stage ended ("ok", "hit", "miss", "error", "cancelled", ...).
    pub outcome: String,
}

/// Aggregate statistics over recent samples of one stage.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StageStats {
    /// Number of samples aggregated.
    pub count: usize,
    /// Mean duration in milliseconds.
    pub mean_ms: f64,
    /// Median duration in milliseconds.
    pub p50_ms: f64,
    /// 95th percentile duration in milliseconds.
    pub p95_ms: f64,
    /// 99th percentile duration in milliseconds.
    pub p99_ms: f64,
}

/// Hash-sampled stage timing collector.
pub struct ExecutionTracker {
    sample_rate_bits: AtomicU64,
    ring_capacity: usize,
    buffers: Mutex<HashMap<String, VecDeque<StageSample>>>,
}

impl ExecutionTracker {
    /// Create a tracker with the given sampling rate and per-stage ring
    /// capacity.
    pub fn new(sample_rate: f64, ring_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            sample_rate_bits: AtomicU64::new(sample_rate.clamp(0.0, 1.0).to_bits()),
            ring_capacity: ring_capacity.max(1),
            buffers: Mutex::new(HashMap::new()),
        })
    }

    /// The current sampling rate.
    pub fn sample_rate(&self) -> f64 {
        f64::from_bits(self.sample_rate_bits.load(Ordering::Relaxed))
    }

    /// Adjust the sampling rate at runtime.
    pub fn set_sample_rate(&self, rate: f64) {
        self.sample_rate_bits
            .store(rate.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Whether samples are collected for this thread identifier.
    ///
    /// Deterministic: the same identifier gets the same answer for the
    /// request's whole lifecycle and on every instance.
    pub fn should_track(&self, thread_id: &str) -> bool {
        let threshold = (self.sample_rate() * 100.0).round() as u64;
        if threshold == 0 {
            return false;
        }
        bucket_of(thread_id) < threshold
    }

    /// Open a scoped timer for one stage of a request.
    ///
    /// The sample is recorded when the scope drops, on every exit path.
    /// A scope dropped without an explicit outcome records `cancelled`.
    pub fn stage(self: &Arc<Self>, thread_id: &str, stage_id: &str) -> StageScope {
        self.scope(thread_id, stage_id, self.should_track(thread_id))
    }

    /// Open a scope that records regardless of the sampling decision.
    pub fn stage_forced(self: &Arc<Self>, thread_id: &str, stage_id: &str) -> StageScope {
        self.scope(thread_id, stage_id, true)
    }

    fn scope(self: &Arc<Self>, thread_id: &str, stage_id: &str, enabled: bool) -> StageScope {
        StageScope {
            tracker: Arc::clone(self),
            stage_id: stage_id.to_string(),
            thread_id: thread_id.to_string(),
            started: Instant::now(),
            outcome: None,
            enabled,
        }
    }

    fn record(&self, sample: StageSample) {
        let mut buffers = self.buffers.lock().expect("tracker lock");
        let ring = buffers.entry(sample.stage.clone()).or_default();
        if ring.len() == self.ring_capacity {
            ring.pop_front();
        }
        ring.push_back(sample);
    }

    /// Aggregate the most recent `limit` samples of a stage.
    ///
    /// Returns `None` when no samples exist for the stage.
    pub fn statistics(&self, stage_id: &str, limit: usize) -> Option<StageStats> {
        let buffers = self.buffers.lock().expect("tracker lock");
        let ring = buffers.get(stage_id)?;
        if ring.is_empty() {
            return None;
        }

        let take = limit.min(ring.len()).max(1);
        let mut durations: Vec<f64> = ring
            .iter()
            .rev()
            .take(take)
            .map(|s| s.duration_ms)
            .collect();
        durations.sort_by(|a, b| a.partial_cmp(b).expect("finite durations"));

        let count = durations.len();
        let mean_ms = durations.iter().sum::<f64>() / count as f64;

        Some(StageStats {
            count,
            mean_ms,
            p50_ms: percentile(&durations, 50.0),
            p95_ms: percentile(&durations, 95.0),
            p99_ms: percentile(&durations, 99.0),
        })
    }

    /// Stage identifiers that currently hold samples, sorted.
    pub fn stage_ids(&self) -> Vec<String> {
        let buffers = self.buffers.lock().expect("tracker lock");
        let mut ids: Vec<String> = buffers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of samples held for a stage.
    pub fn sample_count(&self, stage_id: &str) -> usize {
        let buffers = self.buffers.lock().expect("tracker lock");
        buffers.get(stage_id).map_or(0, VecDeque::len)
    }
}

/// Hash bucket in `[0, 100)` for a thread identifier.
fn bucket_of(thread_id: &str) -> u64 {
    let digest = Sha256::digest(thread_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) % 100
}

/// Nearest-rank percentile over sorted data.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Scoped stage timer; records one sample when dropped.
pub struct StageScope {
    tracker: Arc<ExecutionTracker>,
    stage_id: String,
    thread_id: String,
    started: Instant,
    outcome: Option<String>,
    enabled: bool,
}

impl StageScope {
    /// Mark the stage as completed normally.
    pub fn complete(&mut self) {
        self.outcome = Some("ok".to_string());
    }

    /// Mark the stage as completed with a specific outcome tag.
    pub fn complete_with(&mut self, outcome: &str) {
        self.outcome = Some(outcome.to_string());
    }

    /// Mark the stage as failed.
    pub fn fail(&mut self) {
        self.outcome = Some("error".to_string());
    }
}

impl Drop for StageScope {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let sample = StageSample {
            stage: std::mem::take(&mut self.stage_id),
            thread_id: std::mem::take(&mut self.thread_id),
            duration_ms: self.started.elapsed().as_secs_f64() * 1000.0,
            outcome: self
                .outcome
                .take()
                .unwrap_or_else(|| "cancelled".to_string()),
        };
        self.tracker.record(sample);
    }
}
