use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-request timing and sizing report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub embedding_ms: f64,
    pub retrieval_ms: f64,
    pub generation_ms: f64,
    pub total_ms: f64,
    pub tokens_generated: Option<u64>,
    pub tokens_per_sec: Option<f64>,
    pub context_chars: usize,
    pub auto_top_k: usize,
    pub auto_max_tokens: u32,
    pub used_top_k: usize,
    pub used_max_tokens: u32,
    pub skipped_context: bool,
}

/// Milliseconds, two decimals
pub fn millis(elapsed: Duration) -> f64 {
    round_to(elapsed.as_secs_f64() * 1000.0, 2)
}

/// Tokens per second, one decimal. `None` without a count or a measurable
/// duration.
pub fn tokens_per_sec(tokens: Option<u64>, elapsed: Duration) -> Option<f64> {
    let tokens = tokens?;
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return None;
    }
    Some(round_to(tokens as f64 / secs, 1))
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
