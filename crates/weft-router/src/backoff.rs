use std::time::Duration;

/// Exponential backoff for the given zero-based attempt, capped at `max_ms`,
/// with 0.8x to 1.2x jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(max_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}
