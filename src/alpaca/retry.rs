// =============================================================================
// Retry helper — single home for backoff policy
// =============================================================================
//
// Idempotent GETs retry transient failures with exponential backoff (base
// 250ms, cap 4s) and ±20% jitter. Order submissions must never pass through
// here: a timed-out POST is reconciled by client order id, not retried.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use super::error::GatewayError;

const BACKOFF_BASE_MS: u64 = 250;
const BACKOFF_CAP_MS: u64 = 4_000;

/// Delay before retry `attempt` (0-based): `base * 2^attempt`, capped, with
/// ±20% jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(BACKOFF_CAP_MS) as f64;
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((capped * jitter) as u64)
}

/// Run an idempotent operation, retrying transient failures up to
/// `max_retries` times. Non-transient errors surface immediately.
pub async fn retry_idempotent<T, F, Fut>(
    label: &str,
    max_retries: u32,
    mut op: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = backoff_delay(attempt);
                warn!(
                    op = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient broker error — retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
