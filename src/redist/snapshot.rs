//! Helpers shared by the snapshot streaming strategies.

use crate::error::Result;
use crate::redist::rate_limiter::RateLimiter;
use crate::redist::replicator::Replicator;
use crate::types::OperationalMessage;
use std::time::Duration;
use tracing::debug;

const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(20);
const FINISH_POLL_INTERVAL: Duration = Duration::from_millis(10);
const RATE_LIMIT_INTERVAL_MS: u64 = 200;

/// Snapshot throttle for a replicator.
pub fn rate_limiter_for(rb: &Replicator) -> RateLimiter {
    RateLimiter::new(rb.effective_rate_limit_kbps() * 1000, RATE_LIMIT_INTERVAL_MS)
}

/// Queue a snapshot record, retrying while the queue refuses for up to the
/// configured max wait. The final attempt counts a refusal as a drop.
pub async fn send_with_retry(rb: &Replicator, msg: OperationalMessage) -> Result<()> {
    let max_tries = rb.config().max_wait_time.as_millis() / SEND_RETRY_INTERVAL.as_millis();
    for _ in 0..max_tries {
        if rb.is_stopped() {
            break;
        }
        if rb.send_request(msg.clone(), false, false).is_ok() {
            return Ok(());
        }
        tokio::time::sleep(SEND_RETRY_INTERVAL).await;
    }
    rb.send_request(msg, false, true)
}

/// Wait until every snapshot message has been accounted for, up to the
/// configured max wait. Returns whether the queue drained.
pub async fn wait_for_finish(rb: &Replicator) -> bool {
    if rb.is_snapshot_done() {
        return true;
    }
    let max_ticks = rb.config().max_wait_time.as_millis() / FINISH_POLL_INTERVAL.as_millis();
    let mut ticker = tokio::time::interval(FINISH_POLL_INTERVAL);
    ticker.tick().await;
    for _ in 0..max_ticks {
        ticker.tick().await;
        if rb.is_snapshot_done() {
            return true;
        }
    }
    debug!(shard_id = rb.shard_id(), "Timed out waiting for snapshot replies");
    false
}
