//! Outbound send throttling.
//!
//! Each send reserves the next free slot on a per-adapter schedule: slots are
//! `1 / per_second` apart and up to `capacity` of them may be claimed ahead
//! of time, which gives the burst. A caller that lands on a future slot
//! sleeps until it arrives. Reserving under the lock and sleeping outside it
//! keeps concurrent senders in arrival order.

use std::sync::Arc;
use std::time::Duration;

use agentmesh_core::UniversalMessage;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{Ack, Adapter, DeliveryResult, MessageStream};

/// Slowest schedule accepted from config; lower rates are raised to this.
const MAX_SEND_INTERVAL: Duration = Duration::from_secs(3600);

/// Throttles `send` on the wrapped adapter. `consume` is untouched.
pub struct RateLimitedAdapter {
    inner: Arc<dyn Adapter>,
    /// Gap between two consecutive slots.
    interval: Duration,
    /// How far ahead of now the schedule may run before callers wait.
    burst_window: Duration,
    /// The next unclaimed slot.
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimitedAdapter {
    /// A zero capacity counts as one. A non-positive or non-finite rate falls
    /// back to one send per second.
    pub fn new(inner: Arc<dyn Adapter>, capacity: u32, per_second: f64) -> Self {
        let interval = send_interval(per_second);
        let burst_window = interval
            .checked_mul(capacity.max(1) - 1)
            .unwrap_or(MAX_SEND_INTERVAL);
        Self {
            inner,
            interval,
            burst_window,
            next_slot: Mutex::new(None),
        }
    }

    /// Claim the next slot and return how long to wait for it.
    async fn reserve(&self) -> Duration {
        let now = Instant::now();
        let mut next_slot = self.next_slot.lock().await;
        let slot = match *next_slot {
            Some(slot) if slot > now => slot,
            _ => now,
        };
        *next_slot = Some(slot + self.interval);

        // A slot within the burst window may be used right away.
        let earliest = slot.checked_sub(self.burst_window).unwrap_or(now);
        earliest.saturating_duration_since(now)
    }
}

fn send_interval(per_second: f64) -> Duration {
    if !(per_second.is_finite() && per_second > 0.0) {
        warn!(per_second, "Invalid send rate, using one per second");
        return Duration::from_secs(1);
    }
    match Duration::try_from_secs_f64(1.0 / per_second) {
        Ok(d) if d <= MAX_SEND_INTERVAL => d,
        _ => {
            warn!(per_second, "Send rate too low, clamped to one per hour");
            MAX_SEND_INTERVAL
        }
    }
}

#[async_trait]
impl Adapter for RateLimitedAdapter {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn send(&self, message: &UniversalMessage, destination: &str) -> DeliveryResult<Ack> {
        let wait = self.reserve().await;
        if !wait.is_zero() {
            debug!(message_id = %message.id(), destination = %destination, wait_ms = wait.as_millis() as u64, "Send throttled");
            tokio::time::sleep(wait).await;
        }
        self.inner.send(message, destination).await
    }

    async fn consume(&self, subscription: &str) -> DeliveryResult<MessageStream> {
        self.inner.consume(subscription).await
    }
}
