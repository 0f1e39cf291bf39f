use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentmesh_core::config::CircuitBreakerConfig;
use agentmesh_core::{DeliveryError, UniversalMessage};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{Ack, Adapter, DeliveryResult, MessageStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
}

/// Stops sending to a transport that keeps failing.
///
/// Only transient errors count as failures; a rejected or missing
/// destination says nothing about the transport's health. While open, sends
/// fail at once with `DeliveryError::Connection`. After `recovery_timeout`
/// sends are let through again (half-open); enough successes close the
/// circuit, any failure reopens it.
pub struct CircuitBreakerAdapter {
    inner: Arc<dyn Adapter>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_successes: u32,
    breaker: Mutex<Breaker>,
}

impl CircuitBreakerAdapter {
    pub fn new(inner: Arc<dyn Adapter>, config: &CircuitBreakerConfig) -> Self {
        Self {
            inner,
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: Duration::from_millis(config.recovery_timeout_ms),
            half_open_successes: config.half_open_successes.max(1),
            breaker: Mutex::new(Breaker {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Breaker> {
        self.breaker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decide whether a send may go out, moving open to half-open once the
    /// recovery timeout has passed.
    fn admit(&self) -> DeliveryResult<()> {
        let mut b = self.lock();
        if b.state != CircuitState::Open {
            return Ok(());
        }
        let recovered = b
            .opened_at
            .map_or(true, |at| at.elapsed() >= self.recovery_timeout);
        if recovered {
            b.state = CircuitState::HalfOpen;
            b.successes = 0;
            info!(kind = self.inner.kind(), "Circuit half-open, trying a send");
            Ok(())
        } else {
            Err(DeliveryError::Connection(format!(
                "circuit open for {} adapter",
                self.inner.kind()
            )))
        }
    }

    fn on_success(&self) {
        let mut b = self.lock();
        match b.state {
            CircuitState::Closed => b.failures = 0,
            CircuitState::HalfOpen => {
                b.successes += 1;
                if b.successes >= self.half_open_successes {
                    b.state = CircuitState::Closed;
                    b.failures = 0;
                    b.successes = 0;
                    b.opened_at = None;
                    info!(kind = self.inner.kind(), "Circuit closed");
                }
            }
            // A send admitted before another one reopened the circuit.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut b = self.lock();
        b.failures += 1;
        let trips = match b.state {
            CircuitState::Closed => b.failures >= self.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trips {
            b.state = CircuitState::Open;
            b.opened_at = Some(Instant::now());
            b.successes = 0;
            warn!(kind = self.inner.kind(), failures = b.failures, "Circuit opened");
        }
    }
}

#[async_trait]
impl Adapter for CircuitBreakerAdapter {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn send(&self, message: &UniversalMessage, destination: &str) -> DeliveryResult<Ack> {
        if let Err(e) = self.admit() {
            debug!(message_id = %message.id(), destination = %destination, "Send rejected by open circuit");
            return Err(e);
        }
        let result = self.inner.send(message, destination).await;
        match &result {
            Ok(_) => self.on_success(),
            Err(e) if e.is_transient() => self.on_failure(),
            Err(_) => self.on_success(),
        }
        result
    }

    async fn consume(&self, subscription: &str) -> DeliveryResult<MessageStream> {
        self.inner.consume(subscription).await
    }
}
