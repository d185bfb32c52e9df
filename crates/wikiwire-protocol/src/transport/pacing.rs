//! Request pacing
//!
//! Reads and writes are spaced independently: a burst of reads never delays
//! the next write and vice versa. The timestamp lock is released before the
//! wrapped transport is called, so a slow response does not hold up the
//! next caller's pacing check.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::{RawResponse, Transport};
use crate::config::PacingPolicy;
use crate::error::Result;
use crate::request::{RequestClass, WireRequest};

pub struct PacedTransport<T> {
    inner: T,
    policy: PacingPolicy,
    last_read: Mutex<Option<Instant>>,
    last_write: Mutex<Option<Instant>>,
}

impl<T: Transport> PacedTransport<T> {
    pub fn new(inner: T, policy: PacingPolicy) -> Self {
        Self {
            inner,
            policy,
            last_read: Mutex::new(None),
            last_write: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> PacingPolicy {
        self.policy
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Wait until `class` may send again and claim the slot.
    async fn wait_turn(&self, class: RequestClass) {
        let (slot, interval) = match class {
            RequestClass::Read => (&self.last_read, self.policy.read_interval),
            RequestClass::Write => (&self.last_write, self.policy.write_interval),
        };
        if interval.is_zero() {
            return;
        }

        let mut last = slot.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + interval;
            let now = Instant::now();
            if ready_at > now {
                let wait: Duration = ready_at - now;
                trace!("Pacing {class:?} request for {wait:?}");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait]
impl<T: Transport> Transport for PacedTransport<T> {
    async fn send(&self, request: &WireRequest) -> Result<RawResponse> {
        self.wait_turn(request.class()).await;
        self.inner.send(request).await
    }
}
