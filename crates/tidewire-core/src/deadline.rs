//! Sliding transfer deadline
//!
//! A send owns one [`SlidingDeadline`]. Each unit of forward progress renews
//! it, so only a stalled chunk fails, never a merely long message.

use core::future::Future;
use core::pin::Pin;
use core::time::Duration;

use tokio::time::{sleep_until, Instant, Sleep};

use crate::{Result, TidewireError};

/// A per-chunk timeout that is pushed back after every successful transfer
#[derive(Debug)]
pub struct SlidingDeadline {
    period: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
    renewals: u64,
}

impl SlidingDeadline {
    /// Start a deadline `period` from now; a zero period never expires
    pub fn new(period: Duration) -> Self {
        let sleep = if period.is_zero() {
            None
        } else {
            Some(Box::pin(sleep_until(Instant::now() + period)))
        };
        Self {
            period,
            sleep,
            renewals: 0,
        }
    }

    /// Whether this deadline can expire at all
    pub fn is_enabled(&self) -> bool {
        self.sleep.is_some()
    }

    /// Configured period
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of times the deadline was pushed back
    pub fn renewals(&self) -> u64 {
        self.renewals
    }

    /// Time left before expiry, or `None` when disabled
    pub fn remaining(&self) -> Option<Duration> {
        self.sleep
            .as_ref()
            .map(|sleep| sleep.deadline().saturating_duration_since(Instant::now()))
    }

    /// Push the deadline one full period past now
    pub fn renew(&mut self) {
        if let Some(sleep) = self.sleep.as_mut() {
            sleep.as_mut().reset(Instant::now() + self.period);
            self.renewals += 1;
        }
    }

    /// Run `fut` unless the deadline expires first
    pub async fn guard<F: Future>(&mut self, fut: F) -> Result<F::Output> {
        let period = self.period;
        match self.sleep.as_mut() {
            None => Ok(fut.await),
            Some(sleep) => {
                tokio::select! {
                    biased;
                    output = fut => Ok(output),
                    _ = sleep.as_mut() => Err(TidewireError::timeout(period)),
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
