// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pacing for the scan loop: the periodic gate a walker ticks against, and
//! the feedback law that re-tunes the gate after every pass.

use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Periodic signal bounding how fast a walker may advance through successive
/// blocks of descriptors within one pass.
///
/// Missed ticks are skipped, not bursted: a block that stalls must not be
/// followed by an unpaced sprint through the backlog.
pub struct Gate {
    interval: Interval,
}

impl Gate {
    #[must_use]
    pub fn new(period: Duration) -> Self {
        // tokio intervals reject a zero period
        let mut interval = time::interval(period.max(Duration::from_nanos(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    /// Wait for the next tick. The first tick resolves immediately.
    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.interval.period()
    }
}

/// Compute the gate period for the next pass from the one just measured.
///
/// Scales the current period by `target / elapsed`: a pass that overran its
/// budget gets a shorter period (tick faster, finish sooner), a pass with
/// headroom gets a longer one. The result is clamped into `[min, max]`; a
/// degenerate measurement (zero elapsed, non-finite ratio) yields `max`.
/// `min` must not exceed `max`.
#[must_use]
pub fn next_gate_period(
    current: Duration,
    elapsed: Duration,
    target: Duration,
    min: Duration,
    max: Duration,
) -> Duration {
    let scaled = current.as_secs_f64() * target.as_secs_f64() / elapsed.as_secs_f64();
    if !scaled.is_finite() {
        return max;
    }
    Duration::from_secs_f64(scaled.clamp(min.as_secs_f64(), max.as_secs_f64()))
}
