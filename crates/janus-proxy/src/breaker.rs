//! SRE-style adaptive circuit breaker guarding the retry loop.
//!
//! Tracks accepted vs total attempts over a sliding window and refuses
//! probabilistically once the accept rate falls below the target:
//!
//! ```text
//! drop_ratio = max(0, (total - k * accepted) / (total + 1))    k = 1 / success_ratio
//! ```
//!
//! Below the request threshold every attempt is admitted, so a cold
//! breaker never blocks.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use janus_core::{GatewayError, GatewayResult};

const WINDOW: Duration = Duration::from_secs(3);
const BUCKETS: u32 = 10;
const REQUEST_THRESHOLD: u64 = 100;

#[derive(Debug, Default, Clone, Copy)]
struct Bucket {
    accepted: u64,
    total: u64,
}

struct Window {
    buckets: VecDeque<(Instant, Bucket)>,
}

impl Window {
    fn new() -> Self {
        Self { buckets: VecDeque::with_capacity(BUCKETS as usize) }
    }

    fn bucket_width() -> Duration {
        WINDOW / BUCKETS
    }

    fn prune(&mut self, now: Instant) {
        while let Some((start, _)) = self.buckets.front() {
            if now.duration_since(*start) > WINDOW {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn current(&mut self, now: Instant) -> &mut Bucket {
        let needs_new = match self.buckets.back() {
            Some((start, _)) => now.duration_since(*start) >= Self::bucket_width(),
            None => true,
        };
        if needs_new {
            self.buckets.push_back((now, Bucket::default()));
        }
        &mut self.buckets.back_mut().expect("bucket just ensured").1
    }

    fn summary(&mut self, now: Instant) -> Bucket {
        self.prune(now);
        let mut sum = Bucket::default();
        for (_, bucket) in &self.buckets {
            sum.accepted += bucket.accepted;
            sum.total += bucket.total;
        }
        sum
    }
}

/// Adaptive breaker with a configurable success-ratio target.
pub struct SreBreaker {
    k: f64,
    request_threshold: u64,
    window: Mutex<Window>,
}

impl SreBreaker {
    /// A breaker aiming for the given success ratio (e.g. `0.8`).
    #[must_use]
    pub fn new(success_ratio: f64) -> Self {
        assert!(success_ratio > 0.0 && success_ratio <= 1.0, "success ratio out of range");
        Self {
            k: 1.0 / success_ratio,
            request_threshold: REQUEST_THRESHOLD,
            window: Mutex::new(Window::new()),
        }
    }

    #[cfg(test)]
    fn with_threshold(success_ratio: f64, request_threshold: u64) -> Self {
        Self { request_threshold, ..Self::new(success_ratio) }
    }

    /// Admit or refuse an attempt.
    ///
    /// # Errors
    ///
    /// [`GatewayError::BreakerOpen`] when the attempt is refused.
    pub fn allow(&self) -> GatewayResult<()> {
        let summary = self
            .window
            .lock()
            .expect("breaker window poisoned")
            .summary(Instant::now());
        if summary.total < self.request_threshold {
            return Ok(());
        }
        let drop_ratio =
            (summary.total as f64 - self.k * summary.accepted as f64) / (summary.total + 1) as f64;
        if drop_ratio <= 0.0 {
            return Ok(());
        }
        if rand::thread_rng().gen::<f64>() < drop_ratio {
            return Err(GatewayError::BreakerOpen);
        }
        Ok(())
    }

    /// Record an accepted (successful) attempt.
    pub fn mark_success(&self) {
        let mut window = self.window.lock().expect("breaker window poisoned");
        let now = Instant::now();
        window.prune(now);
        let bucket = window.current(now);
        bucket.accepted += 1;
        bucket.total += 1;
    }

    /// Record a failed attempt.
    pub fn mark_failed(&self) {
        let mut window = self.window.lock().expect("breaker window poisoned");
        let now = Instant::now();
        window.prune(now);
        let bucket = window.current(now);
        bucket.total += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cold_breaker_admits() {
        let breaker = SreBreaker::new(0.8);
        for _ in 0..50 {
            assert!(breaker.allow().is_ok());
        }
    }

    #[test]
    fn test_healthy_traffic_admits() {
        let breaker = SreBreaker::with_threshold(0.8, 10);
        for _ in 0..100 {
            breaker.mark_success();
        }
        for _ in 0..100 {
            assert!(breaker.allow().is_ok());
        }
    }

    #[test]
    fn test_failing_traffic_gets_refused() {
        let breaker = SreBreaker::with_threshold(0.8, 10);
        for _ in 0..200 {
            breaker.mark_failed();
        }
        // drop_ratio ≈ 1: a refusal within 100 tries is a statistical
        // certainty.
        let refused = (0..100).any(|_| breaker.allow().is_err());
        assert!(refused);
    }

    #[test]
    fn test_window_forgets_old_failures() {
        let breaker = SreBreaker::with_threshold(0.8, 10);
        for _ in 0..50 {
            breaker.mark_failed();
        }
        // Manually expire the window.
        {
            let mut window = breaker.window.lock().unwrap();
            for (start, _) in window.buckets.iter_mut() {
                *start -= WINDOW * 2;
            }
        }
        for _ in 0..50 {
            assert!(breaker.allow().is_ok());
        }
    }

    #[test]
    #[should_panic(expected = "success ratio out of range")]
    fn test_invalid_ratio_panics() {
        let _ = SreBreaker::new(0.0);
    }
}
