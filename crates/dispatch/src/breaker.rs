use std::sync::Mutex;
use std::time::{Duration, Instant};
use wagate_core::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed {
        failures: u32,
        window_start: Instant,
    },
    Open {
        until: Instant,
    },
    HalfOpen {
        inflight: u32,
        successes: u32,
    },
}

/// Circuit breaker around the protocol client. Consecutive failures within
/// the interval trip it Open; after the timeout a bounded set of probes runs
/// HalfOpen, and enough successes close it again.
pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::Closed {
                failures: 0,
                window_start: Instant::now(),
            }),
            cfg,
        }
    }

    pub fn state(&self) -> BreakerState {
        match *self.inner.lock().unwrap() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Whether a request may proceed right now. Open circuits admit nothing
    /// until the timeout elapses; HalfOpen admits at most `max_requests`
    /// concurrent probes.
    pub fn allow(&self) -> bool {
        if !self.cfg.enabled {
            return true;
        }
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            Inner::Closed { .. } => true,
            Inner::Open { until } => {
                if Instant::now() >= *until {
                    *inner = Inner::HalfOpen {
                        inflight: 1,
                        successes: 0,
                    };
                    true
                } else {
                    false
                }
            }
            Inner::HalfOpen { inflight, .. } => {
                if *inflight < self.cfg.max_requests.max(1) {
                    *inflight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&self) {
        if !self.cfg.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            Inner::Closed {
                failures,
                window_start,
            } => {
                *failures = 0;
                *window_start = Instant::now();
            }
            Inner::HalfOpen {
                inflight,
                successes,
            } => {
                *successes += 1;
                *inflight = inflight.saturating_sub(1);
                if *successes >= self.cfg.success_threshold.max(1) {
                    *inner = Inner::Closed {
                        failures: 0,
                        window_start: Instant::now(),
                    };
                }
            }
            Inner::Open { .. } => {}
        }
    }

    pub fn on_failure(&self) {
        if !self.cfg.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let open_until = Instant::now() + Duration::from_secs(self.cfg.timeout_secs.max(1));
        match &mut *inner {
            Inner::Closed {
                failures,
                window_start,
            } => {
                // The failure window restarts once the interval passes.
                if window_start.elapsed() >= Duration::from_secs(self.cfg.interval_secs.max(1)) {
                    *failures = 0;
                    *window_start = Instant::now();
                }
                *failures += 1;
                if *failures >= self.cfg.failure_threshold.max(1) {
                    *inner = Inner::Open { until: open_until };
                }
            }
            Inner::HalfOpen { .. } => {
                *inner = Inner::Open { until: open_until };
            }
            Inner::Open { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(failure_threshold: u32, success_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            max_requests: 2,
            interval_secs: 60,
            timeout_secs: 1,
            failure_threshold,
            success_threshold,
        }
    }

    #[test]
    fn trips_open_after_threshold() {
        let breaker = CircuitBreaker::new(cfg(3, 1));
        assert!(breaker.allow());
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn success_resets_closed_counter() {
        let breaker = CircuitBreaker::new(cfg(2, 1));
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_probes_then_closes() {
        let breaker = CircuitBreaker::new(cfg(1, 2));
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.allow());
        // both probe slots are spent
        assert!(!breaker.allow());

        breaker.on_success();
        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(cfg(1, 2));
        breaker.on_failure();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(breaker.allow());
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn disabled_breaker_always_allows() {
        let mut c = cfg(1, 1);
        c.enabled = false;
        let breaker = CircuitBreaker::new(c);
        breaker.on_failure();
        breaker.on_failure();
        assert!(breaker.allow());
    }
}
