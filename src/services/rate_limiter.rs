use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Sliding-window limiter: at most `max_requests` grants in any `window`.
///
/// Not synchronized; the admission controller owns it behind its own lock.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    grants: VecDeque<Instant>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        let max_requests = max_requests as usize;
        Self {
            max_requests,
            window,
            grants: VecDeque::with_capacity(max_requests),
        }
    }

    /// Take one permit if the window has room.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.evict(now);
        if self.grants.len() < self.max_requests {
            self.grants.push_back(now);
            true
        } else {
            false
        }
    }

    /// Permits still available in the current window.
    pub fn available(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.max_requests - self.grants.len()
    }

    /// Time until the next permit frees up, `None` if one is available now.
    pub fn retry_after(&mut self, now: Instant) -> Option<Duration> {
        self.evict(now);
        if self.grants.len() < self.max_requests {
            return None;
        }
        self.grants
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.grants.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grants_up_to_limit_within_window() {
        let start = Instant::now();
        let mut limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.try_acquire(start));
        assert!(limiter.try_acquire(start + Duration::from_secs(1)));
        assert!(limiter.try_acquire(start + Duration::from_secs(2)));
        assert!(!limiter.try_acquire(start + Duration::from_secs(3)));
        assert_eq!(limiter.available(start + Duration::from_secs(3)), 0);
    }

    #[test]
    fn test_window_slides() {
        let start = Instant::now();
        let mut limiter = SlidingWindowLimiter::new(2, Duration::from_secs(10));
        assert!(limiter.try_acquire(start));
        assert!(limiter.try_acquire(start + Duration::from_secs(4)));
        assert_eq!(
            limiter.retry_after(start + Duration::from_secs(5)),
            Some(Duration::from_secs(5))
        );
        assert!(!limiter.try_acquire(start + Duration::from_secs(9)));
        assert!(limiter.try_acquire(start + Duration::from_secs(10)));
        assert!(!limiter.try_acquire(start + Duration::from_secs(13)));
        assert!(limiter.try_acquire(start + Duration::from_secs(14)));
    }

    #[test]
    fn test_retry_after_none_when_available() {
        let start = Instant::now();
        let mut limiter = SlidingWindowLimiter::new(1, Duration::from_secs(1));
        assert_eq!(limiter.retry_after(start), None);
    }
}
