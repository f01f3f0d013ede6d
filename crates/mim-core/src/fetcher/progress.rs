//! Throttled progress reporting for long transfers.
//!
//! Consumers register a callback; the throttle forwards an update only when
//! both the minimum percentage step and the minimum interval have elapsed,
//! so a fast stream cannot flood the outbound adapter.

use std::time::{Duration, Instant};

/// One progress observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes_done: u64,
    pub total_bytes: Option<u64>,
    /// Whole percent when the total is known.
    pub percent: Option<u8>,
}

pub type ProgressFn = Box<dyn FnMut(Progress) + Send>;

/// Rate limiter in front of a progress callback.
pub struct ProgressThrottle {
    min_step: u8,
    min_interval: Duration,
    last_percent: Option<u8>,
    last_emit: Option<Instant>,
    sink: Option<ProgressFn>,
}

impl ProgressThrottle {
    pub fn new(min_step: u8, min_interval: Duration, sink: Option<ProgressFn>) -> Self {
        Self {
            min_step: min_step.max(1),
            min_interval,
            last_percent: None,
            last_emit: None,
            sink,
        }
    }

    /// A throttle that swallows everything (tests, headless runs).
    pub fn silent() -> Self {
        Self::new(5, Duration::from_secs(3), None)
    }

    /// Observe progress; forwards to the sink when the throttle allows.
    pub fn update(&mut self, bytes_done: u64, total_bytes: Option<u64>) {
        let percent = total_bytes.and_then(|t| {
            if t == 0 {
                None
            } else {
                Some(((bytes_done.saturating_mul(100)) / t).min(100) as u8)
            }
        });

        if !self.should_emit(percent) {
            return;
        }
        self.last_percent = percent;
        self.last_emit = Some(Instant::now());
        if let Some(sink) = &mut self.sink {
            sink(Progress {
                bytes_done,
                total_bytes,
                percent,
            });
        }
    }

    /// Force the terminal 100% notification through.
    pub fn finish(&mut self, bytes_done: u64, total_bytes: Option<u64>) {
        if let Some(sink) = &mut self.sink {
            sink(Progress {
                bytes_done,
                total_bytes,
                percent: total_bytes.map(|_| 100),
            });
        }
    }

    fn should_emit(&self, percent: Option<u8>) -> bool {
        let interval_ok = self
            .last_emit
            .map(|t| t.elapsed() >= self.min_interval)
            .unwrap_or(true);
        if !interval_ok {
            return false;
        }
        match (self.last_percent, percent) {
            (Some(last), Some(now)) => now.saturating_sub(last) >= self.min_step,
            // Unknown totals fall back to interval-only throttling.
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collecting() -> (ProgressThrottle, Arc<Mutex<Vec<Option<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let throttle = ProgressThrottle::new(
            10,
            Duration::ZERO,
            Some(Box::new(move |p: Progress| {
                sink_seen.lock().unwrap().push(p.percent);
            })),
        );
        (throttle, seen)
    }

    #[test]
    fn emits_only_on_step_boundaries() {
        let (mut t, seen) = collecting();
        for done in [1u64, 5, 9, 10, 15, 25, 99, 100] {
            t.update(done, Some(100));
        }
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![Some(1), Some(15), Some(25), Some(99)]);
    }

    #[test]
    fn interval_gates_unknown_totals() {
        let seen = Arc::new(Mutex::new(0usize));
        let sink_seen = Arc::clone(&seen);
        let mut t = ProgressThrottle::new(
            5,
            Duration::from_secs(60),
            Some(Box::new(move |_| {
                *sink_seen.lock().unwrap() += 1;
            })),
        );
        for done in 0..50u64 {
            t.update(done, None);
        }
        assert_eq!(*seen.lock().unwrap(), 1, "only the first update passes the interval gate");
    }

    #[test]
    fn finish_always_fires() {
        let (mut t, seen) = collecting();
        t.update(1, Some(100));
        t.finish(100, Some(100));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last().copied().flatten(), Some(100));
    }
}
