use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default averaging window.
pub const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Upper bound on retained samples, whatever the window.
const MAX_SAMPLES: usize = 128;

/// Sliding-window throughput estimate.
///
/// Each sample stores the running byte total, so the rate over the window is
/// the difference between the newest and oldest sample. Lanes (sender) and
/// chunk handlers (receiver) record concurrently.
#[derive(Debug)]
pub struct SpeedCalculator {
    window: Duration,
    state: Mutex<Window>,
}

#[derive(Debug, Default)]
struct Window {
    total: u64,
    samples: VecDeque<(Instant, u64)>,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::with_window(SPEED_WINDOW)
    }
}

impl SpeedCalculator {
    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::default(),
        }
    }

    /// Records `bytes` completed now.
    pub fn record(&self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&self, now: Instant, bytes: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.total = state.total.saturating_add(bytes);
        let total = state.total;
        state.samples.push_back((now, total));

        // Keep one sample at or before the cutoff as the window's baseline.
        while state.samples.len() > 2
            && state
                .samples
                .get(1)
                .is_some_and(|(at, _)| now.duration_since(*at) >= self.window)
        {
            state.samples.pop_front();
        }
        while state.samples.len() > MAX_SAMPLES {
            state.samples.pop_front();
        }
    }

    /// Bytes per second across the window; 0.0 until two samples exist.
    pub fn bytes_per_second(&self) -> f64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (Some((first_at, first_total)), Some((last_at, last_total))) =
            (state.samples.front(), state.samples.back())
        else {
            return 0.0;
        };
        let elapsed = last_at.duration_since(*first_at);
        if elapsed.is_zero() {
            return 0.0;
        }
        (last_total - first_total) as f64 / elapsed.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn needs_two_samples() {
        let calc = SpeedCalculator::default();
        assert_eq!(calc.bytes_per_second(), 0.0);
        calc.record(1024);
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn rate_over_known_interval() {
        let calc = SpeedCalculator::default();
        let start = Instant::now();
        calc.record_at(start, 1_000);
        calc.record_at(start + Duration::from_millis(500), 1_000);
        calc.record_at(start + Duration::from_secs(1), 2_000);

        // The first sample is the baseline; 3000 bytes follow it in 1 s.
        assert!((calc.bytes_per_second() - 3_000.0).abs() < 1e-6);
    }

    #[test]
    fn old_samples_leave_the_window() {
        let calc = SpeedCalculator::with_window(Duration::from_secs(2));
        let start = Instant::now();
        calc.record_at(start, 0);
        calc.record_at(start + Duration::from_secs(1), 1_000_000);
        calc.record_at(start + Duration::from_secs(10), 100);
        calc.record_at(start + Duration::from_secs(11), 100);

        // Only the slow tail remains.
        assert!(calc.bytes_per_second() < 1_000.0);
    }

    #[test]
    fn sample_count_is_bounded() {
        let calc = SpeedCalculator::with_window(Duration::from_secs(3600));
        let start = Instant::now();
        for i in 0..1_000u64 {
            calc.record_at(start + Duration::from_millis(i), 1);
        }
        let state = calc.state.lock().unwrap();
        assert!(state.samples.len() <= MAX_SAMPLES);
        assert_eq!(state.total, 1_000);
    }

    #[test]
    fn concurrent_recording() {
        let calc = Arc::new(SpeedCalculator::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let calc = Arc::clone(&calc);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        calc.record(1);
                        let _ = calc.bytes_per_second();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(calc.state.lock().unwrap().total, 800);
    }
}
