use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Minimum-interval gate for outbound provider calls. Callers awaiting
/// `wait()` are serialized and released at most once per interval, so a
/// burst of concurrent batch items still spaces its requests out.
pub struct RateGate {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        // The lock is held across the sleep on purpose.
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spaces_out_consecutive_calls() {
        let gate = RateGate::new(Duration::from_millis(50));
        let start = Instant::now();
        gate.wait().await;
        gate.wait().await;
        gate.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn zero_interval_is_a_noop() {
        let gate = RateGate::new(Duration::ZERO);
        let start = Instant::now();
        for _ in 0..100 {
            gate.wait().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
