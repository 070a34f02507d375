use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Trailing-edge debouncer: only the most recent call runs, and only its
/// result is delivered.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    generation: Arc<AtomicU64>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Waits out the delay, then runs `task`.
    ///
    /// Returns `None` when a newer call arrived before the delay elapsed
    /// (the task never runs) or while the task was running (its output is
    /// dropped).
    pub async fn run<F, Fut, T>(&self, task: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        tokio::time::sleep(self.delay).await;
        if !self.is_current(ticket) {
            return None;
        }

        let output = task().await;
        self.is_current(ticket).then_some(output)
    }

    /// Supersedes whatever is pending.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn is_current(&self, ticket: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_latest_call_wins() {
        let debouncer = Debouncer::new(Duration::from_millis(150));
        let runs = Arc::new(AtomicUsize::new(0));

        let first = {
            let debouncer = debouncer.clone();
            let runs = Arc::clone(&runs);
            tokio::spawn(async move {
                debouncer
                    .run(|| async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        "first"
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = {
            let debouncer = debouncer.clone();
            let runs = Arc::clone(&runs);
            tokio::spawn(async move {
                debouncer
                    .run(|| async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        "second"
                    })
                    .await
            })
        };

        assert_eq!(first.await.unwrap(), None);
        assert_eq!(second.await.unwrap(), Some("second"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_dropped_when_superseded_mid_flight() {
        let debouncer = Debouncer::new(Duration::from_millis(150));

        let slow = {
            let debouncer = debouncer.clone();
            tokio::spawn(async move {
                debouncer
                    .run(|| async {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        "slow"
                    })
                    .await
            })
        };
        // Past the delay, so the slow task is already running
        tokio::time::sleep(Duration::from_millis(200)).await;
        debouncer.cancel();

        assert_eq!(slow.await.unwrap(), None);
    }
}
