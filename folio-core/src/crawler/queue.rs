/*!
Fixed-window rate limiting with a concurrency ceiling.

Every outbound workspace API call of one crawl goes through a single queue so
the aggregate request rate stays under the external limit, however many
branches are being expanded at once.
*/

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::trace;

use crate::config::CrawlerConfig;
use crate::observability;
use crate::{FolioError, Result};

#[derive(Debug, Default)]
struct Window {
    started: Option<Instant>,
    admitted: u32,
}

/// Admits at most `requests_per_window` calls per window, with at most
/// `max_concurrency` in flight
///
/// Admission is serialized: a caller holds the admission lock while it waits
/// for the next window, so waiters are admitted in arrival order. Execution is
/// not serialized; admitted calls run concurrently up to the ceiling.
#[derive(Debug)]
pub struct RateLimitedQueue {
    window: Mutex<Window>,
    permits: Semaphore,
    requests_per_window: u32,
    window_length: Duration,
    deadline: Option<Instant>,
    admitted: AtomicU64,
}

impl RateLimitedQueue {
    pub fn new(requests_per_window: u32, window_length: Duration, max_concurrency: usize) -> Self {
        Self {
            window: Mutex::new(Window::default()),
            permits: Semaphore::new(max_concurrency.max(1)),
            requests_per_window: requests_per_window.max(1),
            window_length,
            deadline: None,
            admitted: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self::new(config.requests_per_window, config.window(), config.max_concurrency)
    }

    /// Refuse admission at or after `deadline`, and cut in-flight calls off at it
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Number of calls admitted so far
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    fn deadline_error(&self, what: &str) -> FolioError {
        FolioError::DeadlineExceeded(format!("crawl deadline reached {what}"))
    }

    async fn admit(&self) -> Result<()> {
        let mut window = self.window.lock().await;
        loop {
            let now = Instant::now();
            if self.deadline.is_some_and(|deadline| now >= deadline) {
                return Err(self.deadline_error("before admission"));
            }

            match window.started {
                Some(started) if now < started + self.window_length => {
                    if window.admitted < self.requests_per_window {
                        window.admitted += 1;
                        break;
                    }
                    let next_window = started + self.window_length;
                    if self.deadline.is_some_and(|deadline| next_window >= deadline) {
                        return Err(self.deadline_error("while waiting for the rate window"));
                    }
                    trace!(wait_ms = (next_window - now).as_millis() as u64, "rate window full");
                    sleep_until(next_window).await;
                }
                _ => {
                    window.started = Some(now);
                    window.admitted = 1;
                    break;
                }
            }
        }

        self.admitted.fetch_add(1, Ordering::Relaxed);
        observability::record_crawler_request();
        Ok(())
    }

    /// Run `request` once a concurrency slot is free and the rate window admits it
    ///
    /// `request` is not polled before admission.
    pub async fn run<T, F>(&self, request: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = match self.deadline {
            Some(deadline) => timeout_at(deadline, self.permits.acquire())
                .await
                .map_err(|_| self.deadline_error("while waiting for a request slot"))?,
            None => self.permits.acquire().await,
        }
        .map_err(|_| FolioError::validation("request queue closed"))?;

        self.admit().await?;

        match self.deadline {
            Some(deadline) => timeout_at(deadline, request)
                .await
                .map_err(|_| self.deadline_error("during a request"))?,
            None => request.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_admission_is_throttled() {
        let queue = RateLimitedQueue::new(3, Duration::from_secs(1), 10);
        let start = Instant::now();

        let results = join_all((0..10).map(|i| queue.run(async move { Ok::<_, FolioError>(i) }))).await;

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(4));
        assert_eq!(queue.admitted(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_within_budget_is_immediate() {
        let queue = RateLimitedQueue::new(3, Duration::from_secs(1), 3);
        let start = Instant::now();

        join_all((0..3).map(|_| queue.run(async { Ok::<_, FolioError>(()) }))).await;

        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_ceiling() {
        let queue = RateLimitedQueue::new(100, Duration::from_secs(1), 2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..6).map(|_| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            queue.run(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, FolioError>(())
            })
        });
        join_all(tasks).await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_refuses_admission() {
        let queue = RateLimitedQueue::new(1, Duration::from_secs(1), 4)
            .with_deadline(Instant::now() + Duration::from_millis(1500));

        let results = join_all((0..3).map(|_| queue.run(async { Ok::<_, FolioError>(()) }))).await;

        let admitted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 2);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, FolioError::DeadlineExceeded(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_in_flight_request() {
        let queue = RateLimitedQueue::new(10, Duration::from_secs(1), 1)
            .with_deadline(Instant::now() + Duration::from_secs(5));

        let result = queue
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, FolioError>(())
            })
            .await;

        assert!(matches!(result, Err(FolioError::DeadlineExceeded(_))));
    }
}
