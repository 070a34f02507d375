use crate::backend::AnalysisBackend;
use futures::stream::{FuturesUnordered, StreamExt};
use ocss_core::{
    AnalysisJob, CoreError, ErrorExt, JobError, JobStage, PollingConfig, ProgressResponse,
    ProgressUpdate,
};
use parking_lot::ReentrantMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub interval: Duration,
    /// Consecutive transient failures tolerated; a success resets the count.
    pub max_consecutive_failures: u32,
    pub max_wait: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::from(&PollingConfig::default())
    }
}

impl From<&PollingConfig> for PollConfig {
    fn from(config: &PollingConfig) -> Self {
        Self {
            interval: config.interval(),
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            max_wait: config.max_wait(),
        }
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    /// The job reached `done`; carries its final state.
    Completed(AnalysisJob),
    Failed(CoreError),
    Cancelled,
}

/// Applies poll responses in sequence order.
///
/// Each poll is tagged with a sequence number when issued; a response whose
/// number is not above the highest applied one is dropped.
#[derive(Debug)]
pub struct ProgressTracker {
    job: AnalysisJob,
    highest_seq: u64,
}

impl ProgressTracker {
    pub fn new(job: AnalysisJob) -> Self {
        Self {
            job,
            highest_seq: 0,
        }
    }

    pub fn observe(&mut self, seq: u64, response: &ProgressResponse) -> Option<ProgressUpdate> {
        if seq <= self.highest_seq {
            debug!(
                "Dropping stale progress for job {} (poll {} <= {})",
                self.job.job_id, seq, self.highest_seq
            );
            return None;
        }
        self.highest_seq = seq;
        self.job.observe(response)
    }

    pub fn is_stale(&self, seq: u64) -> bool {
        seq <= self.highest_seq
    }

    pub fn job(&self) -> &AnalysisJob {
        &self.job
    }

    fn fail(&mut self, message: String) -> Option<ProgressUpdate> {
        self.job.fail(message)
    }

    fn into_job(self) -> AnalysisJob {
        self.job
    }
}

/// Serializes callback delivery against cancellation.
///
/// Once `cancel` returns, no callback is running and none will start. The
/// lock is reentrant so a callback may cancel its own poller.
struct DispatchGate {
    cancelled: AtomicBool,
    lock: ReentrantMutex<()>,
    wake: Notify,
}

impl DispatchGate {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            lock: ReentrantMutex::new(()),
            wake: Notify::new(),
        }
    }

    fn cancel(&self) {
        {
            let _guard = self.lock.lock();
            self.cancelled.store(true, Ordering::SeqCst);
        }
        self.wake.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn dispatch(&self, deliver: impl FnOnce()) -> bool {
        let _guard = self.lock.lock();
        if self.is_cancelled() {
            return false;
        }
        deliver();
        true
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.wake.notified().await;
    }
}

/// Cloneable cancel-only view of a [`PollHandle`].
#[derive(Clone)]
pub struct PollCanceller {
    gate: Arc<DispatchGate>,
}

impl PollCanceller {
    pub fn cancel(&self) {
        self.gate.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.gate.is_cancelled()
    }
}

/// Handle to a running poll loop. Dropping it does not stop polling; call
/// [`PollHandle::cancel`].
pub struct PollHandle {
    job_id: String,
    gate: Arc<DispatchGate>,
    task: JoinHandle<PollOutcome>,
}

impl PollHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn cancel(&self) {
        self.gate.cancel();
    }

    pub fn canceller(&self) -> PollCanceller {
        PollCanceller {
            gate: Arc::clone(&self.gate),
        }
    }

    pub async fn finished(self) -> PollOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => PollOutcome::Cancelled,
            Err(e) => PollOutcome::Failed(CoreError::Internal {
                message: format!("poll task for job {} panicked: {}", self.job_id, e),
            }),
        }
    }
}

#[derive(Clone)]
pub struct ProgressPoller {
    backend: Arc<dyn AnalysisBackend>,
    config: PollConfig,
}

impl ProgressPoller {
    pub fn new(backend: Arc<dyn AnalysisBackend>, config: PollConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Polls `GET /api/progress/{job_id}` every interval until the job is
    /// done, fails, or the handle is cancelled.
    ///
    /// The first poll happens one interval after the call. `on_update` sees
    /// a non-decreasing percentage and at most one terminal update.
    pub fn watch<F>(&self, job: AnalysisJob, on_update: F) -> PollHandle
    where
        F: FnMut(ProgressUpdate) + Send + 'static,
    {
        let gate = Arc::new(DispatchGate::new());
        let job_id = job.job_id.clone();
        let task = tokio::spawn(poll_loop(
            Arc::clone(&self.backend),
            self.config.clone(),
            job,
            Arc::clone(&gate),
            on_update,
        ));
        PollHandle { job_id, gate, task }
    }
}

async fn poll_loop<F>(
    backend: Arc<dyn AnalysisBackend>,
    config: PollConfig,
    job: AnalysisJob,
    gate: Arc<DispatchGate>,
    mut on_update: F,
) -> PollOutcome
where
    F: FnMut(ProgressUpdate) + Send + 'static,
{
    let job_id = job.job_id.clone();
    let started = Instant::now();
    let deadline = tokio::time::sleep_until(started + config.max_wait);
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval_at(started + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut tracker = ProgressTracker::new(job);
    let mut in_flight = FuturesUnordered::new();
    let mut next_seq: u64 = 0;
    let mut consecutive_failures: u32 = 0;

    debug!("Polling progress for job {}", job_id);

    loop {
        tokio::select! {
            _ = gate.cancelled() => {
                debug!("Polling for job {} cancelled", job_id);
                return PollOutcome::Cancelled;
            }
            _ = &mut deadline => {
                warn!("Job {} still not finished after {:?}", job_id, config.max_wait);
                let error = JobError::PollTimeout {
                    job_id: job_id.clone(),
                    waited_secs: config.max_wait.as_secs(),
                };
                let message = error.to_string();
                return finish_with_error(&gate, &mut on_update, &mut tracker, message, error.into());
            }
            _ = ticker.tick() => {
                if !in_flight.is_empty() {
                    debug!("Previous progress poll for job {} still in flight, skipping tick", job_id);
                    continue;
                }
                next_seq += 1;
                let seq = next_seq;
                let backend = Arc::clone(&backend);
                let id = job_id.clone();
                in_flight.push(async move { (seq, backend.job_progress(&id).await) });
            }
            Some((seq, result)) = in_flight.next(), if !in_flight.is_empty() => {
                if gate.is_cancelled() {
                    return PollOutcome::Cancelled;
                }
                match result {
                    Ok(response) => {
                        consecutive_failures = 0;
                        let Some(update) = tracker.observe(seq, &response) else {
                            continue;
                        };
                        let stage = update.stage;
                        let message = update.message.clone();
                        if !gate.dispatch(|| on_update(update)) {
                            return PollOutcome::Cancelled;
                        }
                        match stage {
                            JobStage::Done => {
                                info!("Job {} finished", job_id);
                                return PollOutcome::Completed(tracker.into_job());
                            }
                            JobStage::Error => {
                                warn!("Job {} failed: {}", job_id, message);
                                return PollOutcome::Failed(
                                    JobError::JobFailed {
                                        job_id: job_id.clone(),
                                        message,
                                    }
                                    .into(),
                                );
                            }
                            _ => {}
                        }
                    }
                    Err(e) if tracker.is_stale(seq) => {
                        debug!("Ignoring failure of superseded poll {} for job {}: {}", seq, job_id, e);
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        let transient = e.is_retryable();
                        warn!(
                            "Progress poll {} for job {} failed ({}/{}, transient: {}): {}",
                            seq, job_id, consecutive_failures, config.max_consecutive_failures, transient, e
                        );
                        if !transient || consecutive_failures >= config.max_consecutive_failures {
                            let message = e.user_friendly_message();
                            let error = JobError::PollFailed {
                                job_id: job_id.clone(),
                                reason: message.clone(),
                            };
                            return finish_with_error(&gate, &mut on_update, &mut tracker, message, error.into());
                        }
                    }
                }
            }
        }
    }
}

/// Delivers the single terminal error update, unless cancelled first.
fn finish_with_error<F>(
    gate: &DispatchGate,
    on_update: &mut F,
    tracker: &mut ProgressTracker,
    message: String,
    error: CoreError,
) -> PollOutcome
where
    F: FnMut(ProgressUpdate),
{
    if let Some(update) = tracker.fail(message) {
        if !gate.dispatch(|| on_update(update)) {
            return PollOutcome::Cancelled;
        }
    }
    PollOutcome::Failed(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{progress, ScriptedAnalysis};
    use ocss_core::{ApiError, JobKind};
    use parking_lot::Mutex;

    fn config() -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(1000),
            max_consecutive_failures: 3,
            max_wait: Duration::from_secs(60),
        }
    }

    fn recorder() -> (
        Arc<Mutex<Vec<ProgressUpdate>>>,
        impl FnMut(ProgressUpdate) + Send + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |update| sink.lock().push(update))
    }

    fn job() -> AnalysisJob {
        AnalysisJob::submitted("job-1", JobKind::TopicClustering)
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_done() {
        let backend = ScriptedAnalysis::new();
        backend.push_progress(Duration::ZERO, Ok(progress("running", 0.4)));
        backend.push_progress(Duration::ZERO, Ok(progress("done", 1.0)));

        let poller = ProgressPoller::new(backend.clone(), config());
        let (seen, on_update) = recorder();
        let outcome = poller.watch(job(), on_update).finished().await;

        let job = match outcome {
            PollOutcome::Completed(job) => job,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(job.stage, JobStage::Done);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].stage, JobStage::Running);
        assert_eq!(seen[0].percent, 0.4);
        assert_eq!(seen[1].stage, JobStage::Done);
        assert_eq!(backend.progress_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_percent_never_decreases() {
        let backend = ScriptedAnalysis::new();
        for (stage, pct) in [("running", 0.3), ("running", 0.7), ("running", 0.5), ("done", 1.0)] {
            backend.push_progress(Duration::ZERO, Ok(progress(stage, pct)));
        }

        let poller = ProgressPoller::new(backend, config());
        let (seen, on_update) = recorder();
        poller.watch(job(), on_update).finished().await;

        let percents: Vec<f64> = seen.lock().iter().map(|u| u.percent).collect();
        assert_eq!(percents, vec![0.3, 0.7, 0.7, 1.0]);
    }

    #[test]
    fn test_stale_response_never_overwrites_newer() {
        let mut tracker = ProgressTracker::new(job());
        assert!(tracker.observe(2, &progress("running", 0.6)).is_some());
        assert!(tracker.is_stale(1));
        assert!(tracker.observe(1, &progress("running", 0.3)).is_none());
        assert!(tracker.observe(2, &progress("done", 1.0)).is_none());
        assert_eq!(tracker.job().progress_percent, 0.6);
        assert_eq!(tracker.job().stage, JobStage::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_poll_holds_back_the_next_tick() {
        let backend = ScriptedAnalysis::new();
        // In flight from 1.0s to 2.5s; the 2.0s tick is skipped
        backend.push_progress(Duration::from_millis(1500), Ok(progress("running", 0.3)));
        backend.push_progress(Duration::ZERO, Ok(progress("running", 0.6)));
        backend.push_progress(Duration::ZERO, Ok(progress("done", 1.0)));

        let poller = ProgressPoller::new(backend.clone(), config());
        let (seen, on_update) = recorder();
        let handle = poller.watch(job(), on_update);

        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert_eq!(backend.progress_calls(), 1);

        assert!(matches!(handle.finished().await, PollOutcome::Completed(_)));
        let percents: Vec<f64> = seen.lock().iter().map(|u| u.percent).collect();
        assert_eq!(percents, vec![0.3, 0.6, 1.0]);
        assert_eq!(backend.progress_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_more_than_one_poll_in_flight() {
        let backend = ScriptedAnalysis::new();
        for _ in 0..10 {
            backend.push_progress(Duration::from_secs(10), Ok(progress("running", 0.1)));
        }

        let poller = ProgressPoller::new(backend.clone(), config());
        let (seen, on_update) = recorder();
        let handle = poller.watch(job(), on_update);

        tokio::time::sleep(Duration::from_millis(8500)).await;
        assert_eq!(backend.progress_calls(), 1);
        assert!(seen.lock().is_empty());

        // First response lands at 11s and the next tick starts poll 2
        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert_eq!(backend.progress_calls(), 2);
        assert_eq!(seen.lock().len(), 1);

        handle.cancel();
        assert!(matches!(handle.finished().await, PollOutcome::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_update_after_cancel_even_if_response_lands_later() {
        let backend = ScriptedAnalysis::new();
        backend.push_progress(Duration::from_millis(500), Ok(progress("running", 0.4)));

        let poller = ProgressPoller::new(backend.clone(), config());
        let (seen, on_update) = recorder();
        let handle = poller.watch(job(), on_update);

        // First poll is in flight between 1.0s and 1.5s
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(backend.progress_calls(), 1);
        handle.cancel();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(handle.finished().await, PollOutcome::Cancelled));
        assert!(seen.lock().is_empty());
        assert_eq!(backend.progress_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_may_cancel_its_own_poller() {
        let backend = ScriptedAnalysis::new();
        backend.push_progress(Duration::ZERO, Ok(progress("running", 0.1)));
        backend.push_progress(Duration::ZERO, Ok(progress("running", 0.2)));

        let poller = ProgressPoller::new(backend, config());
        let slot: Arc<Mutex<Option<PollCanceller>>> = Arc::new(Mutex::new(None));
        let seen = Arc::new(Mutex::new(0usize));

        let cancel_slot = Arc::clone(&slot);
        let counter = Arc::clone(&seen);
        let handle = poller.watch(job(), move |_| {
            *counter.lock() += 1;
            if let Some(canceller) = cancel_slot.lock().as_ref() {
                canceller.cancel();
            }
        });
        *slot.lock() = Some(handle.canceller());

        assert!(matches!(handle.finished().await, PollOutcome::Cancelled));
        assert_eq!(*seen.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_transient_failures_end_with_single_error() {
        let backend = ScriptedAnalysis::new();
        backend.push_progress(Duration::ZERO, Ok(progress("running", 0.2)));
        for _ in 0..3 {
            backend.push_progress(
                Duration::ZERO,
                Err(ApiError::Status {
                    status_code: 503,
                    message: "Request failed with status 503".to_string(),
                }
                .into()),
            );
        }

        let poller = ProgressPoller::new(backend.clone(), config());
        let (seen, on_update) = recorder();
        let outcome = poller.watch(job(), on_update).finished().await;

        assert!(matches!(
            outcome,
            PollOutcome::Failed(CoreError::Job(JobError::PollFailed { .. }))
        ));
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].stage, JobStage::Error);
        assert_eq!(seen[1].message, "Request failed with status 503");
        assert_eq!(backend.progress_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let backend = ScriptedAnalysis::new();
        let unavailable = || -> Result<ProgressResponse, CoreError> {
            Err(ApiError::RequestTimeout {
                endpoint: "/api/progress".to_string(),
            }
            .into())
        };
        backend.push_progress(Duration::ZERO, unavailable());
        backend.push_progress(Duration::ZERO, unavailable());
        backend.push_progress(Duration::ZERO, Ok(progress("running", 0.5)));
        backend.push_progress(Duration::ZERO, unavailable());
        backend.push_progress(Duration::ZERO, unavailable());
        backend.push_progress(Duration::ZERO, Ok(progress("done", 1.0)));

        let poller = ProgressPoller::new(backend, config());
        let (_seen, on_update) = recorder();
        let outcome = poller.watch(job(), on_update).finished().await;
        assert!(matches!(outcome, PollOutcome::Completed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_job_fails_immediately() {
        let backend = ScriptedAnalysis::new();
        backend.push_progress(
            Duration::ZERO,
            Err(ApiError::Status {
                status_code: 404,
                message: "Job not found".to_string(),
            }
            .into()),
        );

        let poller = ProgressPoller::new(backend.clone(), config());
        let (seen, on_update) = recorder();
        let outcome = poller.watch(job(), on_update).finished().await;

        assert!(matches!(outcome, PollOutcome::Failed(_)));
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(backend.progress_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_error_stage_is_terminal() {
        let backend = ScriptedAnalysis::new();
        backend.push_progress(Duration::ZERO, Ok(progress("error", 0.2)));

        let poller = ProgressPoller::new(backend.clone(), config());
        let (seen, on_update) = recorder();
        let outcome = poller.watch(job(), on_update).finished().await;

        assert!(matches!(
            outcome,
            PollOutcome::Failed(CoreError::Job(JobError::JobFailed { .. }))
        ));
        assert_eq!(seen.lock().len(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.progress_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_wait() {
        let backend = ScriptedAnalysis::new();
        let poller = ProgressPoller::new(
            backend.clone(),
            PollConfig {
                max_wait: Duration::from_millis(5500),
                ..config()
            },
        );
        let (seen, on_update) = recorder();
        let outcome = poller.watch(job(), on_update).finished().await;

        assert!(matches!(
            outcome,
            PollOutcome::Failed(CoreError::Job(JobError::PollTimeout { waited_secs: 5, .. }))
        ));
        let seen = seen.lock();
        assert_eq!(seen.last().map(|u| u.stage), Some(JobStage::Error));
        assert_eq!(
            seen.iter().filter(|u| u.stage == JobStage::Error).count(),
            1
        );
        assert_eq!(backend.progress_calls(), 5);
    }
}
