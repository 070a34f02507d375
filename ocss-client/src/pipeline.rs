use crate::jobs::JobClient;
use crate::poller::{PollCanceller, PollOutcome, ProgressPoller};
use ocss_core::{
    AnalysisJob, CoreError, ErrorExt, JobError, JobRequest, ProgressUpdate, SearchParams,
    SentimentResult, TopicClusterResult,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    Idle,
    TopicSubmitted,
    TopicRunning,
    TopicDone,
    SentimentSubmitted,
    SentimentRunning,
    SentimentDone,
    Error { message: String },
}

impl PipelineState {
    /// A job is outstanding.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            PipelineState::TopicSubmitted
                | PipelineState::TopicRunning
                | PipelineState::SentimentSubmitted
                | PipelineState::SentimentRunning
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::TopicSubmitted => "topic submitted",
            PipelineState::TopicRunning => "topic running",
            PipelineState::TopicDone => "topic done",
            PipelineState::SentimentSubmitted => "sentiment submitted",
            PipelineState::SentimentRunning => "sentiment running",
            PipelineState::SentimentDone => "sentiment done",
            PipelineState::Error { .. } => "error",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Error { message } => write!(f, "error: {}", message),
            other => f.write_str(other.name()),
        }
    }
}

/// What observers of the pipeline see after every transition.
#[derive(Debug, Clone)]
pub struct PipelineSnapshot {
    pub state: PipelineState,
    pub progress: Option<ProgressUpdate>,
    pub topic_result: Option<Arc<TopicClusterResult>>,
    pub sentiment_result: Option<Arc<SentimentResult>>,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Topic,
    Sentiment,
}

impl Phase {
    fn submitted(self) -> PipelineState {
        match self {
            Phase::Topic => PipelineState::TopicSubmitted,
            Phase::Sentiment => PipelineState::SentimentSubmitted,
        }
    }

    fn running(self) -> PipelineState {
        match self {
            Phase::Topic => PipelineState::TopicRunning,
            Phase::Sentiment => PipelineState::SentimentRunning,
        }
    }
}

struct Inner {
    state: PipelineState,
    progress: Option<ProgressUpdate>,
    topic_result: Option<Arc<TopicClusterResult>>,
    sentiment_result: Option<Arc<SentimentResult>>,
    /// Bumped by every reset and every new topic run; work started under an
    /// older epoch is discarded when it completes.
    epoch: u64,
    poll: Option<PollCanceller>,
}

impl Inner {
    fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            state: self.state.clone(),
            progress: self.progress.clone(),
            topic_result: self.topic_result.clone(),
            sentiment_result: self.sentiment_result.clone(),
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    snapshots: watch::Sender<PipelineSnapshot>,
}

impl Shared {
    /// Applies `change` if `epoch` is still current and publishes the result.
    fn update_if_current(&self, epoch: u64, change: impl FnOnce(&mut Inner)) -> bool {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return false;
        }
        change(&mut inner);
        self.snapshots.send_replace(inner.snapshot());
        true
    }
}

/// Two-phase analysis controller: topic clustering, then sentiment
/// analysis over its result.
///
/// At most one job is outstanding at a time. Cheap to clone; clones share
/// state.
#[derive(Clone)]
pub struct AnalysisPipeline {
    jobs: JobClient,
    poller: ProgressPoller,
    shared: Arc<Shared>,
}

impl AnalysisPipeline {
    pub fn new(jobs: JobClient, poller: ProgressPoller) -> Self {
        let inner = Inner {
            state: PipelineState::Idle,
            progress: None,
            topic_result: None,
            sentiment_result: None,
            epoch: 0,
            poll: None,
        };
        let (snapshots, _) = watch::channel(inner.snapshot());
        Self {
            jobs,
            poller,
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                snapshots,
            }),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.shared.inner.lock().state.clone()
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        self.shared.inner.lock().snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineSnapshot> {
        self.shared.snapshots.subscribe()
    }

    pub fn topic_result(&self) -> Option<Arc<TopicClusterResult>> {
        self.shared.inner.lock().topic_result.clone()
    }

    pub fn sentiment_result(&self) -> Option<Arc<SentimentResult>> {
        self.shared.inner.lock().sentiment_result.clone()
    }

    /// Runs topic clustering to completion.
    ///
    /// Rejected with `PipelineBusy` while a job is outstanding. From a
    /// finished or failed pipeline this starts a fresh cycle, discarding
    /// earlier results.
    pub async fn run_topic_clustering(
        &self,
        params: SearchParams,
    ) -> Result<Arc<TopicClusterResult>, CoreError> {
        let epoch = {
            let mut inner = self.shared.inner.lock();
            if inner.state.is_in_flight() {
                return Err(JobError::PipelineBusy {
                    state: inner.state.to_string(),
                }
                .into());
            }
            inner.epoch += 1;
            inner.state = PipelineState::TopicSubmitted;
            inner.progress = None;
            inner.topic_result = None;
            inner.sentiment_result = None;
            inner.poll = None;
            self.shared.snapshots.send_replace(inner.snapshot());
            inner.epoch
        };

        info!(
            "Starting topic clustering for r/{} ({} to {})",
            params.subreddit, params.date_range.start, params.date_range.end
        );
        let request = JobRequest::TopicClustering(params);
        let mut job = self.run_job(epoch, Phase::Topic, &request).await?;

        let result = match self.jobs.fetch_topic_result(&mut job).await {
            Ok(result) => Arc::new(result),
            Err(e) => return Err(self.fail(epoch, Some(&job), e)),
        };

        let stored = Arc::clone(&result);
        let current = self.shared.update_if_current(epoch, move |inner| {
            inner.state = PipelineState::TopicDone;
            inner.topic_result = Some(stored);
            inner.poll = None;
        });
        if !current {
            return Err(cancelled(&job));
        }
        info!(
            "Topic clustering finished with {} topics in {} groups",
            result.topic_count(),
            result.groups.len()
        );
        Ok(result)
    }

    /// Runs sentiment analysis over the stored topic result.
    ///
    /// Fails with `PreconditionFailed`, without touching the network, when
    /// there is no topic result.
    pub async fn run_sentiment_analysis(&self) -> Result<Arc<SentimentResult>, CoreError> {
        let (epoch, topic_result) = {
            let mut inner = self.shared.inner.lock();
            let Some(topic_result) = inner.topic_result.clone() else {
                return Err(JobError::PreconditionFailed {
                    reason: "Run topic clustering before sentiment analysis.".to_string(),
                }
                .into());
            };
            match &inner.state {
                PipelineState::TopicDone | PipelineState::SentimentDone => {}
                state if state.is_in_flight() => {
                    return Err(JobError::PipelineBusy {
                        state: state.to_string(),
                    }
                    .into());
                }
                state => {
                    return Err(JobError::PreconditionFailed {
                        reason: format!("Cannot start sentiment analysis while {}; reset first.", state),
                    }
                    .into());
                }
            }
            inner.state = PipelineState::SentimentSubmitted;
            inner.progress = None;
            inner.sentiment_result = None;
            self.shared.snapshots.send_replace(inner.snapshot());
            (inner.epoch, topic_result)
        };

        info!(
            "Starting sentiment analysis over {} topics",
            topic_result.topic_count()
        );
        let request = JobRequest::SentimentAnalysis(topic_result);
        let mut job = self.run_job(epoch, Phase::Sentiment, &request).await?;

        let result = match self.jobs.fetch_sentiment_result(&mut job).await {
            Ok(result) => Arc::new(result),
            Err(e) => return Err(self.fail(epoch, Some(&job), e)),
        };

        let stored = Arc::clone(&result);
        let current = self.shared.update_if_current(epoch, move |inner| {
            inner.state = PipelineState::SentimentDone;
            inner.sentiment_result = Some(stored);
            inner.poll = None;
        });
        if !current {
            return Err(cancelled(&job));
        }
        info!("Sentiment analysis finished with {} entries", result.0.len());
        Ok(result)
    }

    /// Returns to `Idle` from any state, dropping both results and
    /// abandoning any outstanding job.
    pub fn reset(&self) {
        let poll = {
            let mut inner = self.shared.inner.lock();
            inner.epoch += 1;
            inner.state = PipelineState::Idle;
            inner.progress = None;
            inner.topic_result = None;
            inner.sentiment_result = None;
            self.shared.snapshots.send_replace(inner.snapshot());
            inner.poll.take()
        };
        // Outside the state lock; the poller may be delivering an update
        if let Some(poll) = poll {
            debug!("Cancelling outstanding poll on reset");
            poll.cancel();
        }
        info!("Analysis pipeline reset");
    }

    /// Submits `request` and polls it to `done`.
    async fn run_job(
        &self,
        epoch: u64,
        phase: Phase,
        request: &JobRequest,
    ) -> Result<AnalysisJob, CoreError> {
        let job = match self.jobs.submit(request).await {
            Ok(job) => job,
            Err(e) => return Err(self.fail(epoch, None, e)),
        };
        if self.shared.inner.lock().epoch != epoch {
            // Reset while the submission was in flight
            return Err(cancelled(&job));
        }

        let shared = Arc::clone(&self.shared);
        let handle = self.poller.watch(job.clone(), move |update| {
            shared.update_if_current(epoch, |inner| {
                if inner.state == phase.submitted() {
                    inner.state = phase.running();
                }
                inner.progress = Some(update);
            });
        });

        let registered = {
            let canceller = handle.canceller();
            let mut inner = self.shared.inner.lock();
            if inner.epoch == epoch {
                inner.poll = Some(canceller);
                true
            } else {
                false
            }
        };
        if !registered {
            handle.cancel();
            return Err(cancelled(&job));
        }

        match handle.finished().await {
            PollOutcome::Completed(done) => Ok(done),
            PollOutcome::Failed(e) => Err(self.fail(epoch, Some(&job), e)),
            PollOutcome::Cancelled => Err(cancelled(&job)),
        }
    }

    /// Moves to `Error` if `epoch` is current and hands the error back.
    ///
    /// After a reset the failure of an accepted job reads as its
    /// cancellation; a failed submission keeps its own error.
    fn fail(&self, epoch: u64, job: Option<&AnalysisJob>, error: CoreError) -> CoreError {
        let message = error.user_friendly_message();
        let current = self.shared.update_if_current(epoch, |inner| {
            warn!("Analysis pipeline failed in {}: {}", inner.state, message);
            inner.state = PipelineState::Error { message };
            inner.poll = None;
        });
        match job {
            Some(job) if !current => cancelled(job),
            _ => error,
        }
    }
}

fn cancelled(job: &AnalysisJob) -> CoreError {
    debug!("Discarding {} job {} after reset", job.kind, job.job_id);
    JobError::Cancelled {
        job_id: job.job_id.clone(),
    }
    .into()
}

impl fmt::Debug for AnalysisPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisPipeline")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::PollConfig;
    use crate::tests::{progress, search_params, topic_result_json, ScriptedAnalysis};
    use ocss_core::{ApiError, JobKind};
    use std::time::Duration;

    fn pipeline(backend: Arc<ScriptedAnalysis>) -> AnalysisPipeline {
        AnalysisPipeline::new(
            JobClient::new(backend.clone()),
            ProgressPoller::new(
                backend,
                PollConfig {
                    interval: Duration::from_millis(1000),
                    max_consecutive_failures: 3,
                    max_wait: Duration::from_secs(60),
                },
            ),
        )
    }

    fn sentiment_json() -> serde_json::Value {
        serde_json::json!([{
            "topicNumber": 0,
            "keyword": "rent, lease",
            "sentiment": {
                "negative": {"count": 8, "avg_score": 0.8},
                "neutral": {"count": 2, "avg_score": 0.0},
                "positive": {"count": 5, "avg_score": 0.6}
            }
        }])
    }

    #[tokio::test(start_paused = true)]
    async fn test_topic_clustering_end_to_end() {
        let backend = ScriptedAnalysis::new();
        backend.push_submit(Ok("topic-job".to_string()));
        backend.push_progress(Duration::ZERO, Ok(progress("running", 0.4)));
        backend.push_progress(Duration::ZERO, Ok(progress("done", 1.0)));
        backend.push_result(Ok(topic_result_json(2)));

        let pipeline = pipeline(backend.clone());
        let mut snapshots = pipeline.subscribe();

        let result = pipeline
            .run_topic_clustering(search_params())
            .await
            .unwrap();

        assert_eq!(result.groups.len(), 2);
        assert_eq!(pipeline.state(), PipelineState::TopicDone);
        assert_eq!(pipeline.topic_result().unwrap().groups.len(), 2);
        assert!(snapshots.has_changed().unwrap());
        let latest = snapshots.borrow_and_update().clone();
        assert_eq!(latest.state, PipelineState::TopicDone);
        assert_eq!(latest.progress.map(|p| p.percent), Some(1.0));
        assert_eq!(backend.submitted_kinds(), vec![JobKind::TopicClustering]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_poll_moves_to_running() {
        let backend = ScriptedAnalysis::new();
        backend.push_submit(Ok("topic-job".to_string()));
        backend.push_progress(Duration::ZERO, Ok(progress("running", 0.1)));

        let pipeline = pipeline(backend);
        let runner = pipeline.clone();
        let task = tokio::spawn(async move { runner.run_topic_clustering(search_params()).await });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(pipeline.state(), PipelineState::TopicSubmitted);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(pipeline.state(), PipelineState::TopicRunning);

        pipeline.reset();
        assert!(matches!(
            task.await.unwrap(),
            Err(CoreError::Job(JobError::Cancelled { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sentiment_without_topic_result_is_precondition_error() {
        let backend = ScriptedAnalysis::new();
        let pipeline = pipeline(backend.clone());

        let err = pipeline.run_sentiment_analysis().await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Job(JobError::PreconditionFailed { .. })
        ));
        assert_eq!(backend.submit_calls(), 0);
        assert_eq!(backend.progress_calls(), 0);
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle_then_reset_allows_new_search() {
        let backend = ScriptedAnalysis::new();
        backend.push_submit(Ok("topic-job".to_string()));
        backend.push_progress(Duration::ZERO, Ok(progress("done", 1.0)));
        backend.push_result(Ok(topic_result_json(1)));
        backend.push_submit(Ok("sentiment-job".to_string()));
        backend.push_progress(Duration::ZERO, Ok(progress("running", 0.5)));
        backend.push_progress(Duration::ZERO, Ok(progress("done", 1.0)));
        backend.push_result(Ok(serde_json::json!({ "sentiment": sentiment_json() })));

        let pipeline = pipeline(backend.clone());
        pipeline.run_topic_clustering(search_params()).await.unwrap();
        let sentiment = pipeline.run_sentiment_analysis().await.unwrap();

        assert_eq!(sentiment.0.len(), 1);
        assert_eq!(pipeline.state(), PipelineState::SentimentDone);
        assert_eq!(
            backend.submitted_kinds(),
            vec![JobKind::TopicClustering, JobKind::SentimentAnalysis]
        );

        pipeline.reset();
        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.state, PipelineState::Idle);
        assert!(snapshot.topic_result.is_none());
        assert!(snapshot.sentiment_result.is_none());

        backend.push_submit(Ok("topic-job-2".to_string()));
        backend.push_progress(Duration::ZERO, Ok(progress("done", 1.0)));
        backend.push_result(Ok(topic_result_json(3)));
        let again = pipeline.run_topic_clustering(search_params()).await.unwrap();
        assert_eq!(again.groups.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_second_run_while_in_flight() {
        let backend = ScriptedAnalysis::new();
        backend.push_submit(Ok("topic-job".to_string()));
        backend.push_progress(Duration::ZERO, Ok(progress("running", 0.2)));
        backend.push_progress(Duration::ZERO, Ok(progress("done", 1.0)));
        backend.push_result(Ok(topic_result_json(1)));

        let pipeline = pipeline(backend.clone());
        let runner = pipeline.clone();
        let first = tokio::spawn(async move { runner.run_topic_clustering(search_params()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = pipeline.run_topic_clustering(search_params()).await;
        assert!(matches!(
            second,
            Err(CoreError::Job(JobError::PipelineBusy { .. }))
        ));
        let sentiment = pipeline.run_sentiment_analysis().await;
        assert!(matches!(
            sentiment,
            Err(CoreError::Job(JobError::PreconditionFailed { .. }))
        ));

        assert!(first.await.unwrap().is_ok());
        assert_eq!(backend.submit_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_error_stage_moves_to_error() {
        let backend = ScriptedAnalysis::new();
        backend.push_submit(Ok("topic-job".to_string()));
        backend.push_progress(Duration::ZERO, Ok(progress("running", 0.3)));
        backend.push_progress(
            Duration::ZERO,
            Ok(ocss_core::ProgressResponse {
                stage: Some("error".to_string()),
                message: Some("Not enough posts to cluster".to_string()),
                percent: Some(0.3),
            }),
        );

        let pipeline = pipeline(backend.clone());
        let err = pipeline.run_topic_clustering(search_params()).await.unwrap_err();
        assert!(matches!(err, CoreError::Job(JobError::JobFailed { .. })));
        assert_eq!(
            pipeline.state(),
            PipelineState::Error {
                message: "Not enough posts to cluster".to_string()
            }
        );
        assert_eq!(backend.result_calls(), 0);

        pipeline.reset();
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_failure_does_not_poll() {
        let backend = ScriptedAnalysis::new();
        backend.push_submit(Err(ApiError::Status {
            status_code: 500,
            message: "Request failed with status 500".to_string(),
        }
        .into()));

        let pipeline = pipeline(backend.clone());
        let err = pipeline.run_topic_clustering(search_params()).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Job(JobError::SubmissionFailed { .. })
        ));
        assert!(matches!(pipeline.state(), PipelineState::Error { .. }));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.progress_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_without_result_is_error_state() {
        let backend = ScriptedAnalysis::new();
        backend.push_submit(Ok("topic-job".to_string()));
        backend.push_progress(Duration::ZERO, Ok(progress("done", 1.0)));
        backend.push_result(Err(ApiError::InvalidResponse {
            endpoint: "/api/get_result".to_string(),
            details: "no result for job topic-job".to_string(),
        }
        .into()));

        let pipeline = pipeline(backend);
        let err = pipeline.run_topic_clustering(search_params()).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Job(JobError::ResultUnavailable { .. })
        ));
        assert!(matches!(pipeline.state(), PipelineState::Error { .. }));
        assert!(pipeline.topic_result().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_reset_reports_cancelled_job() {
        let backend = ScriptedAnalysis::new();
        backend.push_submit(Ok("topic-job".to_string()));
        backend.push_progress(Duration::ZERO, Ok(progress("done", 1.0)));
        backend.push_delayed_result(
            Duration::from_millis(500),
            Err(ApiError::Status {
                status_code: 500,
                message: "Request failed with status 500".to_string(),
            }
            .into()),
        );

        let pipeline = pipeline(backend.clone());
        let runner = pipeline.clone();
        let task = tokio::spawn(async move { runner.run_topic_clustering(search_params()).await });

        // Result fetch is in flight between 1.0s and 1.5s
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(backend.result_calls(), 1);
        pipeline.reset();

        let err = task.await.unwrap().unwrap_err();
        match &err {
            CoreError::Job(JobError::Cancelled { job_id }) => assert_eq!(job_id, "topic-job"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("topic-job"));
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }
}
