use crate::backend::AnalysisBackend;
use ocss_core::{
    AnalysisJob, CoreError, ErrorExt, JobError, JobRequest, JobStage, SentimentResult,
    TopicClusterResult,
};
use std::sync::Arc;
use tracing::{error, info};

/// Submits jobs and fetches their results. Never retries.
#[derive(Clone)]
pub struct JobClient {
    backend: Arc<dyn AnalysisBackend>,
}

impl JobClient {
    pub fn new(backend: Arc<dyn AnalysisBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> Arc<dyn AnalysisBackend> {
        Arc::clone(&self.backend)
    }

    pub async fn submit(&self, request: &JobRequest) -> Result<AnalysisJob, CoreError> {
        let kind = request.kind();
        match self.backend.submit_job(request).await {
            Ok(job_id) if !job_id.trim().is_empty() => {
                info!("Submitted {} job {}", kind, job_id);
                Ok(AnalysisJob::submitted(job_id, kind))
            }
            Ok(_) => Err(JobError::SubmissionFailed {
                kind,
                reason: "backend returned an empty job id".to_string(),
            }
            .into()),
            Err(e) => {
                error!("Failed to submit {} job: {}", kind, e);
                Err(JobError::SubmissionFailed {
                    kind,
                    reason: e.user_friendly_message(),
                }
                .into())
            }
        }
    }

    /// Fetches the raw result of a finished job. Allowed once per job.
    pub async fn fetch_result(&self, job: &mut AnalysisJob) -> Result<serde_json::Value, CoreError> {
        if job.stage != JobStage::Done {
            return Err(JobError::ResultUnavailable {
                job_id: job.job_id.clone(),
                reason: format!("job is {}, not done", job.stage),
            }
            .into());
        }
        if job.result_consumed() {
            return Err(JobError::ResultUnavailable {
                job_id: job.job_id.clone(),
                reason: "result was already fetched".to_string(),
            }
            .into());
        }

        // Consumed even on failure; a done job without a result is a backend bug
        job.mark_result_consumed();
        self.backend.job_result(&job.job_id).await.map_err(|e| {
            error!("Job {} reported done but its result is unavailable: {}", job.job_id, e);
            JobError::ResultUnavailable {
                job_id: job.job_id.clone(),
                reason: e.user_friendly_message(),
            }
            .into()
        })
    }

    pub async fn fetch_topic_result(
        &self,
        job: &mut AnalysisJob,
    ) -> Result<TopicClusterResult, CoreError> {
        let payload = self.fetch_result(job).await?;
        serde_json::from_value(payload).map_err(|e| undecodable(job, e))
    }

    pub async fn fetch_sentiment_result(
        &self,
        job: &mut AnalysisJob,
    ) -> Result<SentimentResult, CoreError> {
        let payload = self.fetch_result(job).await?;
        SentimentResult::from_payload(payload).map_err(|e| undecodable(job, e))
    }
}

fn undecodable(job: &AnalysisJob, e: serde_json::Error) -> CoreError {
    JobError::ResultUnavailable {
        job_id: job.job_id.clone(),
        reason: format!("result could not be decoded: {}", e),
    }
    .into()
}
