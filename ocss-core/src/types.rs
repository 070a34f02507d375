use crate::error::CoreError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};

/// Datasets with this many matching rows or fewer are flagged as possibly
/// too small for meaningful topic clustering.
pub const INSUFFICIENT_DATA_THRESHOLD: u64 = 3000;

pub fn is_possibly_insufficient(filtered_rows: u64) -> bool {
    filtered_rows <= INSUFFICIENT_DATA_THRESHOLD
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    TopicClustering,
    SentimentAnalysis,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::TopicClustering => "topic_clustering",
            JobKind::SentimentAnalysis => "sentiment_analysis",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            JobKind::TopicClustering => "topic clustering",
            JobKind::SentimentAnalysis => "sentiment analysis",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Submitted,
    Running,
    Done,
    Error,
}

impl JobStage {
    /// Maps the backend's free-form stage string. Anything unrecognised is
    /// treated as still running.
    pub fn from_wire(stage: &str) -> Self {
        match stage.trim().to_ascii_lowercase().as_str() {
            "done" | "complete" | "completed" => JobStage::Done,
            "error" | "failed" | "failure" => JobStage::Error,
            "submitted" | "queued" | "pending" => JobStage::Submitted,
            _ => JobStage::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStage::Done | JobStage::Error)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStage::Submitted => 0,
            JobStage::Running => 1,
            JobStage::Done => 2,
            JobStage::Error => 3,
        }
    }

    /// Stages only move forward; `Error` is reachable from any non-terminal stage.
    pub fn can_advance_to(&self, next: JobStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == JobStage::Error || next.rank() >= self.rank()
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStage::Submitted => "submitted",
            JobStage::Running => "running",
            JobStage::Done => "done",
            JobStage::Error => "error",
        };
        f.write_str(s)
    }
}

/// Raw body of `GET /api/progress/{job_id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressResponse {
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub percent: Option<f64>,
}

impl ProgressResponse {
    pub fn stage(&self) -> JobStage {
        self.stage
            .as_deref()
            .map(JobStage::from_wire)
            .unwrap_or(JobStage::Running)
    }
}

/// What progress observers receive.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub stage: JobStage,
    pub percent: f64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisJob {
    pub job_id: String,
    pub kind: JobKind,
    pub stage: JobStage,
    pub progress_percent: f64,
    pub progress_message: String,
    result_consumed: bool,
}

impl AnalysisJob {
    pub fn submitted(job_id: impl Into<String>, kind: JobKind) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            stage: JobStage::Submitted,
            progress_percent: 0.0,
            progress_message: String::new(),
            result_consumed: false,
        }
    }

    /// Folds a backend progress response into the job and returns the
    /// normalized update, or `None` if the job is already terminal.
    ///
    /// Stage never moves backwards and the percentage never decreases; a
    /// regressing value from the backend is held at the highest seen.
    pub fn observe(&mut self, response: &ProgressResponse) -> Option<ProgressUpdate> {
        if self.stage.is_terminal() {
            return None;
        }

        let reported = response.stage();
        if self.stage.can_advance_to(reported) {
            self.stage = reported;
        }

        let percent = response.percent.unwrap_or(0.0);
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if self.stage == JobStage::Done {
            self.progress_percent = 1.0;
        } else if percent > self.progress_percent {
            self.progress_percent = percent;
        }

        if let Some(message) = &response.message {
            self.progress_message = message.clone();
        }

        Some(self.current_update())
    }

    /// Marks the job as failed locally, e.g. after the poller gives up.
    pub fn fail(&mut self, message: impl Into<String>) -> Option<ProgressUpdate> {
        if self.stage.is_terminal() {
            return None;
        }
        self.stage = JobStage::Error;
        self.progress_message = message.into();
        Some(self.current_update())
    }

    pub fn current_update(&self) -> ProgressUpdate {
        ProgressUpdate {
            stage: self.stage,
            percent: self.progress_percent,
            message: self.progress_message.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn result_consumed(&self) -> bool {
        self.result_consumed
    }

    pub fn mark_result_consumed(&mut self) {
        self.result_consumed = true;
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TopicClusterResult {
    pub groups: Vec<TopicGroup>,
    /// Fields the clustering backend attaches for the sentiment stage
    /// (`meta`, `allTopics`, ...). Carried through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TopicClusterResult {
    pub fn topic_count(&self) -> usize {
        self.groups.iter().map(|g| g.topics.len()).sum()
    }

    /// Topic labels ordered by post count, largest first.
    pub fn top_topics(&self, n: usize) -> Vec<&Topic> {
        let mut topics: Vec<&Topic> = self.groups.iter().flat_map(|g| g.topics.iter()).collect();
        topics.sort_by(|a, b| {
            b.post_count
                .cmp(&a.post_count)
                .then_with(|| a.topic_number.cmp(&b.topic_number))
        });
        topics.truncate(n);
        topics
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicGroup {
    pub group: i64,
    #[serde(default)]
    pub llm_label: String,
    #[serde(default)]
    pub topics: Vec<Topic>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub topic_number: i64,
    #[serde(default)]
    pub topic_label: String,
    #[serde(default)]
    pub ctfidf_keywords: String,
    #[serde(default)]
    pub post_count: u64,
    #[serde(default)]
    pub sample_posts: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceOption {
    Submissions,
    Comments,
    Other(String),
}

impl SourceOption {
    pub fn as_wire(&self) -> &str {
        match self {
            SourceOption::Submissions => "reddit_submissions",
            SourceOption::Comments => "reddit_comments",
            SourceOption::Other(raw) => raw,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            SourceOption::Submissions => "Submissions",
            SourceOption::Comments => "Comments",
            SourceOption::Other(raw) => raw,
        }
    }

    fn from_wire(token: &str) -> Self {
        match token {
            "reddit_submissions" => SourceOption::Submissions,
            "reddit_comments" => SourceOption::Comments,
            other => SourceOption::Other(other.to_string()),
        }
    }
}

/// Comma-joined set of sources a search covers, e.g.
/// `reddit_submissions,reddit_comments`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceOptions(Vec<SourceOption>);

impl SourceOptions {
    pub fn new(options: impl IntoIterator<Item = SourceOption>) -> Self {
        let mut out: Vec<SourceOption> = Vec::new();
        for option in options {
            if !out.contains(&option) {
                out.push(option);
            }
        }
        Self(out)
    }

    pub fn submissions() -> Self {
        Self(vec![SourceOption::Submissions])
    }

    pub fn from_flags(submissions: bool, comments: bool) -> Self {
        let mut options = Vec::with_capacity(2);
        if submissions {
            options.push(SourceOption::Submissions);
        }
        if comments {
            options.push(SourceOption::Comments);
        }
        Self(options)
    }

    pub fn includes_submissions(&self) -> bool {
        self.0.contains(&SourceOption::Submissions)
    }

    pub fn includes_comments(&self) -> bool {
        self.0.contains(&SourceOption::Comments)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceOption> {
        self.0.iter()
    }

    pub fn to_wire(&self) -> String {
        self.0
            .iter()
            .map(SourceOption::as_wire)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Display form, e.g. `Submissions, Comments`.
    pub fn labels(&self) -> String {
        self.0
            .iter()
            .map(SourceOption::label)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromStr for SourceOptions {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(
            s.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(SourceOption::from_wire),
        ))
    }
}

impl fmt::Display for SourceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl Serialize for SourceOptions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for SourceOptions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        Ok(raw.parse().unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(rename = "startDate", with = "flexible_date")]
    pub start: NaiveDate,
    #[serde(rename = "endDate", with = "flexible_date")]
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, CoreError> {
        if start > end {
            return Err(CoreError::InvalidInput {
                message: format!("start date {} is after end date {}", start, end),
            });
        }
        Ok(Self { start, end })
    }
}

/// Which collection a search addresses: subreddit, sources and date range.
///
/// Serializes to the `{ subreddit, option, startDate, endDate }` body that
/// `/api/run_topic` and `/api/add_search` accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    pub subreddit: String,
    #[serde(rename = "option", default)]
    pub options: SourceOptions,
    #[serde(flatten)]
    pub date_range: DateRange,
}

impl SearchParams {
    pub fn new(
        subreddit: &str,
        options: SourceOptions,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Self, CoreError> {
        let subreddit = normalize_subreddit(subreddit);
        if subreddit.is_empty() {
            return Err(CoreError::InvalidInput {
                message: "subreddit must not be empty".to_string(),
            });
        }
        if options.is_empty() {
            return Err(CoreError::InvalidInput {
                message: "select at least one of submissions or comments".to_string(),
            });
        }
        Ok(Self {
            subreddit,
            options,
            date_range: DateRange::new(start, end)?,
        })
    }
}

/// Strips whitespace and a leading `r/`.
pub fn normalize_subreddit(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("r/")
        .or_else(|| trimmed.strip_prefix("/r/"))
        .unwrap_or(trimmed)
        .to_string()
}

/// A job submission. The variant decides the endpoint and body.
#[derive(Debug, Clone)]
pub enum JobRequest {
    TopicClustering(SearchParams),
    SentimentAnalysis(Arc<TopicClusterResult>),
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::TopicClustering(_) => JobKind::TopicClustering,
            JobRequest::SentimentAnalysis(_) => JobKind::SentimentAnalysis,
        }
    }

    pub fn body(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            JobRequest::TopicClustering(params) => serde_json::to_value(params),
            JobRequest::SentimentAnalysis(topic_result) => Ok(serde_json::json!({
                "topic_result": serde_json::to_value(topic_result.as_ref())?,
            })),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRecord {
    pub search_id: i64,
    pub subreddit: String,
    #[serde(rename = "option", default)]
    pub options: SourceOptions,
    #[serde(flatten)]
    pub date_range: DateRange,
    #[serde(with = "flexible_datetime")]
    pub created_utc: NaiveDateTime,
}

impl SearchRecord {
    /// Parameters to re-run this search.
    pub fn to_search_params(&self) -> SearchParams {
        SearchParams {
            subreddit: normalize_subreddit(&self.subreddit),
            options: self.options.clone(),
            date_range: self.date_range,
        }
    }
}

/// Body of `POST /api/add_search`.
#[derive(Debug, Clone, Serialize)]
pub struct NewSearchRecord<'a> {
    pub email: &'a str,
    #[serde(flatten)]
    pub params: &'a SearchParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    Excel,
    Csv,
    Json,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Excel => "excel",
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Excel => "xlsx",
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "excel" | "xlsx" => Ok(ExportFormat::Excel),
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(CoreError::InvalidInput {
                message: format!("unknown export format '{}'", other),
            }),
        }
    }
}

/// One page request against the remote dataset.
///
/// `selector` picks the collection; `filter_text` narrows it. `draw` is
/// echoed by the server so late responses can be told apart.
#[derive(Debug, Clone, PartialEq)]
pub struct PagedQuery {
    pub offset: u64,
    pub limit: u64,
    pub draw: u64,
    pub filter_text: String,
    pub selector: SearchParams,
}

impl PagedQuery {
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = filter_query_pairs(&self.selector, &self.filter_text);
        pairs.push(("start", self.offset.to_string()));
        pairs.push(("length", self.limit.to_string()));
        pairs.push(("draw", self.draw.to_string()));
        pairs
    }
}

/// Query parameters shared by the dataset and export endpoints.
pub fn filter_query_pairs(selector: &SearchParams, filter_text: &str) -> Vec<(&'static str, String)> {
    vec![
        ("subreddit", selector.subreddit.clone()),
        ("option", selector.options.to_wire()),
        ("startDate", selector.date_range.start.to_string()),
        ("endDate", selector.date_range.end.to_string()),
        ("search_value", filter_text.to_string()),
    ]
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DatasetRow {
    pub id: String,
    pub subreddit: String,
    pub title: String,
    pub body: String,
    pub created_utc: String,
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DatasetPage {
    pub draw: u64,
    pub total_rows: u64,
    pub filtered_rows: u64,
    pub rows: Vec<DatasetRow>,
}

impl DatasetPage {
    pub fn possibly_insufficient(&self) -> bool {
        is_possibly_insufficient(self.filtered_rows)
    }
}

/// A result another user published, as listed by `GET /api/get_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedResult {
    pub id: i64,
    pub email: String,
    pub subreddit: String,
    #[serde(flatten)]
    pub date_range: DateRange,
    #[serde(with = "flexible_datetime")]
    pub created_utc: NaiveDateTime,
    #[serde(default)]
    pub topic1: Option<String>,
    #[serde(default)]
    pub topic2: Option<String>,
    #[serde(default)]
    pub topic3: Option<String>,
}

impl PublishedResult {
    pub fn top_topics(&self) -> Vec<&str> {
        [&self.topic1, &self.topic2, &self.topic3]
            .into_iter()
            .filter_map(|t| t.as_deref())
            .filter(|t| !t.is_empty())
            .collect()
    }

    pub fn is_owned_by(&self, email: &str) -> bool {
        self.email == email
    }
}

/// Body of `POST /api/save_result`.
#[derive(Debug, Clone, Serialize)]
pub struct PublishRequest<'a> {
    pub email: &'a str,
    #[serde(flatten)]
    pub params: &'a SearchParams,
    pub groups: &'a [TopicGroup],
    pub topic1: Option<&'a str>,
    pub topic2: Option<&'a str>,
    pub topic3: Option<&'a str>,
}

impl<'a> PublishRequest<'a> {
    pub fn new(email: &'a str, params: &'a SearchParams, topics: &'a TopicClusterResult) -> Self {
        let top = topics.top_topics(3);
        let label = |i: usize| top.get(i).map(|t| t.topic_label.as_str());
        Self {
            email,
            params,
            groups: &topics.groups,
            topic1: label(0),
            topic2: label(1),
            topic3: label(2),
        }
    }
}

pub fn parse_flexible_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_flexible_datetime(raw).map(|dt| dt.date()))
}

pub fn parse_flexible_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok())
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.naive_utc())
        })
        .or_else(|| {
            chrono::DateTime::parse_from_rfc2822(raw)
                .ok()
                .map(|dt| dt.naive_utc())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Accepts ISO, RFC 3339 and RFC 2822 dates; writes `YYYY-MM-DD`.
pub mod flexible_date {
    use chrono::NaiveDate;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.format("%Y-%m-%d").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_flexible_date(&raw)
            .ok_or_else(|| de::Error::custom(format!("unrecognised date '{}'", raw)))
    }
}

/// Accepts `%Y-%m-%d %H:%M:%S`, RFC 3339 and RFC 2822; writes the first.
pub mod flexible_datetime {
    use chrono::NaiveDateTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &NaiveDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format("%Y-%m-%d %H:%M:%S").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_flexible_datetime(&raw)
            .ok_or_else(|| de::Error::custom(format!("unrecognised timestamp '{}'", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_insufficient_data_boundary() {
        assert!(is_possibly_insufficient(0));
        assert!(is_possibly_insufficient(3000));
        assert!(!is_possibly_insufficient(3001));
    }

    #[test]
    fn test_stage_only_moves_forward() {
        let mut job = AnalysisJob::submitted("job-1", JobKind::TopicClustering);

        let running = ProgressResponse {
            stage: Some("running".into()),
            message: Some("embedding".into()),
            percent: Some(0.5),
        };
        let update = job.observe(&running).unwrap();
        assert_eq!(update.stage, JobStage::Running);
        assert_eq!(update.percent, 0.5);

        // A stale "submitted" with a lower percent neither rewinds the stage nor the bar
        let stale = ProgressResponse {
            stage: Some("submitted".into()),
            message: None,
            percent: Some(0.2),
        };
        let update = job.observe(&stale).unwrap();
        assert_eq!(update.stage, JobStage::Running);
        assert_eq!(update.percent, 0.5);
        assert_eq!(update.message, "embedding");

        let done = ProgressResponse {
            stage: Some("done".into()),
            message: None,
            percent: None,
        };
        let update = job.observe(&done).unwrap();
        assert_eq!(update.stage, JobStage::Done);
        assert_eq!(update.percent, 1.0);
        assert!(job.observe(&running).is_none());
    }

    #[test]
    fn test_error_reachable_from_any_live_stage() {
        assert!(JobStage::Submitted.can_advance_to(JobStage::Error));
        assert!(JobStage::Running.can_advance_to(JobStage::Error));
        assert!(!JobStage::Done.can_advance_to(JobStage::Error));
        assert!(!JobStage::Running.can_advance_to(JobStage::Submitted));

        let mut job = AnalysisJob::submitted("job-2", JobKind::SentimentAnalysis);
        let update = job.fail("consumer crashed").unwrap();
        assert_eq!(update.stage, JobStage::Error);
        assert!(job.fail("again").is_none());
    }

    #[test]
    fn test_out_of_range_percent_is_clamped() {
        let mut job = AnalysisJob::submitted("job-3", JobKind::TopicClustering);
        let update = job
            .observe(&ProgressResponse {
                stage: None,
                message: None,
                percent: Some(7.0),
            })
            .unwrap();
        assert_eq!(update.stage, JobStage::Running);
        assert_eq!(update.percent, 1.0);
    }

    #[test]
    fn test_source_options_round_trip_wire_form() {
        let options: SourceOptions = "reddit_submissions, reddit_comments".parse().unwrap();
        assert!(options.includes_submissions());
        assert!(options.includes_comments());
        assert_eq!(options.to_wire(), "reddit_submissions,reddit_comments");
        assert_eq!(options.labels(), "Submissions, Comments");

        let odd: SourceOptions = "reddit_submissions,reddit_submissions,legacy".parse().unwrap();
        assert_eq!(odd.to_wire(), "reddit_submissions,legacy");
        assert_eq!(odd.labels(), "Submissions, legacy");
    }

    #[test]
    fn test_search_params_wire_shape() {
        let params = SearchParams::new(
            "r/test",
            SourceOptions::submissions(),
            date(2024, 12, 1),
            date(2024, 12, 31),
        )
        .unwrap();
        assert_eq!(params.subreddit, "test");

        let body = serde_json::to_value(&params).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "subreddit": "test",
                "option": "reddit_submissions",
                "startDate": "2024-12-01",
                "endDate": "2024-12-31",
            })
        );
    }

    #[test]
    fn test_search_params_validation() {
        let start = date(2024, 12, 31);
        let end = date(2024, 12, 1);
        assert!(SearchParams::new("test", SourceOptions::submissions(), start, end).is_err());
        assert!(SearchParams::new("  ", SourceOptions::submissions(), end, start).is_err());
        assert!(SearchParams::new("test", SourceOptions::default(), end, start).is_err());
    }

    #[test]
    fn test_search_record_accepts_backend_date_renderings() {
        let raw = r#"{
            "search_id": 7,
            "subreddit": "r/AskHistorians",
            "startDate": "Sun, 01 Dec 2024 00:00:00 GMT",
            "endDate": "2024-12-31",
            "option": "reddit_comments",
            "created_utc": "2025-01-02 03:04:05"
        }"#;
        let record: SearchRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.search_id, 7);
        assert_eq!(record.date_range.start, date(2024, 12, 1));
        assert_eq!(record.date_range.end, date(2024, 12, 31));
        assert!(record.options.includes_comments());

        let params = record.to_search_params();
        assert_eq!(params.subreddit, "AskHistorians");
        assert!(!params.options.includes_submissions());
    }

    #[test]
    fn test_topic_result_keeps_backend_extras() {
        let raw = serde_json::json!({
            "groups": [{
                "group": 0,
                "llmLabel": "Housing",
                "topics": [{
                    "topicNumber": 3,
                    "topicLabel": "Rent",
                    "ctfidfKeywords": "rent, lease, landlord",
                    "postCount": 120,
                    "samplePosts": "My landlord..."
                }]
            }],
            "meta": {"subreddit": "test"},
            "allTopics": [3, 3, -1]
        });
        let result: TopicClusterResult = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(result.groups[0].llm_label, "Housing");
        assert_eq!(result.groups[0].topics[0].post_count, 120);
        assert!(result.extra.contains_key("allTopics"));

        let body = JobRequest::SentimentAnalysis(Arc::new(result)).body().unwrap();
        assert_eq!(body["topic_result"], raw);
    }

    #[test]
    fn test_paged_query_pairs() {
        let selector = SearchParams::new(
            "test",
            SourceOptions::from_flags(true, true),
            date(2024, 12, 1),
            date(2024, 12, 31),
        )
        .unwrap();
        let query = PagedQuery {
            offset: 20,
            limit: 10,
            draw: 3,
            filter_text: "rent".to_string(),
            selector,
        };
        let pairs = query.to_query_pairs();
        assert!(pairs.contains(&("option", "reddit_submissions,reddit_comments".to_string())));
        assert!(pairs.contains(&("search_value", "rent".to_string())));
        assert!(pairs.contains(&("start", "20".to_string())));
        assert!(pairs.contains(&("length", "10".to_string())));
        assert!(pairs.contains(&("draw", "3".to_string())));
    }

    #[test]
    fn test_publish_request_picks_top_topics() {
        let topics = TopicClusterResult {
            groups: vec![TopicGroup {
                group: 1,
                llm_label: "Mixed".into(),
                topics: vec![
                    Topic {
                        topic_number: 1,
                        topic_label: "small".into(),
                        ctfidf_keywords: String::new(),
                        post_count: 5,
                        sample_posts: String::new(),
                    },
                    Topic {
                        topic_number: 2,
                        topic_label: "large".into(),
                        ctfidf_keywords: String::new(),
                        post_count: 50,
                        sample_posts: String::new(),
                    },
                ],
            }],
            extra: Default::default(),
        };
        let params = SearchParams::new(
            "test",
            SourceOptions::submissions(),
            date(2024, 1, 1),
            date(2024, 1, 2),
        )
        .unwrap();
        let request = PublishRequest::new("a@b.c", &params, &topics);
        assert_eq!(request.topic1, Some("large"));
        assert_eq!(request.topic2, Some("small"));
        assert_eq!(request.topic3, None);
    }

    #[test]
    fn test_export_format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("xlsx".parse::<ExportFormat>().unwrap().as_str(), "excel");
        assert!("pdf".parse::<ExportFormat>().is_err());
    }
}
