pub mod api;
pub mod arrow_codec;
pub mod backend;
pub mod dataset;
pub mod debounce;
pub mod history;
pub mod jobs;
pub mod metrics;
pub mod observer;
pub mod pipeline;
pub mod poller;
pub mod suggest;


pub use api::OcssApiClient;
pub use backend::{AnalysisBackend, DatasetBackend, HistoryBackend, SuggestionBackend};
pub use dataset::{DatasetSnapshot, DatasetView, PagedDatasetSource};
pub use debounce::Debouncer;
pub use history::SearchHistoryStore;
pub use jobs::JobClient;
pub use metrics::{ApiMetrics, EndpointMetrics, MetricsCollector, RequestMetrics};
pub use observer::{SubscriptionId, Subscribers};
pub use pipeline::{AnalysisPipeline, PipelineSnapshot, PipelineState};
pub use poller::{PollCanceller, PollConfig, PollHandle, PollOutcome, ProgressPoller};
pub use suggest::SubredditSuggester;
