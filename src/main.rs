//! `ocss` command line front end.
//!
//! Drives the analysis client against a running OCSS backend: run topic
//! clustering (and optionally sentiment analysis) for a subreddit and date
//! range, page through the collected posts, manage search history, export
//! data and browse published results.

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use ocss_client::{
    AnalysisBackend, AnalysisPipeline, JobClient, OcssApiClient, PagedDatasetSource,
    PollConfig, ProgressPoller, SearchHistoryStore, SubredditSuggester,
};
use ocss_core::{
    AppConfig, CoreError, ErrorExt, ErrorReporter, ExportFormat, PublishRequest, SearchParams,
    SourceOptions, TopicClusterResult,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "ocss=info,ocss_client=info,ocss_core=info";

#[derive(Parser)]
#[command(name = "ocss", version, about = "Topic clustering and sentiment analysis for Reddit communities")]
struct Cli {
    /// Configuration file (TOML). Built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend base URL, overriding the config file and OCSS_BACKEND_URL.
    #[arg(long, global = true)]
    backend: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run topic clustering, optionally followed by sentiment analysis.
    Analyze {
        #[command(flatten)]
        search: SearchArgs,

        /// Run sentiment analysis on the clustering result.
        #[arg(long)]
        sentiment: bool,

        /// Record the search in this user's history.
        #[arg(long)]
        email: Option<String>,

        /// Publish the clustering result (requires --email).
        #[arg(long, requires = "email")]
        publish: bool,
    },

    /// Show one page of the posts a search selects.
    Browse {
        #[command(flatten)]
        search: SearchArgs,

        /// Only rows matching this text.
        #[arg(long, default_value = "")]
        filter: String,

        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Fetch every matching row instead of a single page.
        #[arg(long)]
        all: bool,
    },

    /// Manage a user's search history.
    History {
        #[arg(long)]
        email: String,

        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Download the posts a search selects.
    Export {
        #[command(flatten)]
        search: SearchArgs,

        /// excel, csv or json.
        #[arg(long, default_value = "csv")]
        format: ExportFormat,

        #[arg(long, default_value = "")]
        filter: String,

        /// Output file. Defaults to `<subreddit>.<extension>`.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Browse results other users published.
    Results {
        #[command(subcommand)]
        action: ResultsAction,
    },

    /// Complete a subreddit name.
    Suggest { prefix: String },
}

#[derive(Subcommand)]
enum HistoryAction {
    List,
    Remove { search_id: i64 },
    Clear,
}

#[derive(Subcommand)]
enum ResultsAction {
    List {
        /// Mark results owned by this user.
        #[arg(long)]
        email: Option<String>,
    },
    Topics { result_id: i64 },
    Remove {
        result_id: i64,

        /// Only the owner may remove a result.
        #[arg(long)]
        email: String,
    },
}

#[derive(Args)]
struct SearchArgs {
    /// Subreddit name, with or without a leading `r/`.
    #[arg(long, short)]
    subreddit: String,

    /// First day, YYYY-MM-DD.
    #[arg(long)]
    start: NaiveDate,

    /// Last day, YYYY-MM-DD.
    #[arg(long)]
    end: NaiveDate,

    /// Include comments.
    #[arg(long)]
    comments: bool,

    /// Leave out submissions.
    #[arg(long)]
    no_submissions: bool,
}

impl SearchArgs {
    fn params(&self) -> Result<SearchParams, CoreError> {
        SearchParams::new(
            &self.subreddit,
            SourceOptions::from_flags(!self.no_submissions, self.comments),
            self.start,
            self.end,
        )
    }
}

#[tokio::main]
async fn main() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        ErrorReporter::new().report_error(&e);
        eprintln!("error: {}", e.user_friendly_message());
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig, CoreError> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(url) = &cli.backend {
        config.backend.base_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<(), CoreError> {
    let config = load_config(&cli)?;
    let client = OcssApiClient::new(&config.backend)?;
    info!("Using backend {}", client.base_url());

    let result = match cli.command {
        Commands::Analyze {
            search,
            sentiment,
            email,
            publish,
        } => analyze(&client, &config, search.params()?, sentiment, email, publish).await,
        Commands::Browse {
            search,
            filter,
            offset,
            all,
        } => browse(&client, &config, search.params()?, &filter, offset, all).await,
        Commands::History { email, action } => history(&client, &email, action).await,
        Commands::Export {
            search,
            format,
            filter,
            output,
        } => export(&client, search.params()?, format, &filter, output).await,
        Commands::Results { action } => results(&client, action).await,
        Commands::Suggest { prefix } => {
            let suggester = SubredditSuggester::new(
                Arc::new(client.clone()),
                config.dataset.suggestion_debounce(),
            );
            for name in suggester.suggest(&prefix).await.unwrap_or_default() {
                println!("r/{}", name);
            }
            Ok(())
        }
    };

    let metrics = client.get_metrics().await;
    debug!(
        "{} backend requests ({} failed)",
        metrics.total_requests, metrics.failed_requests
    );
    result
}

async fn analyze(
    client: &OcssApiClient,
    config: &AppConfig,
    params: SearchParams,
    with_sentiment: bool,
    email: Option<String>,
    publish: bool,
) -> Result<(), CoreError> {
    let backend: Arc<dyn AnalysisBackend> = Arc::new(client.clone());
    let pipeline = AnalysisPipeline::new(
        JobClient::new(Arc::clone(&backend)),
        ProgressPoller::new(backend, PollConfig::from(&config.polling)),
    );

    let mut snapshots = pipeline.subscribe();
    let progress_printer = tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            if let Some(update) = snapshot.progress {
                println!(
                    "[{}] {:>3.0}% {}",
                    snapshot.state,
                    update.percent * 100.0,
                    update.message
                );
            }
        }
    });

    println!(
        "Analyzing r/{} ({}) from {} to {}",
        params.subreddit,
        params.options.labels(),
        params.date_range.start,
        params.date_range.end
    );

    let outcome = tokio::select! {
        outcome = run_analysis(&pipeline, params.clone(), with_sentiment) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, abandoning the running job");
            pipeline.reset();
            Ok(None)
        }
    };
    progress_printer.abort();

    let Some(topics) = outcome? else {
        return Ok(());
    };

    if let Some(email) = email {
        let store = SearchHistoryStore::new(Arc::new(client.clone()), email.as_str());
        if let Err(e) = store.add(&params).await {
            e.log_warn();
        }
        if publish {
            client
                .save_result(&PublishRequest::new(&email, &params, &topics))
                .await?;
            println!("Published result for r/{}", params.subreddit);
        }
    }
    Ok(())
}

async fn run_analysis(
    pipeline: &AnalysisPipeline,
    params: SearchParams,
    with_sentiment: bool,
) -> Result<Option<Arc<TopicClusterResult>>, CoreError> {
    let topics = pipeline.run_topic_clustering(params).await?;
    print_topics(&topics);

    if with_sentiment {
        let sentiment = pipeline.run_sentiment_analysis().await?;
        println!("\nSentiment by topic:");
        for row in sentiment.chart_rows() {
            println!(
                "  #{:<4} {:<24} {:>6} mentions  score {:+.2}",
                row.topic_number, row.keyword, row.total, row.score
            );
        }
    }
    Ok(Some(topics))
}

fn print_topics(topics: &TopicClusterResult) {
    println!(
        "\n{} groups, {} topics",
        topics.groups.len(),
        topics.topic_count()
    );
    for group in &topics.groups {
        println!("\nGroup {}: {}", group.group, group.llm_label);
        for topic in &group.topics {
            println!(
                "  #{:<4} {:<40} {:>6} posts",
                topic.topic_number, topic.topic_label, topic.post_count
            );
        }
    }
}

async fn browse(
    client: &OcssApiClient,
    config: &AppConfig,
    params: SearchParams,
    filter: &str,
    offset: u64,
    all: bool,
) -> Result<(), CoreError> {
    let source = PagedDatasetSource::new(
        Arc::new(client.clone()),
        config.dataset.page_size,
        config.dataset.refetch_debounce(),
    );

    let rows = if all {
        source.fetch_all(&params, filter).await?
    } else {
        let page = source.load(&params, filter, offset).await?;
        println!(
            "Rows {}-{} of {} ({} total)",
            offset + 1,
            offset + page.rows.len() as u64,
            page.filtered_rows,
            page.total_rows
        );
        if page.possibly_insufficient() {
            println!("Warning: few matching posts, clustering results may be unreliable");
        }
        page.rows
    };

    for row in rows {
        println!("{:<10} {:<60} {}", row.id, row.title, row.created_utc);
    }
    Ok(())
}

async fn history(
    client: &OcssApiClient,
    email: &str,
    action: HistoryAction,
) -> Result<(), CoreError> {
    let store = SearchHistoryStore::new(Arc::new(client.clone()), email);
    match action {
        HistoryAction::List => {
            store.list().await?;
        }
        HistoryAction::Remove { search_id } => {
            store.list().await?;
            store.remove(search_id).await?;
        }
        HistoryAction::Clear => store.clear_all().await?,
    }

    for record in store.records() {
        println!(
            "{:<6} r/{:<24} {:<24} {} to {}  ({})",
            record.search_id,
            record.subreddit,
            record.options.labels(),
            record.date_range.start,
            record.date_range.end,
            record.created_utc
        );
    }
    Ok(())
}

async fn export(
    client: &OcssApiClient,
    params: SearchParams,
    format: ExportFormat,
    filter: &str,
    output: Option<PathBuf>,
) -> Result<(), CoreError> {
    let path = output
        .unwrap_or_else(|| PathBuf::from(format!("{}.{}", params.subreddit, format.extension())));
    let bytes = client.export_data(format, &params, filter).await?;
    tokio::fs::write(&path, &bytes).await?;
    println!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

async fn results(client: &OcssApiClient, action: ResultsAction) -> Result<(), CoreError> {
    match action {
        ResultsAction::List { email } => {
            for result in client.list_results().await? {
                let owned = email
                    .as_deref()
                    .map(|e| result.is_owned_by(e))
                    .unwrap_or(false);
                println!(
                    "{:<6} r/{:<24} {} to {}  {}{}",
                    result.id,
                    result.subreddit,
                    result.date_range.start,
                    result.date_range.end,
                    result.top_topics().join(" | "),
                    if owned { "  (yours)" } else { "" }
                );
            }
        }
        ResultsAction::Topics { result_id } => {
            let groups = client.result_topics(result_id).await?;
            print_topics(&TopicClusterResult {
                groups,
                extra: Default::default(),
            });
        }
        ResultsAction::Remove { result_id, email } => {
            let listed = client.list_results().await?;
            let owned = listed
                .iter()
                .any(|r| r.id == result_id && r.is_owned_by(&email));
            if !owned {
                return Err(CoreError::InvalidInput {
                    message: format!("result {} is not published by {}", result_id, email),
                });
            }
            client.remove_result(result_id).await?;
            println!("Removed result {}", result_id);
        }
    }
    Ok(())
}
