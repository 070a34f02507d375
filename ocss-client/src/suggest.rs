use crate::backend::SuggestionBackend;
use crate::debounce::Debouncer;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Subreddit name completion for the search box.
pub struct SubredditSuggester {
    backend: Arc<dyn SuggestionBackend>,
    debouncer: Debouncer,
}

impl SubredditSuggester {
    pub fn new(backend: Arc<dyn SuggestionBackend>, delay: Duration) -> Self {
        Self {
            backend,
            debouncer: Debouncer::new(delay),
        }
    }

    /// Suggestions for `prefix`, or `None` if a newer lookup superseded
    /// this one.
    ///
    /// An empty prefix clears suggestions without a request. Lookup
    /// failures are logged and read as "no suggestions".
    pub async fn suggest(&self, prefix: &str) -> Option<Vec<String>> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            self.debouncer.cancel();
            return Some(Vec::new());
        }

        self.debouncer
            .run(|| async {
                match self.backend.subreddit_suggestions(prefix).await {
                    Ok(names) => names,
                    Err(e) => {
                        warn!("Subreddit suggestions for '{}' failed: {}", prefix, e);
                        Vec::new()
                    }
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::ScriptedSuggestions;
    use ocss_core::ApiError;

    #[tokio::test(start_paused = true)]
    async fn test_only_latest_lookup_is_delivered() {
        let backend = ScriptedSuggestions::new(&["rust", "rustjerk", "ruby"]);
        let suggester = Arc::new(SubredditSuggester::new(
            backend.clone(),
            Duration::from_millis(150),
        ));

        let early = {
            let suggester = Arc::clone(&suggester);
            tokio::spawn(async move { suggester.suggest("r").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let latest = suggester.suggest("rus").await;

        assert_eq!(early.await.unwrap(), None);
        assert_eq!(
            latest,
            Some(vec!["rust".to_string(), "rustjerk".to_string()])
        );
        assert_eq!(backend.prefixes(), vec!["rus".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_prefix_skips_network() {
        let backend = ScriptedSuggestions::new(&["rust"]);
        let suggester = SubredditSuggester::new(backend.clone(), Duration::from_millis(150));

        assert_eq!(suggester.suggest("   ").await, Some(vec![]));
        assert!(backend.prefixes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reads_as_no_suggestions() {
        let backend = ScriptedSuggestions::new(&["rust"]);
        backend.fail_next(ApiError::Status {
            status_code: 500,
            message: "Request failed with status 500".to_string(),
        });
        let suggester = SubredditSuggester::new(backend, Duration::from_millis(150));

        assert_eq!(suggester.suggest("ru").await, Some(vec![]));
    }
}
