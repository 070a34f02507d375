use serde::{Deserialize, Serialize};

/// Entries with fewer mentions than this are left off the chart.
pub const MIN_CHART_MENTIONS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SentimentBucket {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub avg_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SentimentBreakdown {
    #[serde(default)]
    pub negative: SentimentBucket,
    #[serde(default)]
    pub neutral: SentimentBucket,
    #[serde(default)]
    pub positive: SentimentBucket,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentimentEntry {
    pub topic_number: i64,
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub sentiment: SentimentBreakdown,
}

impl SentimentEntry {
    pub fn total_mentions(&self) -> u64 {
        self.sentiment.negative.count + self.sentiment.neutral.count + self.sentiment.positive.count
    }

    /// First token of the comma-separated keyword list.
    pub fn first_keyword(&self) -> &str {
        self.keyword.split(',').next().unwrap_or("").trim()
    }

    /// Count-weighted score in `[-1, 1]`; neutral mentions only dilute it.
    pub fn weighted_score(&self) -> f64 {
        let total = self.total_mentions();
        if total == 0 {
            return 0.0;
        }
        let neg = &self.sentiment.negative;
        let pos = &self.sentiment.positive;
        (neg.count as f64 * -neg.avg_score + pos.count as f64 * pos.avg_score) / total as f64
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SentimentResult(pub Vec<SentimentEntry>);

impl SentimentResult {
    /// Decodes a sentiment job result. The canonical shape is a bare array;
    /// `{"sentiment": [...]}` and `{"result": ...}` wrappers are unwrapped.
    pub fn from_payload(payload: serde_json::Value) -> Result<Self, serde_json::Error> {
        let mut payload = payload;
        loop {
            payload = match payload {
                serde_json::Value::Object(mut map) => {
                    if let Some(inner) = map.remove("sentiment") {
                        inner
                    } else if let Some(inner) = map.remove("result") {
                        inner
                    } else {
                        return serde_json::from_value(serde_json::Value::Object(map));
                    }
                }
                other => return serde_json::from_value(other),
            };
        }
    }

    pub fn entries(&self) -> &[SentimentEntry] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn chart_rows(&self) -> Vec<SentimentChartRow> {
        self.0
            .iter()
            .filter(|e| e.total_mentions() >= MIN_CHART_MENTIONS)
            .map(SentimentChartRow::from)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentimentChartRow {
    pub topic_number: i64,
    pub keyword: String,
    pub total: u64,
    pub score: f64,
}

impl From<&SentimentEntry> for SentimentChartRow {
    fn from(entry: &SentimentEntry) -> Self {
        Self {
            topic_number: entry.topic_number,
            keyword: entry.first_keyword().to_string(),
            total: entry.total_mentions(),
            score: entry.weighted_score(),
        }
    }
}
