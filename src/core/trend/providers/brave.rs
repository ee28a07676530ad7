use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{SearchHit, SearchProvider};

const BRAVE_API_URL: &str = "https://api.search.brave.com/res/v1/web/search";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Fallback provider. Keyed via the `X-Subscription-Token` header; queries
/// are restricted to past-day freshness since the scores feed a trend
/// signal, not general search.
pub struct BraveProvider {
    client: reqwest::Client,
    api_key: String,
}

#[derive(Deserialize)]
struct BraveResponse {
    web: Option<BraveWeb>,
}

#[derive(Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Deserialize)]
struct BraveResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    description: String,
    age: Option<String>,
}

impl BraveProvider {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self { client, api_key }
    }
}

/// Turn Brave's relative age phrase ("2 hours ago", "1 day ago") into
/// hours. Unrecognized phrases yield None rather than a guess.
fn age_hours_from_phrase(raw: &str) -> Option<f64> {
    let lower = raw.to_lowercase();
    let amount: f64 = lower
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(1.0);

    if lower.contains("minute") || lower.contains("second") {
        Some(amount / 60.0)
    } else if lower.contains("hour") {
        Some(amount)
    } else if lower.contains("day") {
        Some(amount * 24.0)
    } else if lower.contains("week") {
        Some(amount * 24.0 * 7.0)
    } else {
        None
    }
}

#[async_trait]
impl SearchProvider for BraveProvider {
    fn name(&self) -> &'static str {
        "brave"
    }

    async fn search(&self, query: &str, max_results: u8) -> Result<Vec<SearchHit>> {
        let count = max_results.to_string();
        let response = self
            .client
            .get(BRAVE_API_URL)
            .timeout(REQUEST_TIMEOUT)
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .query(&[
                ("q", query),
                ("count", count.as_str()),
                ("search_lang", "en"),
                ("country", "US"),
                ("safesearch", "moderate"),
                ("text_decorations", "false"),
                ("freshness", "pd"),
            ])
            .send()
            .await
            .context("brave request failed")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("brave returned {}: {}", status, detail));
        }

        let parsed: BraveResponse = response
            .json()
            .await
            .context("brave response was not valid JSON")?;

        Ok(parsed
            .web
            .map(|w| w.results)
            .unwrap_or_default()
            .into_iter()
            .map(|r| SearchHit {
                title: r.title,
                url: r.url,
                snippet: r.description,
                relevance: None,
                age_hours: r.age.as_deref().and_then(age_hours_from_phrase),
            })
            .collect())
    }
}
