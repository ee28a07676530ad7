use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{SearchHit, SearchProvider};

const TAVILY_API_URL: &str = "https://api.tavily.com/search";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Primary provider. The API key travels in the request body.
pub struct TavilyProvider {
    client: reqwest::Client,
    api_key: String,
}

#[derive(Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: u8,
    search_depth: &'a str,
    include_answer: bool,
    include_raw_content: bool,
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
    score: Option<f64>,
    published_date: Option<String>,
}

impl TavilyProvider {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self { client, api_key }
    }
}

fn age_hours_from_date(raw: &str) -> Option<f64> {
    let published = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| raw.parse::<DateTime<Utc>>())
        .ok()?;
    let age = Utc::now().signed_duration_since(published);
    Some((age.num_seconds().max(0) as f64) / 3600.0)
}

#[async_trait]
impl SearchProvider for TavilyProvider {
    fn name(&self) -> &'static str {
        "tavily"
    }

    async fn search(&self, query: &str, max_results: u8) -> Result<Vec<SearchHit>> {
        let body = TavilyRequest {
            api_key: &self.api_key,
            query,
            max_results,
            search_depth: "basic",
            include_answer: false,
            include_raw_content: false,
        };

        let response = self
            .client
            .post(TAVILY_API_URL)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .context("tavily request failed")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("tavily returned {}: {}", status, detail));
        }

        let parsed: TavilyResponse = response
            .json()
            .await
            .context("tavily response was not valid JSON")?;

        Ok(parsed
            .results
            .into_iter()
            .map(|r| SearchHit {
                title: r.title,
                url: r.url,
                snippet: r.content,
                relevance: r.score,
                age_hours: r.published_date.as_deref().and_then(age_hours_from_date),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_published_dates() {
        let recent = Utc::now() - chrono::Duration::hours(2);
        let age = age_hours_from_date(&recent.to_rfc3339()).unwrap();
        assert!(age > 1.9 && age < 2.1);
    }

    #[test]
    fn garbage_date_yields_none() {
        assert!(age_hours_from_date("soonish").is_none());
    }

    #[test]
    fn response_parsing_tolerates_missing_fields() {
        let parsed: TavilyResponse =
            serde_json::from_str(r#"{"results":[{"title":"t","url":"u"}]}"#).unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert!(parsed.results[0].score.is_none());
        assert_eq!(parsed.results[0].content, "");
    }

    #[test]
    fn empty_response_is_empty_results() {
        let parsed: TavilyResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.results.is_empty());
    }
}
