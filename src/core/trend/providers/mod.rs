mod brave;
mod tavily;

pub use brave::BraveProvider;
pub use tavily::TavilyProvider;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::config::AgentConfig;

/// One search result, normalized across providers. `relevance` is only
/// present when the provider reports a 0..1 confidence score.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub relevance: Option<f64>,
    pub age_hours: Option<f64>,
}

/// External search/trend API. Implementations are constructed only when
/// their API key is configured; a missing key degrades that provider, not
/// the process.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(&self, query: &str, max_results: u8) -> Result<Vec<SearchHit>>;
}

/// Build the fallback chain in priority order from the configured keys.
pub fn build_chain(config: &AgentConfig, client: &reqwest::Client) -> Vec<Arc<dyn SearchProvider>> {
    let mut chain: Vec<Arc<dyn SearchProvider>> = Vec::new();

    match &config.tavily_api_key {
        Some(key) => chain.push(Arc::new(TavilyProvider::new(client.clone(), key.clone()))),
        None => warn!("TAVILY_API_KEY not configured, primary search provider disabled"),
    }
    match &config.brave_api_key {
        Some(key) => chain.push(Arc::new(BraveProvider::new(client.clone(), key.clone()))),
        None => warn!("BRAVE_API_KEY not configured, fallback search provider disabled"),
    }

    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_respects_configured_keys() {
        let mut config = AgentConfig::for_tests("/tmp/x");
        let client = reqwest::Client::new();
        assert!(build_chain(&config, &client).is_empty());

        config.brave_api_key = Some("k".to_string());
        let chain = build_chain(&config, &client);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].name(), "brave");

        config.tavily_api_key = Some("k".to_string());
        let chain = build_chain(&config, &client);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].name(), "tavily");
    }
}
