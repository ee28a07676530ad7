pub mod keywords;
pub mod providers;
pub mod rate_limit;

use anyhow::{Result, bail};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::core::cache::CacheManager;
use providers::{SearchHit, SearchProvider};
use rate_limit::RateGate;

const MAX_RESULTS_PER_QUERY: u8 = 5;

const SOCIAL_DOMAINS: &[&str] = &[
    "reddit.com",
    "twitter.com",
    "x.com",
    "news.ycombinator.com",
    "quora.com",
    "medium.com",
];
const VIDEO_DOMAINS: &[&str] = &["youtube.com", "vimeo.com"];
const AUTHORITY_DOMAINS: &[&str] = &[
    "techcrunch.com",
    "theverge.com",
    "wired.com",
    "bloomberg.com",
    "reuters.com",
];

/// The unit the ranking engine scores. Lives only for one pipeline run.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub title: String,
    pub description: String,
}

/// `index` refers to the candidate's position in the original input slice,
/// including when the input was down-sampled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedCandidate {
    pub index: usize,
    pub score: f64,
}

/// Scores candidates against external search providers and returns them
/// ordered by descending trend score.
pub struct TrendRanker {
    providers: Vec<Arc<dyn SearchProvider>>,
    cache: Arc<CacheManager>,
    gate: Arc<RateGate>,
    batch_size: usize,
    batch_delay: Duration,
    max_candidates: usize,
    cache_ttl: Duration,
}

impl TrendRanker {
    pub fn new(
        config: &AgentConfig,
        providers: Vec<Arc<dyn SearchProvider>>,
        cache: Arc<CacheManager>,
    ) -> Self {
        Self {
            providers,
            cache,
            gate: Arc::new(RateGate::new(Duration::from_millis(
                config.provider_min_interval_ms,
            ))),
            batch_size: config.batch_size.max(1),
            batch_delay: Duration::from_millis(config.batch_delay_ms),
            max_candidates: config.max_candidates.max(1),
            cache_ttl: Duration::from_secs(config.trend_cache_ttl_secs),
        }
    }

    /// Rank candidates by trend score, descending; ties keep input order.
    ///
    /// Oversized input is down-sampled to the cap by even-stride selection
    /// over the input order, never rejected; the returned indices always
    /// refer to positions in `candidates` as passed in. Errors only when no
    /// provider is configured at all; per-candidate provider failures score
    /// that candidate 0.
    pub async fn rank(&self, candidates: &[Candidate]) -> Result<Vec<RankedCandidate>> {
        if self.providers.is_empty() {
            bail!("no search provider is configured, cannot rank candidates");
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let indices = sample_indices(candidates.len(), self.max_candidates);
        if indices.len() < candidates.len() {
            info!(
                "Down-sampled {} candidates to {}",
                candidates.len(),
                indices.len()
            );
        }

        let mut ranked = Vec::with_capacity(indices.len());
        for (batch_no, batch) in indices.chunks(self.batch_size).enumerate() {
            if batch_no > 0 && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }

            let mut set = JoinSet::new();
            for &index in batch {
                let candidate = candidates[index].clone();
                let providers = self.providers.clone();
                let cache = self.cache.clone();
                let gate = self.gate.clone();
                let ttl = self.cache_ttl;
                set.spawn(async move {
                    let score = score_candidate(&providers, &cache, &gate, &candidate, ttl).await;
                    RankedCandidate { index, score }
                });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(item) => ranked.push(item),
                    Err(e) => warn!("Trend scoring task failed: {}", e),
                }
            }
        }

        // Join order is nondeterministic; re-establish input order before
        // the stable sort so equal scores keep it.
        ranked.sort_by_key(|r| r.index);
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(ranked)
    }
}

/// Pick `cap` indices evenly across `0..len`, preserving order.
fn sample_indices(len: usize, cap: usize) -> Vec<usize> {
    if len <= cap {
        (0..len).collect()
    } else {
        (0..cap).map(|k| k * len / cap).collect()
    }
}

fn cache_key(query: &str) -> String {
    format!("trend:{}", hex::encode(Sha256::digest(query.as_bytes())))
}

async fn score_candidate(
    providers: &[Arc<dyn SearchProvider>],
    cache: &CacheManager,
    gate: &RateGate,
    candidate: &Candidate,
    cache_ttl: Duration,
) -> f64 {
    let query = keywords::extract_keywords(&candidate.title, &candidate.description);
    if query.is_empty() {
        return 0.0;
    }

    let key = cache_key(&query);
    if let Some(score) = cache.get::<f64>(&key).await {
        return score;
    }

    let mut score = 0.0;
    let mut answered = false;
    for (position, provider) in providers.iter().enumerate() {
        gate.wait().await;
        match provider.search(&query, MAX_RESULTS_PER_QUERY).await {
            Ok(hits) => {
                answered = true;
                if hits.is_empty() {
                    debug!("{} returned no results for '{}'", provider.name(), query);
                    continue;
                }
                // Domain bonuses only apply on the fallback path; the
                // primary already carries its own relevance signal.
                score = score_hits(&hits, &candidate.title, position > 0);
                break;
            }
            Err(e) => {
                warn!("{} search failed for '{}': {}", provider.name(), query, e);
            }
        }
    }

    // A chain where every provider errored is not a provider verdict;
    // leaving it uncached lets the next run retry.
    if answered {
        cache.set(&key, &score, cache_ttl, &["trend"]).await;
    }
    score
}

fn score_hits(hits: &[SearchHit], title: &str, domain_bonuses: bool) -> f64 {
    if hits.is_empty() {
        return 0.0;
    }

    let mut score = (hits.len() * 10).min(100) as f64;

    let title_lower = title.to_lowercase();
    let title_words: Vec<&str> = title_lower
        .split_whitespace()
        .filter(|w| w.len() > 3)
        .collect();

    for hit in hits {
        if let Some(relevance) = hit.relevance {
            score += relevance * 50.0;
        }

        if !title_words.is_empty() {
            let hit_title = hit.title.to_lowercase();
            let matches = title_words.iter().filter(|w| hit_title.contains(**w)).count();
            score += (matches as f64 / title_words.len() as f64) * 30.0;
        }

        match hit.age_hours {
            Some(h) if h < 24.0 => score += 20.0,
            Some(h) if h < 48.0 => score += 10.0,
            _ => {}
        }

        if domain_bonuses {
            score += domain_bonus(&hit.url);
        }
    }

    score
}

fn domain_bonus(url: &str) -> f64 {
    if SOCIAL_DOMAINS.iter().any(|d| url.contains(d)) {
        40.0
    } else if VIDEO_DOMAINS.iter().any(|d| url.contains(d)) {
        30.0
    } else if AUTHORITY_DOMAINS.iter().any(|d| url.contains(d)) {
        15.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubProvider {
        hits: Vec<SearchHit>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl StubProvider {
        fn returning(hits: Vec<SearchHit>) -> Arc<Self> {
            Arc::new(Self {
                hits,
                fail: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                hits: Vec::new(),
                fail: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SearchProvider for StubProvider {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn search(&self, _query: &str, _max_results: u8) -> Result<Vec<SearchHit>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("HTTP 500");
            }
            Ok(self.hits.clone())
        }
    }

    fn hit(title: &str, url: &str, relevance: Option<f64>, age_hours: Option<f64>) -> SearchHit {
        SearchHit {
            title: title.to_string(),
            url: url.to_string(),
            snippet: String::new(),
            relevance,
            age_hours,
        }
    }

    fn candidates(n: usize) -> Vec<Candidate> {
        // The distinguishing word must be 4+ chars or keyword extraction
        // drops it and every candidate collapses onto one cache key.
        (0..n)
            .map(|i| Candidate {
                title: format!("unique headline topic{i} about robotics"),
                description: format!("longer description text topic{i}"),
            })
            .collect()
    }

    async fn ranker_with(providers: Vec<Arc<StubProvider>>) -> TrendRanker {
        let store = test_store().await;
        let config = AgentConfig::for_tests(store.data_dir());
        let cache = Arc::new(CacheManager::new(Some(store.get_db())));
        let chain = providers
            .into_iter()
            .map(|p| p as Arc<dyn SearchProvider>)
            .collect();
        TrendRanker::new(&config, chain, cache)
    }

    #[tokio::test]
    async fn rank_returns_a_permutation_of_input_indices() {
        let provider = StubProvider::returning(vec![hit("robotics", "https://a", Some(0.5), None)]);
        let ranker = ranker_with(vec![provider]).await;

        let input = candidates(25);
        let ranked = ranker.rank(&input).await.unwrap();
        assert_eq!(ranked.len(), 25);

        let mut indices: Vec<usize> = ranked.iter().map(|r| r.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..25).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn oversized_input_is_capped_with_valid_indices() {
        let provider = StubProvider::returning(Vec::new());
        let ranker = ranker_with(vec![provider]).await;

        let input = candidates(150);
        let ranked = ranker.rank(&input).await.unwrap();
        assert_eq!(ranked.len(), 100);

        let mut seen: Vec<usize> = ranked.iter().map(|r| r.index).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 100);
        assert!(seen.iter().all(|&i| i < 150));
    }

    #[tokio::test]
    async fn all_providers_failing_scores_zero_without_error() {
        let primary = StubProvider::failing();
        let fallback = StubProvider::failing();
        let ranker = ranker_with(vec![primary.clone(), fallback.clone()]).await;

        let ranked = ranker.rank(&candidates(4)).await.unwrap();
        assert_eq!(ranked.len(), 4);
        assert!(ranked.iter().all(|r| r.score == 0.0));
        assert_eq!(primary.call_count(), 4);
        assert_eq!(fallback.call_count(), 4);
    }

    #[tokio::test]
    async fn empty_chain_is_an_error() {
        let ranker = ranker_with(Vec::new()).await;
        assert!(ranker.rank(&candidates(1)).await.is_err());
    }

    #[tokio::test]
    async fn empty_input_is_empty_output() {
        let provider = StubProvider::returning(Vec::new());
        let ranker = ranker_with(vec![provider]).await;
        assert!(ranker.rank(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fallback_is_used_when_primary_fails() {
        let primary = StubProvider::failing();
        let fallback =
            StubProvider::returning(vec![hit("robotics", "https://reddit.com/r/x", None, None)]);
        let ranker = ranker_with(vec![primary, fallback.clone()]).await;

        let ranked = ranker.rank(&candidates(1)).await.unwrap();
        assert_eq!(fallback.call_count(), 1);
        // 1 result floor (10) + domain bonus on the fallback path (40).
        assert!(ranked[0].score >= 50.0);
    }

    #[tokio::test]
    async fn second_pass_is_served_from_cache() {
        let provider = StubProvider::returning(vec![hit("robotics", "https://a", Some(0.9), None)]);
        let ranker = ranker_with(vec![provider.clone()]).await;

        let input = candidates(6);
        let first = ranker.rank(&input).await.unwrap();
        assert_eq!(provider.call_count(), 6);

        let second = ranker.rank(&input).await.unwrap();
        assert_eq!(provider.call_count(), 6); // no new provider calls
        assert_eq!(first, second);
    }

    #[test]
    fn stride_sampling_is_even_and_ordered() {
        let indices = sample_indices(10, 4);
        assert_eq!(indices, vec![0, 2, 5, 7]);
        assert_eq!(sample_indices(3, 100), vec![0, 1, 2]);
        assert_eq!(sample_indices(150, 100).len(), 100);
    }

    #[test]
    fn score_aggregation_bands() {
        let title = "quantum computing breakthrough";

        // Floor only: no relevance, no overlap, no age.
        assert_eq!(score_hits(&[hit("zzz", "https://a", None, None)], title, false), 10.0);

        // Full overlap adds 30.
        let full = score_hits(
            &[hit("quantum computing breakthrough", "https://a", None, None)],
            title,
            false,
        );
        assert_eq!(full, 40.0);

        // Recency bands.
        let fresh = score_hits(&[hit("zzz", "https://a", None, Some(3.0))], title, false);
        assert_eq!(fresh, 30.0);
        let stale = score_hits(&[hit("zzz", "https://a", None, Some(36.0))], title, false);
        assert_eq!(stale, 20.0);
        let old = score_hits(&[hit("zzz", "https://a", None, Some(90.0))], title, false);
        assert_eq!(old, 10.0);

        // Relevance weighting.
        let relevant = score_hits(&[hit("zzz", "https://a", Some(0.8), None)], title, false);
        assert_eq!(relevant, 10.0 + 0.8 * 50.0);

        // Result-count floor saturates at 100.
        let many: Vec<SearchHit> = (0..12).map(|_| hit("zzz", "https://a", None, None)).collect();
        assert_eq!(score_hits(&many, title, false), 100.0);
    }

    #[test]
    fn domain_bonuses_only_on_fallback_path() {
        let title = "zzz";
        let social = vec![hit("x", "https://reddit.com/r/rust", None, None)];
        assert_eq!(score_hits(&social, title, false), 10.0);
        assert_eq!(score_hits(&social, title, true), 50.0);

        let video = vec![hit("x", "https://youtube.com/watch", None, None)];
        assert_eq!(score_hits(&video, title, true), 40.0);

        let authority = vec![hit("x", "https://reuters.com/article", None, None)];
        assert_eq!(score_hits(&authority, title, true), 25.0);
    }
}
