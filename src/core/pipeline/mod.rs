mod rss;

pub use rss::RssSource;

use async_trait::async_trait;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::core::events::EventSink;
use crate::core::store::Store;
use crate::core::store::types::{ArticleDraft, RunResult};
use crate::core::trend::{Candidate, TrendRanker};

/// Pipeline stages, in execution order. The supervisor in `execute` maps
/// the failing stage to a decision: Discover and Rank failures abort the
/// run, Generate and Persist failures skip the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discover,
    Rank,
    Generate,
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Discover => "discover",
            Stage::Rank => "rank",
            Stage::Generate => "generate",
            Stage::Persist => "persist",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug)]
pub struct StageError {
    pub stage: Stage,
    pub message: String,
}

impl StageError {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed: {}", self.stage, self.message)
    }
}

impl std::error::Error for StageError {}

/// Where candidates come from. The default is the RSS source; scrapers or
/// other discovery backends slot in behind this.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn discover(&self) -> Result<Vec<Candidate>, StageError>;
}

/// Turns a selected candidate into a publishable draft. The production
/// content-generation/translation step is external to this crate; the
/// default renders the candidate itself.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, candidate: &Candidate, score: f64)
    -> Result<ArticleDraft, StageError>;
}

/// Content-derived identity of a candidate, used for dedup against already
/// published articles.
pub fn content_hash(title: &str) -> String {
    let normalized = title.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;
    for c in title.to_lowercase().chars() {
        if c.is_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 80 {
            break;
        }
    }
    slug.trim_matches('-').to_string()
}

/// Default generator: renders the draft straight from the candidate.
pub struct DraftGenerator;

#[async_trait]
impl ContentGenerator for DraftGenerator {
    async fn generate(
        &self,
        candidate: &Candidate,
        score: f64,
    ) -> Result<ArticleDraft, StageError> {
        let slug = slugify(&candidate.title);
        if slug.is_empty() {
            return Err(StageError::new(
                Stage::Generate,
                format!("candidate title '{}' produced an empty slug", candidate.title),
            ));
        }
        Ok(ArticleDraft {
            slug,
            title: candidate.title.clone(),
            body: candidate.description.clone(),
            content_hash: content_hash(&candidate.title),
            trend_score: score,
        })
    }
}

/// One full run: discover → dedup → rank → select → generate → persist.
pub struct Pipeline {
    source: Arc<dyn ContentSource>,
    generator: Arc<dyn ContentGenerator>,
    ranker: Arc<TrendRanker>,
    store: Arc<Store>,
    events: EventSink,
    min_per_run: usize,
    max_per_run: usize,
}

impl Pipeline {
    pub fn new(
        config: &AgentConfig,
        source: Arc<dyn ContentSource>,
        generator: Arc<dyn ContentGenerator>,
        ranker: Arc<TrendRanker>,
        store: Arc<Store>,
        events: EventSink,
    ) -> Self {
        Self {
            source,
            generator,
            ranker,
            store,
            events,
            min_per_run: config.min_articles_per_run.max(1),
            max_per_run: config.max_articles_per_run.max(config.min_articles_per_run.max(1)),
        }
    }

    /// Run the pipeline to completion. Never returns an error; every
    /// failure is folded into the result so the caller can settle the job
    /// and reschedule regardless of outcome.
    pub async fn execute(&self, job_seq: i64) -> RunResult {
        let started = Instant::now();
        let mut errors: Vec<String> = Vec::new();

        self.events.info("Run started: discovering candidates");
        let candidates = match self.source.discover().await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("{}", e);
                self.events.error(e.to_string());
                return RunResult::failed(e.to_string(), started.elapsed().as_secs_f64());
            }
        };
        let scraped = candidates.len() as u32;
        self.events.info(format!("Discovered {} candidates", scraped));

        let fresh = self.dedup(candidates).await;
        if fresh.is_empty() {
            self.events.success("Nothing new to publish");
            return RunResult {
                articles_scraped: scraped,
                articles_created: 0,
                duration_seconds: started.elapsed().as_secs_f64(),
                success: true,
                errors,
            };
        }
        self.events
            .info(format!("{} candidates after dedup, ranking", fresh.len()));

        let ranked = match self.ranker.rank(&fresh).await {
            Ok(ranked) => ranked,
            Err(e) => {
                let e = StageError::new(Stage::Rank, e.to_string());
                error!("{}", e);
                self.events.error(e.to_string());
                return RunResult {
                    articles_scraped: scraped,
                    articles_created: 0,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    success: false,
                    errors: vec![e.to_string()],
                };
            }
        };

        let target = {
            let mut rng = rand::thread_rng();
            rng.gen_range(self.min_per_run..=self.max_per_run)
        };
        let selected: Vec<_> = ranked.iter().take(target).collect();
        self.events.info(format!(
            "Selected top {} of {} ranked candidates",
            selected.len(),
            ranked.len()
        ));

        let mut created = 0u32;
        for item in selected {
            let candidate = &fresh[item.index];
            let draft = match self.generator.generate(candidate, item.score).await {
                Ok(draft) => draft,
                Err(e) => {
                    warn!("{}", e);
                    self.events.error(e.to_string());
                    errors.push(e.to_string());
                    continue;
                }
            };

            match self.store.insert_article(&draft, Some(job_seq)).await {
                Ok(true) => {
                    created += 1;
                    self.events
                        .success(format!("Published '{}' (score {:.0})", draft.title, item.score));
                }
                Ok(false) => {
                    info!("Skipped duplicate article '{}'", draft.title);
                }
                Err(e) => {
                    let e = StageError::new(Stage::Persist, e.to_string());
                    warn!("{}", e);
                    self.events.error(e.to_string());
                    errors.push(e.to_string());
                }
            }
        }

        let result = RunResult {
            articles_scraped: scraped,
            articles_created: created,
            duration_seconds: started.elapsed().as_secs_f64(),
            success: errors.is_empty(),
            errors,
        };
        self.events.success(format!(
            "Run finished: {} created from {} scraped in {:.1}s",
            result.articles_created, result.articles_scraped, result.duration_seconds
        ));
        result
    }

    /// Drop in-batch duplicates and candidates already published.
    async fn dedup(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let mut seen = std::collections::HashSet::new();
        let mut fresh = Vec::new();
        for candidate in candidates {
            let hash = content_hash(&candidate.title);
            if !seen.insert(hash.clone()) {
                continue;
            }
            match self.store.has_article_hash(&hash).await {
                Ok(true) => {}
                Ok(false) => fresh.push(candidate),
                Err(e) => {
                    // A dedup read failure keeps the candidate; the unique
                    // constraint at persist time is the backstop.
                    warn!("Dedup lookup failed: {}", e);
                    fresh.push(candidate);
                }
            }
        }
        fresh
    }
}
