use std::path::PathBuf;
use std::str::FromStr;

/// Immutable process configuration, resolved once at startup from the
/// environment. Nothing re-reads environment state after this point;
/// runtime-tunable knobs (enabled, interval) live in the settings store
/// instead.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_dir: PathBuf,

    pub tavily_api_key: Option<String>,
    pub brave_api_key: Option<String>,
    pub feed_urls: Vec<String>,

    pub api_host: String,
    pub api_port: u16,

    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub provider_min_interval_ms: u64,
    pub max_candidates: usize,
    pub trend_cache_ttl_secs: u64,

    pub min_articles_per_run: usize,
    pub max_articles_per_run: usize,

    pub lock_duration_ms: i64,
    pub max_stalled_count: u32,
    pub max_attempts: u32,
    pub execution_timeout_secs: u64,
    pub trigger_cooldown_secs: i64,

    pub startup_retries: u32,
    pub startup_retry_delay_secs: u64,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("TRENDWIRE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("trendwire")
            });

        let feed_urls = std::env::var("TRENDWIRE_FEED_URLS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            data_dir,
            tavily_api_key: std::env::var("TAVILY_API_KEY").ok().filter(|k| !k.is_empty()),
            brave_api_key: std::env::var("BRAVE_API_KEY").ok().filter(|k| !k.is_empty()),
            feed_urls,
            api_host: std::env::var("TRENDWIRE_API_HOST")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            api_port: env_parse("TRENDWIRE_API_PORT", 8710),
            batch_size: env_parse("TRENDWIRE_BATCH_SIZE", 10),
            batch_delay_ms: env_parse("TRENDWIRE_BATCH_DELAY_MS", 1000),
            provider_min_interval_ms: env_parse("TRENDWIRE_PROVIDER_MIN_INTERVAL_MS", 200),
            max_candidates: env_parse("TRENDWIRE_MAX_CANDIDATES", 100),
            trend_cache_ttl_secs: env_parse("TRENDWIRE_TREND_CACHE_TTL_SECS", 15 * 60),
            min_articles_per_run: env_parse("AGENT_MIN_ARTICLES_PER_RUN", 2),
            max_articles_per_run: env_parse("AGENT_MAX_ARTICLES_PER_RUN", 3),
            lock_duration_ms: env_parse("TRENDWIRE_LOCK_DURATION_MS", 1_200_000),
            max_stalled_count: env_parse("TRENDWIRE_MAX_STALLED_COUNT", 2),
            max_attempts: env_parse("TRENDWIRE_MAX_ATTEMPTS", 3),
            execution_timeout_secs: env_parse("TRENDWIRE_EXECUTION_TIMEOUT_SECS", 18 * 60),
            trigger_cooldown_secs: env_parse("TRENDWIRE_TRIGGER_COOLDOWN_SECS", 30),
            startup_retries: env_parse("TRENDWIRE_STARTUP_RETRIES", 10),
            startup_retry_delay_secs: env_parse("TRENDWIRE_STARTUP_RETRY_DELAY_SECS", 5),
        }
    }

    /// Config with defaults and a throwaway data dir, for tests.
    #[cfg(test)]
    pub fn for_tests(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            tavily_api_key: None,
            brave_api_key: None,
            feed_urls: Vec::new(),
            api_host: "127.0.0.1".to_string(),
            api_port: 0,
            batch_size: 10,
            batch_delay_ms: 0,
            provider_min_interval_ms: 0,
            max_candidates: 100,
            trend_cache_ttl_secs: 15 * 60,
            min_articles_per_run: 2,
            max_articles_per_run: 3,
            lock_duration_ms: 1_200_000,
            max_stalled_count: 2,
            max_attempts: 3,
            execution_timeout_secs: 18 * 60,
            trigger_cooldown_secs: 30,
            startup_retries: 1,
            startup_retry_delay_secs: 0,
        }
    }
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_on_garbage() {
        // Key is unset in the test environment.
        assert_eq!(env_parse("TRENDWIRE_DOES_NOT_EXIST", 42u16), 42);
    }

    #[test]
    fn test_config_has_sane_run_bounds() {
        let config = AgentConfig::for_tests("/tmp/x");
        assert!(config.min_articles_per_run <= config.max_articles_per_run);
        assert!(config.batch_size > 0);
    }
}
