use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use typed_builder::TypedBuilder;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub allowed_origins: Vec<String>,
    pub rate_limit_enabled: bool,
    pub log_format: LogFormat,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = EngineConfig::default();
        let engine = EngineConfig::builder()
            .dispatcher_tick(Duration::from_secs(parse_var(
                "DISPATCHER_TICK_SECS",
                defaults.dispatcher_tick.as_secs(),
            )?))
            .dispatcher_batch_size(parse_var(
                "DISPATCHER_BATCH_SIZE",
                defaults.dispatcher_batch_size,
            )?)
            .dispatch_concurrency(parse_var(
                "DISPATCH_CONCURRENCY",
                defaults.dispatch_concurrency,
            )?)
            .bulk_concurrency(parse_var("BULK_CONCURRENCY", defaults.bulk_concurrency)?)
            .post_max_retries(parse_var("POST_MAX_RETRIES", defaults.post_max_retries)?)
            .retry_backoff_base(Duration::from_secs(parse_var(
                "RETRY_BACKOFF_SECS",
                defaults.retry_backoff_base.as_secs(),
            )?))
            .stale_claim_after(Duration::from_secs(parse_var(
                "STALE_CLAIM_SECS",
                defaults.stale_claim_after.as_secs(),
            )?))
            .remote_timeout(Duration::from_secs(parse_var(
                "REMOTE_TIMEOUT_SECS",
                defaults.remote_timeout.as_secs(),
            )?))
            .build();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: parse_var("PORT", 8080)?,
            jwt_secret: env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            jwt_issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "wp-automation".to_string()),
            openai_api_key: env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            openai_model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            rate_limit_enabled: parse_var("RATE_LIMIT_ENABLED", true)?,
            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            engine,
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a valid value, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

/// Tunables for the scheduling engine.
#[derive(Debug, Clone, TypedBuilder)]
pub struct EngineConfig {
    /// How often the scheduled post dispatcher looks for due posts.
    #[builder(default = Duration::from_secs(60))]
    pub dispatcher_tick: Duration,

    /// Due posts claimed per tick.
    #[builder(default = 50)]
    pub dispatcher_batch_size: i64,

    /// In-flight publishes per tick.
    #[builder(default = 5)]
    pub dispatch_concurrency: usize,

    /// In-flight remote calls per bulk operation.
    #[builder(default = 5)]
    pub bulk_concurrency: usize,

    /// Default retry budget for a scheduled post.
    #[builder(default = 3)]
    pub post_max_retries: i32,

    #[builder(default = Duration::from_secs(60))]
    pub retry_backoff_base: Duration,

    #[builder(default = Duration::from_secs(60 * 60))]
    pub retry_backoff_cap: Duration,

    /// PUBLISHING claims and RUNNING executions older than this are treated
    /// as abandoned by a crashed process.
    #[builder(default = Duration::from_secs(10 * 60))]
    pub stale_claim_after: Duration,

    #[builder(default = Duration::from_secs(30))]
    pub remote_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.dispatcher_tick, Duration::from_secs(60));
        assert_eq!(config.dispatcher_batch_size, 50);
        assert_eq!(config.dispatch_concurrency, 5);
        assert_eq!(config.bulk_concurrency, 5);
        assert_eq!(config.post_max_retries, 3);
        assert_eq!(config.stale_claim_after, Duration::from_secs(600));
    }

    #[test]
    fn builder_overrides_single_fields() {
        let config = EngineConfig::builder()
            .dispatcher_tick(Duration::from_millis(200))
            .build();
        assert_eq!(config.dispatcher_tick, Duration::from_millis(200));
        assert_eq!(config.bulk_concurrency, 5);
    }

    #[test]
    fn parse_var_falls_back_to_default() {
        let value: u16 = parse_var("AUTOMATION_CORE_TEST_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }
}
