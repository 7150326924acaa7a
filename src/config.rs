//! Environment-driven configuration

use std::str::FromStr;
use std::time::Duration;

/// Settings for the orchestrator and its HTTP surface
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub db_path: String,
    pub port: u16,
    pub openai_api_key: Option<String>,
    pub openai_assistant_id: Option<String>,
    pub openai_base_url: Option<String>,
    pub rate_limit_per_window: u32,
    pub rate_window: Duration,
    pub daily_output_tokens: u64,
    pub max_output_tokens_per_request: u64,
    pub poll_interval: Duration,
    pub run_timeout: Duration,
    pub upstream_request_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            port: 8000,
            openai_api_key: None,
            openai_assistant_id: None,
            openai_base_url: None,
            rate_limit_per_window: 10,
            rate_window: Duration::from_secs(60),
            daily_output_tokens: 2000,
            max_output_tokens_per_request: 1000,
            poll_interval: Duration::from_millis(500),
            run_timeout: Duration::from_secs(120),
            upstream_request_timeout: Duration::from_secs(30),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparseable values keep their default
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            db_path: non_empty("ASSISTANT_DB_PATH").unwrap_or(defaults.db_path),
            port: parsed(&lookup, "ASSISTANT_PORT", defaults.port),
            openai_api_key: non_empty("OPENAI_API_KEY"),
            openai_assistant_id: non_empty("OPENAI_ASSISTANT_ID"),
            openai_base_url: non_empty("OPENAI_BASE_URL"),
            rate_limit_per_window: parsed(
                &lookup,
                "ASSISTANT_RATE_LIMIT_PER_MINUTE",
                defaults.rate_limit_per_window,
            ),
            rate_window: Duration::from_secs(parsed(
                &lookup,
                "ASSISTANT_RATE_WINDOW_SECS",
                defaults.rate_window.as_secs(),
            )),
            daily_output_tokens: parsed(
                &lookup,
                "ASSISTANT_DAILY_OUTPUT_TOKENS",
                defaults.daily_output_tokens,
            ),
            max_output_tokens_per_request: parsed(
                &lookup,
                "ASSISTANT_MAX_OUTPUT_TOKENS_PER_REQUEST",
                defaults.max_output_tokens_per_request,
            ),
            poll_interval: Duration::from_millis(parsed(
                &lookup,
                "ASSISTANT_POLL_INTERVAL_MS",
                u64::try_from(defaults.poll_interval.as_millis()).unwrap_or(500),
            )),
            run_timeout: Duration::from_secs(parsed(
                &lookup,
                "ASSISTANT_RUN_TIMEOUT_SECS",
                defaults.run_timeout.as_secs(),
            )),
            upstream_request_timeout: defaults.upstream_request_timeout,
        }
    }
}

fn parsed<T: FromStr + Copy + std::fmt::Display>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, default = %default, "Ignoring unparseable setting");
            default
        }),
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    format!("{home}/.assistant-orchestrator/orchestrator.db")
}
