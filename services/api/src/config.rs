//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The
//! `.env` file is used for local development.

use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    pub openai_api_key: Option<String>,
    /// Base URL override for OpenAI-compatible providers.
    pub openai_base_url: Option<String>,
    pub planner_model: String,
    pub interviewer_model: String,
    pub content_model: String,
    pub embedding_model: String,
    pub search_api_url: Option<String>,
    pub search_api_key: Option<String>,
    /// Wall-clock timeout of a single model call.
    pub call_timeout: Duration,
    /// Overall budget for one course generation run.
    pub pipeline_timeout: Duration,
    /// Bounded fan-out across independent courses.
    pub max_concurrent_generations: usize,
}

fn parse_secs(name: &str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(Duration::from_secs(default)),
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for
    /// development, but this is skipped in test environments to ensure tests
    /// are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        // --- Load Server and Database Settings ---
        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Load Provider Settings ---
        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let openai_base_url = std::env::var("OPENAI_BASE_URL").ok();

        let planner_model =
            std::env::var("PLANNER_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        let interviewer_model =
            std::env::var("INTERVIEWER_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        let content_model =
            std::env::var("CONTENT_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        let embedding_model = std::env::var("EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());

        // --- Load Capability Settings ---
        let search_api_url = std::env::var("SEARCH_API_URL").ok();
        let search_api_key = std::env::var("SEARCH_API_KEY").ok();

        // --- Load Pipeline Budgets ---
        let call_timeout = parse_secs("GENERATION_CALL_TIMEOUT_SECS", 120)?;
        let pipeline_timeout = parse_secs("PIPELINE_TIMEOUT_SECS", 1800)?;
        let max_concurrent_generations = match std::env::var("MAX_CONCURRENT_GENERATIONS") {
            Err(_) => 4,
            Ok(raw) => raw.parse::<usize>().map_err(|e| {
                ConfigError::InvalidValue("MAX_CONCURRENT_GENERATIONS".to_string(), e.to_string())
            })?,
        };

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            openai_api_key,
            openai_base_url,
            planner_model,
            interviewer_model,
            content_model,
            embedding_model,
            search_api_url,
            search_api_key,
            call_timeout,
            pipeline_timeout,
            max_concurrent_generations,
        })
    }
}
