use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    /// Root of the artifact store (`users/{workspace}/...`).
    pub data_dir: PathBuf,
    /// Global generation backend catalog (`llms.json`).
    pub backend_catalog_path: PathBuf,
    pub render: RenderSettings,
    pub generation: GenerationSettings,
    /// Number of in-process dispatcher workers. 0 runs the API without workers.
    pub worker_concurrency: usize,
    pub task_queue_key: String,
    /// Names this process's in-flight lists (`{key}:processing:{worker_id}:{n}`).
    /// Must be stable across restarts and distinct between processes.
    pub worker_id: String,
    pub port: u16,
    pub rust_log: String,
}

/// Settings for the external typesetting tool.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub command: String,
    pub timeout: Duration,
    /// Run the tool a second time so cross references resolve.
    pub second_pass: bool,
}

/// Timeout and retry policy applied to every generation backend call.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            command: "pdflatex".to_string(),
            timeout: Duration::from_secs(30),
            second_pass: false,
        }
    }
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_attempts: 3,
            backoff_base: Duration::from_millis(1000),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let render = RenderSettings {
            command: optional_env("RENDER_COMMAND", "pdflatex".to_string())?,
            timeout: Duration::from_secs(optional_env("RENDER_TIMEOUT_SECS", 30)?),
            second_pass: optional_env("RENDER_SECOND_PASS", false)?,
        };

        let generation = GenerationSettings {
            timeout: Duration::from_secs(optional_env("GENERATION_TIMEOUT_SECS", 120)?),
            max_attempts: optional_env("GENERATION_MAX_ATTEMPTS", 3u32)?.max(1),
            backoff_base: Duration::from_millis(optional_env("GENERATION_BACKOFF_MS", 1000)?),
        };

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: require_env("REDIS_URL")?,
            data_dir: optional_env("DATA_DIR", PathBuf::from("./data"))?,
            backend_catalog_path: optional_env("BACKEND_CATALOG_PATH", PathBuf::from("./llms.json"))?,
            render,
            generation,
            worker_concurrency: optional_env("WORKER_CONCURRENCY", 2usize)?,
            task_queue_key: optional_env("TASK_QUEUE_KEY", "tailor:tasks".to_string())?,
            worker_id: optional_env(
                "WORKER_ID",
                std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string()),
            )?,
            port: optional_env("PORT", 8080u16)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Environment variable '{key}' has an invalid value: {raw}")),
        Err(_) => Ok(default),
    }
}
