/// Generation Adapter: the single point of entry for every text-generation
/// backend call.
///
/// ARCHITECTURAL RULE: No other module may talk to a generation backend directly.
/// Callers resolve a `BackendConfig` for the workspace, then call
/// `GenerationAdapter::invoke::<T>()` with a rendered prompt and get back a
/// validated `T` or an `LlmError`. Partial results are never returned.
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::GenerationSettings;

pub mod backends;
pub mod prompts;
pub mod resolve;

use backends::{BackendRegistry, GenerationRequest};
use resolve::{BackendConfig, ConfigError};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Response failed validation: {0}")]
    Validation(String),

    #[error("Backend call timed out after {0}s")]
    Timeout(u64),

    #[error("Backend still failing after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("LLM returned empty content")]
    EmptyContent,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A result type a backend can be asked to produce.
///
/// `schema()` is sent to backends that support schema-constrained output;
/// every response, constrained or not, is parsed strictly and then `validate`d.
pub trait StructuredOutput: DeserializeOwned + Send {
    const NAME: &'static str;

    fn schema() -> Value;

    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Shared HTTP transport with timeout and retry on 429 / 5xx / transport errors.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    settings: GenerationSettings,
}

impl LlmClient {
    pub fn new(settings: GenerationSettings) -> Result<Self, LlmError> {
        Ok(Self {
            client: Client::builder().timeout(settings.timeout).build()?,
            settings,
        })
    }

    /// POSTs `body` as JSON and returns the response text of the first
    /// successful attempt. Retries with exponential backoff
    /// (`backoff_base * 2^n`); other 4xx statuses fail immediately.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &B,
    ) -> Result<String, LlmError> {
        let attempts = self.settings.max_attempts.max(1);
        let mut last_error: Option<LlmError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.settings.backoff_base * (1u32 << (attempt - 1).min(16));
                warn!(
                    "Generation call attempt {} failed, retrying after {}ms...",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(url).json(body);
            for (name, value) in headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) if e.is_timeout() => {
                    last_error = Some(LlmError::Timeout(self.settings.timeout.as_secs()));
                    continue;
                }
                Err(e) => {
                    last_error = Some(LlmError::Http(e));
                    continue;
                }
            };

            let status = response.status();

            if status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                warn!("Generation backend returned {}: {}", status, body);
                last_error = Some(LlmError::Api {
                    status: status.as_u16(),
                    message: body,
                });
                continue;
            }

            let text = response.text().await?;
            if !status.is_success() {
                return Err(LlmError::Api {
                    status: status.as_u16(),
                    message: extract_error_message(&text),
                });
            }

            debug!("Generation call succeeded on attempt {}", attempt + 1);
            return Ok(text);
        }

        Err(LlmError::Exhausted {
            attempts,
            last: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt made".to_string()),
        })
    }
}

/// Pulls `error.message` (or a string `error`) out of a provider error body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| body.to_string())
}

/// Uniform contract over every registered backend family.
#[derive(Clone)]
pub struct GenerationAdapter {
    registry: BackendRegistry,
}

impl GenerationAdapter {
    pub fn new(registry: BackendRegistry) -> Self {
        Self { registry }
    }

    pub async fn invoke<T: StructuredOutput>(
        &self,
        backend: &BackendConfig,
        prompt: &str,
    ) -> Result<T, LlmError> {
        let implementation = self.registry.get(&backend.provider)?;
        let schema = T::schema();
        let request = GenerationRequest {
            prompt,
            schema_name: T::NAME,
            schema: &schema,
        };

        debug!(
            "Invoking {} backend '{}' ({:?}) for {}",
            backend.provider,
            backend.id,
            implementation.family(),
            T::NAME
        );
        let text = implementation.generate(backend, &request).await?;
        parse_structured::<T>(&text)
    }
}

/// Strict parse of backend text into `T`: fences stripped, unknown or missing
/// fields rejected, then `T::validate`.
pub fn parse_structured<T: StructuredOutput>(text: &str) -> Result<T, LlmError> {
    let text = strip_json_fences(text);
    if text.is_empty() {
        return Err(LlmError::EmptyContent);
    }
    let value: T = serde_json::from_str(text)?;
    value.validate().map_err(LlmError::Validation)?;
    Ok(value)
}

/// Strips ```json ... ``` or ``` ... ``` code fences from LLM output.
fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else if let Some(stripped) = text.strip_prefix("```") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else {
        text
    }
}
