//! Generation backend families and the provider registry.
//!
//! Two wire families exist: OpenAI-style chat completions with schema-constrained
//! output, and the Anthropic Messages API with the schema appended to the prompt.
//! Adding a provider means registering an implementation, not editing callers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::prompts::{schema_appendix, JSON_ONLY_SYSTEM};
use super::resolve::{BackendConfig, ConfigError};
use super::{LlmClient, LlmError};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
const MISTRAL_BASE_URL: &str = "https://api.mistral.ai/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const TEMPERATURE: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFamily {
    /// Chat completions with native structured output.
    SchemaChat,
    /// Free-text chat; structure is requested in the prompt.
    RawChat,
}

/// One structured generation call.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub prompt: &'a str,
    pub schema_name: &'a str,
    pub schema: &'a Value,
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn family(&self) -> BackendFamily;

    /// Returns the raw text the model produced. Parsing happens in the adapter.
    async fn generate(
        &self,
        backend: &BackendConfig,
        request: &GenerationRequest<'_>,
    ) -> Result<String, LlmError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Schema-constrained chat completions
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormatMode {
    /// `response_format: {type: json_schema, ...}`.
    JsonSchema,
    /// `response_format: {type: json_object}` plus the schema in the prompt.
    JsonObject,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
    response_format: Value,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

pub struct SchemaChatBackend {
    client: LlmClient,
    default_base_url: String,
    mode: ResponseFormatMode,
    extra_headers: Vec<(String, String)>,
}

impl SchemaChatBackend {
    pub fn new(client: LlmClient, default_base_url: impl Into<String>, mode: ResponseFormatMode) -> Self {
        Self {
            client,
            default_base_url: default_base_url.into(),
            mode,
            extra_headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.extra_headers.push((name.to_string(), value.to_string()));
        self
    }
}

#[async_trait]
impl GenerationBackend for SchemaChatBackend {
    fn family(&self) -> BackendFamily {
        BackendFamily::SchemaChat
    }

    async fn generate(
        &self,
        backend: &BackendConfig,
        request: &GenerationRequest<'_>,
    ) -> Result<String, LlmError> {
        let (content, response_format) = match self.mode {
            ResponseFormatMode::JsonSchema => (
                request.prompt.to_string(),
                json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": request.schema_name,
                        "strict": true,
                        "schema": request.schema,
                    }
                }),
            ),
            ResponseFormatMode::JsonObject => (
                format!("{}{}", request.prompt, schema_appendix(request.schema)),
                json!({ "type": "json_object" }),
            ),
        };

        let body = ChatRequest {
            model: &backend.model_id,
            temperature: TEMPERATURE,
            messages: vec![ChatMessage {
                role: "user",
                content: &content,
            }],
            response_format,
        };

        let base = backend.base_url.as_deref().unwrap_or(self.default_base_url.as_str());
        let url = format!("{}/chat/completions", base.trim_end_matches('/'));
        let mut headers = vec![(
            "Authorization".to_string(),
            format!("Bearer {}", backend.api_key),
        )];
        headers.extend(self.extra_headers.iter().cloned());

        let text = self.client.post_json(&url, &headers, &body).await?;
        let response: ChatResponse = serde_json::from_str(&text)?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::EmptyContent)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Anthropic Messages API
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

impl AnthropicResponse {
    /// Text of the first text block.
    fn text(self) -> Option<String> {
        self.content
            .into_iter()
            .find(|b| b.block_type == "text")
            .and_then(|b| b.text)
    }
}

pub struct RawChatBackend {
    client: LlmClient,
}

impl RawChatBackend {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GenerationBackend for RawChatBackend {
    fn family(&self) -> BackendFamily {
        BackendFamily::RawChat
    }

    async fn generate(
        &self,
        backend: &BackendConfig,
        request: &GenerationRequest<'_>,
    ) -> Result<String, LlmError> {
        let content = format!("{}{}", request.prompt, schema_appendix(request.schema));
        let body = AnthropicRequest {
            model: &backend.model_id,
            max_tokens: backend.max_tokens,
            system: JSON_ONLY_SYSTEM,
            messages: vec![ChatMessage {
                role: "user",
                content: &content,
            }],
        };

        let base = backend.base_url.as_deref().unwrap_or(ANTHROPIC_BASE_URL);
        let url = format!("{}/messages", base.trim_end_matches('/'));
        let headers = vec![
            ("x-api-key".to_string(), backend.api_key.clone()),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
        ];

        let text = self.client.post_json(&url, &headers, &body).await?;
        let response: AnthropicResponse = serde_json::from_str(&text)?;
        response
            .text()
            .filter(|t| !t.trim().is_empty())
            .ok_or(LlmError::EmptyContent)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Registry
// ────────────────────────────────────────────────────────────────────────────

/// Provider name → implementation.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn GenerationBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every provider supported out of the box, sharing one HTTP client.
    pub fn with_defaults(client: LlmClient) -> Self {
        let mut registry = Self::new();
        registry.register(
            "openai",
            SchemaChatBackend::new(client.clone(), OPENAI_BASE_URL, ResponseFormatMode::JsonSchema),
        );
        registry.register(
            "openrouter",
            SchemaChatBackend::new(
                client.clone(),
                OPENROUTER_BASE_URL,
                ResponseFormatMode::JsonSchema,
            )
            .with_header("HTTP-Referer", "https://github.com/tailor-api")
            .with_header("X-Title", "Tailor"),
        );
        registry.register(
            "google",
            SchemaChatBackend::new(client.clone(), GOOGLE_BASE_URL, ResponseFormatMode::JsonSchema),
        );
        registry.register(
            "mistral",
            SchemaChatBackend::new(client.clone(), MISTRAL_BASE_URL, ResponseFormatMode::JsonObject),
        );
        registry.register("anthropic", RawChatBackend::new(client));
        registry
    }

    pub fn register(&mut self, provider: &str, backend: impl GenerationBackend + 'static) {
        self.backends
            .insert(provider.to_ascii_lowercase(), Arc::new(backend));
    }

    pub fn get(&self, provider: &str) -> Result<Arc<dyn GenerationBackend>, ConfigError> {
        self.backends
            .get(&provider.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| ConfigError::UnsupportedProvider(provider.to_string()))
    }
}
