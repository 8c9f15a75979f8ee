//! Completion client for Ollama and OpenAI-compatible backends.

use std::fmt;
use std::time::{Duration, Instant};

use doppel_core::collab::{CompletionParams, CompletionProvider};
use doppel_core::config::LlmConfig;
use doppel_core::error::CompletionError;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::LlmError;

/// Delay before retry `n` is `n` times this.
const RETRY_BACKOFF_MS: u64 = 200;

/// Backend serving completions and embeddings.
#[derive(Clone, PartialEq, Eq)]
pub enum LlmProvider {
    /// Ollama, usually on localhost.
    Ollama {
        /// Server root, without a trailing slash.
        base_url: String,
    },
    /// Any server speaking the OpenAI REST dialect.
    OpenAiCompatible {
        /// Server root, without a trailing slash.
        base_url: String,
        /// Bearer token.
        api_key: String,
    },
    /// No backend. Every call fails with [`LlmError::Unavailable`].
    None,
}

impl LlmProvider {
    /// Resolve the provider from the `[llm]` section.
    ///
    /// `provider` is one of `"ollama"`, `"openai"` (alias
    /// `"openai_compatible"`) or `"none"`. For OpenAI the key is read from
    /// the variable named by `api_key_env`.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::ConfigError`] for an unknown provider, an empty
    /// base URL, or a missing API key.
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        let kind = config.provider.trim().to_ascii_lowercase();
        if kind.is_empty() || kind == "none" {
            return Ok(Self::None);
        }
        if base_url.is_empty() {
            return Err(LlmError::ConfigError("llm.base_url must not be empty".into()));
        }
        match kind.as_str() {
            "ollama" => Ok(Self::Ollama { base_url }),
            "openai" | "openai_compatible" => {
                let var = config.api_key_env.as_deref().ok_or_else(|| {
                    LlmError::ConfigError(
                        "llm.api_key_env must name the variable holding the API key".into(),
                    )
                })?;
                let api_key = std::env::var(var).map_err(|_| {
                    LlmError::ConfigError(format!("environment variable {var} is not set"))
                })?;
                Ok(Self::OpenAiCompatible { base_url, api_key })
            }
            other => Err(LlmError::ConfigError(format!(
                "unknown llm.provider \"{other}\" (expected ollama, openai or none)"
            ))),
        }
    }

    /// Short backend name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ollama { .. } => "ollama",
            Self::OpenAiCompatible { .. } => "openai",
            Self::None => "none",
        }
    }

    pub(crate) fn base_url(&self) -> Option<&str> {
        match self {
            Self::Ollama { base_url } | Self::OpenAiCompatible { base_url, .. } => Some(base_url),
            Self::None => None,
        }
    }

    fn api_key(&self) -> Option<&str> {
        match self {
            Self::OpenAiCompatible { api_key, .. } => Some(api_key),
            _ => None,
        }
    }
}

impl fmt::Debug for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ollama { base_url } => f.debug_struct("Ollama").field("base_url", base_url).finish(),
            Self::OpenAiCompatible { base_url, .. } => f
                .debug_struct("OpenAiCompatible")
                .field("base_url", base_url)
                .field("api_key", &"<redacted>")
                .finish(),
            Self::None => f.write_str("None"),
        }
    }
}

/// HTTP client bound to one provider and one model.
///
/// Cloning is cheap; the underlying connection pool is shared.
#[derive(Clone)]
pub struct LlmClient {
    provider: LlmProvider,
    http: Client,
    model: String,
    timeout_ms: u64,
    max_retries: u32,
}

impl LlmClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::ConfigError`] if the HTTP client cannot be built.
    pub fn new(
        provider: LlmProvider,
        model: impl Into<String>,
        timeout_ms: u64,
        max_retries: u32,
    ) -> Result<Self, LlmError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| LlmError::ConfigError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            provider,
            http,
            model: model.into(),
            timeout_ms,
            max_retries,
        })
    }

    /// Client for the completion model named in `[llm]`.
    ///
    /// # Errors
    ///
    /// See [`LlmProvider::from_config`] and [`LlmClient::new`].
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        Self::new(
            LlmProvider::from_config(config)?,
            config.model.clone(),
            config.request_timeout_ms,
            config.max_retries,
        )
    }

    /// A client with no backend.
    #[must_use]
    pub fn none() -> Self {
        Self {
            provider: LlmProvider::None,
            http: Client::new(),
            model: String::new(),
            timeout_ms: 0,
            max_retries: 0,
        }
    }

    /// Same backend and connection pool, different model.
    #[must_use]
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }

    /// The configured backend.
    #[must_use]
    pub fn provider(&self) -> &LlmProvider {
        &self.provider
    }

    /// Model name sent with every request.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether a backend is configured.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !matches!(self.provider, LlmProvider::None)
    }

    /// Generate text for `prompt`.
    ///
    /// # Errors
    ///
    /// [`LlmError::Unavailable`] without a backend; otherwise whatever the
    /// last attempt failed with (wrapped in [`LlmError::RetriesExhausted`]
    /// when retries are enabled).
    pub async fn generate(&self, prompt: &str, params: &CompletionParams) -> Result<String, LlmError> {
        type Extract = fn(&Value) -> Result<String, LlmError>;
        let (path, body, extract): (&str, Value, Extract) = match &self.provider {
            LlmProvider::None => {
                return Err(LlmError::Unavailable("no LLM provider configured".into()));
            }
            LlmProvider::Ollama { .. } => (
                "/api/generate",
                ollama_body(&self.model, prompt, params),
                ollama_text,
            ),
            LlmProvider::OpenAiCompatible { .. } => (
                "/v1/chat/completions",
                openai_body(&self.model, prompt, params),
                openai_text,
            ),
        };

        let start = Instant::now();
        let json = self.post_json(path, &body).await?;
        let text = extract(&json)?;
        debug!(
            provider = self.provider.name(),
            model = %self.model,
            latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            chars = text.len(),
            "completion finished"
        );
        Ok(text)
    }

    /// POST `body` to `path` on the backend, retrying transient failures.
    ///
    /// Client errors other than 429 are not retried.
    pub(crate) async fn post_json(&self, path: &str, body: &Value) -> Result<Value, LlmError> {
        let Some(base_url) = self.provider.base_url() else {
            return Err(LlmError::Unavailable("no LLM provider configured".into()));
        };
        let url = format!("{base_url}{path}");
        let attempts = self.max_retries.saturating_add(1);

        let mut last_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                debug!(url = %url, attempt = attempt + 1, attempts, "retrying LLM call");
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * u64::from(attempt))).await;
            }

            let mut request = self
                .http
                .post(&url)
                .json(body)
                .timeout(Duration::from_millis(self.timeout_ms));
            if let Some(key) = self.provider.api_key() {
                request = request.bearer_auth(key);
            }

            let err = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<Value>()
                        .await
                        .map_err(|e| LlmError::ParseError(e.to_string()));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let detail = resp.text().await.unwrap_or_default();
                    let err = LlmError::RequestFailed(format!("HTTP {status}: {}", detail.trim()));
                    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
                        warn!(url = %url, %status, "LLM backend rejected request");
                        return Err(err);
                    }
                    err
                }
                Err(e) => match LlmError::from(e) {
                    LlmError::Timeout(_) => LlmError::Timeout(self.timeout_ms),
                    other => other,
                },
            };
            warn!(url = %url, attempt = attempt + 1, attempts, error = %err, "LLM call failed");
            last_error = Some(err);
        }

        match last_error {
            Some(err) if attempts == 1 => Err(err),
            Some(err) => Err(LlmError::RetriesExhausted {
                attempts,
                last_error: err.to_string(),
            }),
            None => Err(LlmError::Unavailable(format!("no attempt made against {url}"))),
        }
    }
}

impl fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmClient")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("timeout_ms", &self.timeout_ms)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl CompletionProvider for LlmClient {
    async fn complete(&self, prompt: &str, params: &CompletionParams) -> Result<String, CompletionError> {
        let text = self.generate(prompt, params).await?;
        if text.trim().is_empty() {
            return Err(CompletionError::EmptyResponse);
        }
        Ok(text)
    }

    fn name(&self) -> &str {
        self.provider.name()
    }
}

// ---------------------------------------------------------------------------
// Wire formats
// ---------------------------------------------------------------------------

fn ollama_body(model: &str, prompt: &str, params: &CompletionParams) -> Value {
    let mut body = json!({
        "model": model,
        "prompt": prompt,
        "stream": false,
        "options": {
            "temperature": params.temperature,
            "num_predict": params.max_tokens,
        }
    });
    if !params.stop.is_empty() {
        body["options"]["stop"] = json!(params.stop);
    }
    body
}

fn openai_body(model: &str, prompt: &str, params: &CompletionParams) -> Value {
    let mut body = json!({
        "model": model,
        "messages": [{ "role": "user", "content": prompt }],
        "max_tokens": params.max_tokens,
        "temperature": params.temperature,
    });
    if !params.stop.is_empty() {
        body["stop"] = json!(params.stop);
    }
    body
}

fn ollama_text(json: &Value) -> Result<String, LlmError> {
    json["response"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| LlmError::SchemaValidation("missing string field `response`".into()))
}

fn openai_text(json: &Value) -> Result<String, LlmError> {
    json["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| LlmError::SchemaValidation("missing `choices[0].message.content`".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str) -> LlmConfig {
        LlmConfig {
            provider: provider.into(),
            base_url: "http://localhost:11434/".into(),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn provider_from_config() {
        assert_eq!(
            LlmProvider::from_config(&config("Ollama")).expect("ollama"),
            LlmProvider::Ollama {
                base_url: "http://localhost:11434".into()
            }
        );
        assert_eq!(LlmProvider::from_config(&config("none")).expect("none"), LlmProvider::None);
        assert!(matches!(
            LlmProvider::from_config(&config("llamacpp")),
            Err(LlmError::ConfigError(_))
        ));
    }

    #[test]
    fn openai_needs_a_key() {
        let mut cfg = config("openai");
        assert!(matches!(LlmProvider::from_config(&cfg), Err(LlmError::ConfigError(_))));
        cfg.api_key_env = Some("DOPPEL_TEST_KEY_THAT_IS_NEVER_SET".into());
        let err = LlmProvider::from_config(&cfg).expect_err("unset variable");
        assert!(err.to_string().contains("DOPPEL_TEST_KEY_THAT_IS_NEVER_SET"));
    }

    #[test]
    fn debug_redacts_api_key() {
        let provider = LlmProvider::OpenAiCompatible {
            base_url: "https://api.example.com".into(),
            api_key: "sk-secret".into(),
        };
        let shown = format!("{provider:?}");
        assert!(!shown.contains("sk-secret"));
        assert!(shown.contains("<redacted>"));
    }

    #[tokio::test]
    async fn none_client_is_unavailable() {
        let client = LlmClient::none();
        assert!(!client.is_available());
        let err = client
            .complete("hello", &CompletionParams::default())
            .await
            .expect_err("no backend");
        assert!(matches!(err, CompletionError::Unavailable(_)));
    }

    #[test]
    fn request_bodies_carry_params() {
        let params = CompletionParams {
            temperature: 0.3,
            max_tokens: 64,
            stop: vec!["\n\n".into()],
        };
        let ollama = ollama_body("llama3.2", "hi", &params);
        assert_eq!(ollama["stream"], json!(false));
        assert_eq!(ollama["options"]["num_predict"], json!(64));
        assert_eq!(ollama["options"]["stop"][0], json!("\n\n"));

        let openai = openai_body("gpt-4o-mini", "hi", &CompletionParams::default());
        assert_eq!(openai["messages"][0]["content"], json!("hi"));
        assert!(openai.get("stop").is_none());
    }

    #[test]
    fn response_text_extraction() {
        assert_eq!(ollama_text(&json!({"response": "ok"})).expect("text"), "ok");
        assert_eq!(
            openai_text(&json!({"choices": [{"message": {"content": "ok"}}]})).expect("text"),
            "ok"
        );
        assert!(matches!(ollama_text(&json!({"error": "x"})), Err(LlmError::SchemaValidation(_))));
        assert!(matches!(openai_text(&json!({"choices": []})), Err(LlmError::SchemaValidation(_))));
    }
}
