//! LLM disambiguators: pick the target of an ambiguous reference.
//!
//! The escalation stage only needs "given this mention, its context and
//! these candidates, which one?". [`Disambiguator`] is that seam. Two
//! backends ship with the crate:
//!
//! * [`ProviderDisambiguator`]: any `edgequake-llm` chat provider (OpenAI,
//!   Anthropic, Gemini, Ollama via the factory, ...).
//! * [`OllamaDisambiguator`]: a bare Ollama server reached over HTTP at
//!   `{base_url}/api/generate`, for setups without provider keys.
//!
//! Callers can plug in their own via
//! [`crate::config::MappingConfigBuilder::disambiguator`]; the test suite
//! does exactly that with scripted fakes.
//!
//! Every backend answers with the same JSON contract, parsed by
//! [`parse_response`]: `{"chosen_id": "<id>"}` or `{"chosen_id": null}`.

use crate::config::MappingConfig;
use crate::error::{DisambiguatorError, RefMapError};
use crate::model::FigureKind;
use crate::prompts::{self, DEFAULT_DISAMBIGUATION_PROMPT};
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One candidate offered to the disambiguator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub id: String,
    pub kind: FigureKind,
    pub caption_excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisambiguationRequest {
    pub mention_text: String,
    pub context_window: String,
    pub candidate_list: Vec<CandidateSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisambiguationResponse {
    /// `None` when the backend judged that no candidate fits.
    pub chosen_id: Option<String>,
}

/// Something that can choose among candidates for an ambiguous mention.
pub trait Disambiguator: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    fn disambiguate<'a>(
        &'a self,
        request: &'a DisambiguationRequest,
    ) -> BoxFuture<'a, Result<DisambiguationResponse, DisambiguatorError>>;
}

// ── Response parsing ─────────────────────────────────────────────────────

static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\s*\n?(.*?)\n?\s*```$").unwrap());

#[derive(Deserialize)]
struct RawResponse {
    chosen_id: Option<serde_json::Value>,
}

/// Parse a backend answer into a [`DisambiguationResponse`].
///
/// Accepts the JSON object on its own, wrapped in a code fence, or
/// embedded in surrounding prose; a bare `none`/`null` also means "no
/// candidate". Numeric ids are accepted as their decimal string.
pub fn parse_response(raw: &str) -> Result<DisambiguationResponse, DisambiguatorError> {
    let mut text = raw.trim();
    if let Some(inner) = FENCE_RE.captures(text).and_then(|c| c.get(1)) {
        text = inner.as_str().trim();
    }
    if text.eq_ignore_ascii_case("none") || text.eq_ignore_ascii_case("null") {
        return Ok(DisambiguationResponse { chosen_id: None });
    }

    let (Some(open), Some(close)) = (text.find('{'), text.rfind('}')) else {
        return Err(DisambiguatorError::MalformedResponse(preview(raw)));
    };
    if close < open {
        return Err(DisambiguatorError::MalformedResponse(preview(raw)));
    }
    let parsed: RawResponse = serde_json::from_str(&text[open..=close])
        .map_err(|e| DisambiguatorError::MalformedResponse(format!("{e}: {}", preview(raw))))?;

    let chosen_id = match parsed.chosen_id {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() || s.eq_ignore_ascii_case("none") || s.eq_ignore_ascii_case("null") {
                None
            } else {
                Some(s.to_string())
            }
        }
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(other) => {
            return Err(DisambiguatorError::MalformedResponse(format!(
                "chosen_id is neither a string nor null: {other}"
            )))
        }
    };
    Ok(DisambiguationResponse { chosen_id })
}

fn preview(raw: &str) -> String {
    prompts::excerpt(raw, 120)
}

// ── edgequake-llm backend ────────────────────────────────────────────────

/// Disambiguator backed by an `edgequake-llm` chat provider.
pub struct ProviderDisambiguator {
    provider: Arc<dyn LLMProvider>,
    system_prompt: String,
    temperature: f32,
    max_tokens: usize,
}

impl ProviderDisambiguator {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &MappingConfig) -> Self {
        let e = &config.escalation;
        Self {
            provider,
            system_prompt: e
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_DISAMBIGUATION_PROMPT.to_string()),
            temperature: e.temperature,
            max_tokens: e.max_tokens,
        }
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

impl Disambiguator for ProviderDisambiguator {
    fn name(&self) -> &str {
        "edgequake-llm"
    }

    fn disambiguate<'a>(
        &'a self,
        request: &'a DisambiguationRequest,
    ) -> BoxFuture<'a, Result<DisambiguationResponse, DisambiguatorError>> {
        Box::pin(async move {
            let messages = vec![
                ChatMessage::system(self.system_prompt.as_str()),
                ChatMessage::user(prompts::render_request(request)),
            ];
            let options = self.options();
            let response = self
                .provider
                .chat(&messages, Some(&options))
                .await
                .map_err(|e| DisambiguatorError::Transport(e.to_string()))?;
            debug!(
                "Disambiguator answered with {} output tokens",
                response.completion_tokens
            );
            parse_response(&response.content)
        })
    }
}

// ── Ollama HTTP backend ──────────────────────────────────────────────────

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    format: &'a str,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: usize,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Disambiguator that talks to an Ollama server's `/api/generate`.
pub struct OllamaDisambiguator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    system_prompt: String,
    temperature: f32,
    max_tokens: usize,
}

/// Model used against a bare Ollama server when none is configured.
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.1";

impl OllamaDisambiguator {
    pub fn new(base_url: &str, config: &MappingConfig) -> Result<Self, RefMapError> {
        let e = &config.escalation;
        let base = base_url.trim().trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(RefMapError::InvalidConfig(format!(
                "base_url must be an http(s) URL, got '{base_url}'"
            )));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RefMapError::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{base}/api/generate"),
            model: e.model.clone().unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string()),
            system_prompt: e
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_DISAMBIGUATION_PROMPT.to_string()),
            temperature: e.temperature,
            max_tokens: e.max_tokens,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Disambiguator for OllamaDisambiguator {
    fn name(&self) -> &str {
        "ollama"
    }

    fn disambiguate<'a>(
        &'a self,
        request: &'a DisambiguationRequest,
    ) -> BoxFuture<'a, Result<DisambiguationResponse, DisambiguatorError>> {
        Box::pin(async move {
            let body = GenerateRequest {
                model: &self.model,
                prompt: format!(
                    "{}\n\n{}",
                    self.system_prompt,
                    prompts::render_request(request)
                ),
                stream: false,
                format: "json",
                options: GenerateOptions {
                    temperature: self.temperature,
                    num_predict: self.max_tokens,
                },
            };
            let response = self
                .client
                .post(&self.endpoint)
                .json(&body)
                .send()
                .await
                .map_err(|e| DisambiguatorError::Transport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                return Err(DisambiguatorError::Transport(format!(
                    "HTTP {status}: {}",
                    prompts::excerpt(&detail, 200)
                )));
            }
            let generated: GenerateResponse = response
                .json()
                .await
                .map_err(|e| DisambiguatorError::MalformedResponse(e.to_string()))?;
            parse_response(&generated.response)
        })
    }
}

// ── Resolution ───────────────────────────────────────────────────────────

/// Instantiate a named provider with the given model.
fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, RefMapError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        RefMapError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Default model when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`).
/// 2. **Named provider + model** (`escalation.provider_name`).
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 4. **OpenAI key present** (`OPENAI_API_KEY`).
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
fn resolve_provider(config: &MappingConfig) -> Result<Arc<dyn LLMProvider>, RefMapError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let e = &config.escalation;
    if let Some(ref name) = e.provider_name {
        let model = e.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = e.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| RefMapError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, pass --base-url for Ollama, or disable --llm.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

/// Pick the disambiguator for a run, or `None` when escalation is off.
///
/// A caller-supplied disambiguator wins, then an Ollama `base_url`, then
/// the `edgequake-llm` provider chain.
pub fn resolve_disambiguator(
    config: &MappingConfig,
) -> Result<Option<Arc<dyn Disambiguator>>, RefMapError> {
    if !config.escalation.enabled {
        return Ok(None);
    }
    if let Some(ref d) = config.disambiguator {
        return Ok(Some(Arc::clone(d)));
    }
    if let Some(ref base_url) = config.escalation.base_url {
        let ollama = OllamaDisambiguator::new(base_url, config)?;
        info!("Escalating to Ollama at {}", ollama.endpoint());
        return Ok(Some(Arc::new(ollama)));
    }
    let provider = resolve_provider(config)?;
    info!(
        "Escalating via LLM provider {}",
        config.escalation.provider_name.as_deref().unwrap_or("(auto)")
    );
    Ok(Some(Arc::new(ProviderDisambiguator::new(provider, config))))
}
