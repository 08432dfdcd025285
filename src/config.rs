//! Configuration types for reference-to-figure mapping.
//!
//! All mapping behaviour is controlled through [`MappingConfig`], built via
//! its [`MappingConfigBuilder`]. The tunables are split into four serde
//! sub-structs ([`ExtractionConfig`], [`GroupingConfig`], [`ScoringWeights`],
//! [`EscalationConfig`]) so a whole tuning profile can be loaded from one JSON
//! file with [`MappingConfig::from_tuning_json`] and diffed between runs.
//!
//! # Design choice: builder over constructor
//! Most callers only flip the LLM switch or nudge the acceptance threshold.
//! The builder lets them set exactly that and inherit documented defaults
//! for everything else.

use crate::disambiguator::Disambiguator;
use crate::error::RefMapError;
use crate::model::FigureKind;
use crate::pipeline::escalate::RetryPolicy;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Tunables of the reference extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Accept bare `(n)` equation references only when the text block lies
    /// within this distance of an equation element on the same page.
    /// `None` disables bare equation references entirely. Default: 150.
    ///
    /// A parenthesised number is ambiguous on its own: it is also how
    /// citation counts, list items and years are written. Requiring a
    /// nearby equation keeps those out.
    pub bare_equation_proximity: Option<f32>,

    /// Largest integer range that is expanded member by member. Default: 10.
    ///
    /// "Figs. 2-4" becomes 2, 3, 4. "Figs. 1-40" is far more likely to be a
    /// page range or an OCR slip, so only its endpoints are kept.
    pub max_range_span: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            bare_equation_proximity: Some(150.0),
            max_range_span: 10,
        }
    }
}

/// Tunables of the identifier and grouping stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    /// Maximum vertical gap between an element and a caption block for
    /// them to count as adjacent. Default: 40.
    pub caption_gap: f32,

    /// Minimum horizontal overlap (fraction of the narrower box) between an
    /// element and an adjacent caption. Default: 0.5.
    pub min_caption_overlap: f32,

    /// Maximum edge distance for the proximity strategy. Default: 20.
    pub proximity_gap: f32,

    /// Kinds the proximity strategy may merge. Default: figure, table.
    ///
    /// Equations stacked in a derivation are close together but distinct,
    /// so they are left out by default.
    pub proximity_kinds: Vec<FigureKind>,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            caption_gap: 40.0,
            min_caption_overlap: 0.5,
            proximity_gap: 20.0,
            proximity_kinds: vec![FigureKind::Figure, FigureKind::Table],
        }
    }
}

/// Weights of the mention-to-entity score.
///
/// `score = id_match·w_id + spatial·w_spatial + order_term`, clamped to
/// `[0, 1]`, where `order_term` is `+order_bonus` for a mention after its
/// entity and `-order_penalty` for one far before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Default: 0.70.
    pub id_match: f32,
    /// Default: 0.20.
    pub spatial: f32,
    /// Default: 0.10.
    pub order_bonus: f32,
    /// Default: 0.15.
    pub order_penalty: f32,
    /// Minimum score for the rule-based scorer to accept an edge. Default: 0.50.
    ///
    /// With the default weights an exact id on the same kind always clears
    /// it, and nothing without an id match can.
    pub acceptance_threshold: f32,
    /// Pages ahead of the mention an entity may sit without being penalised.
    /// Default: 3.
    pub forward_window_pages: usize,
    /// Vertical distance at which same-page spatial proximity halves its
    /// bonus. Default: 200.
    pub vertical_scale: f32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            id_match: 0.70,
            spatial: 0.20,
            order_bonus: 0.10,
            order_penalty: 0.15,
            acceptance_threshold: 0.50,
            forward_window_pages: 3,
            vertical_scale: 200.0,
        }
    }
}

/// Tunables of the LLM disambiguation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Run the disambiguator on mentions the rules left unmatched. Default: false.
    pub enabled: bool,

    /// Base URL of an Ollama server, e.g. `http://localhost:11434`.
    /// When set, escalation talks to `/api/generate` directly.
    pub base_url: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    /// If None, provider discovery falls back to the environment.
    pub provider_name: Option<String>,

    /// Model identifier. If None, uses the provider default.
    pub model: Option<String>,

    /// Sampling temperature. Default: 0.2.
    pub temperature: f32,

    /// Maximum tokens per answer. Default: 256.
    ///
    /// The expected answer is a one-field JSON object; anything longer is
    /// the model rambling.
    pub max_tokens: usize,

    /// Per-call timeout in milliseconds. Default: 15 000.
    pub timeout_ms: u64,

    /// Total attempts per mention, first call included. Default: 3.
    pub retry_attempts: u32,

    /// Delay before the second attempt; doubles after each one. Default: 500.
    pub retry_delay_ms: u64,

    /// Upper bound of the backoff delay. Default: 8 000.
    pub max_retry_delay_ms: u64,

    /// Mentions escalated concurrently. Default: 4.
    pub concurrency: usize,

    /// Most candidates offered to the disambiguator per mention. Default: 8.
    pub max_candidates: usize,

    /// Text blocks of context on each side of the mention's block. Default: 1.
    pub context_blocks: usize,

    /// Context window length cap, in characters. Default: 600.
    pub context_chars: usize,

    /// Custom system prompt. If None, uses the built-in default.
    pub system_prompt: Option<String>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            provider_name: None,
            model: None,
            temperature: 0.2,
            max_tokens: 256,
            timeout_ms: 15_000,
            retry_attempts: 3,
            retry_delay_ms: 500,
            max_retry_delay_ms: 8_000,
            concurrency: 4,
            max_candidates: 8,
            context_blocks: 1,
            context_chars: 600,
            system_prompt: None,
        }
    }
}

impl EscalationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            base_delay_ms: self.retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms.max(self.retry_delay_ms),
        }
    }
}

/// Serialisable part of a [`MappingConfig`], as stored in a tuning file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningProfile {
    pub extraction: ExtractionConfig,
    pub grouping: GroupingConfig,
    pub scoring: ScoringWeights,
    pub escalation: EscalationConfig,
}

/// Configuration for a reference-mapping run.
///
/// Built via [`MappingConfig::builder()`] or using
/// [`MappingConfig::default()`].
///
/// # Example
/// ```rust
/// use pdf_refmap::MappingConfig;
///
/// let config = MappingConfig::builder()
///     .acceptance_threshold(0.6)
///     .llm_enabled(true)
///     .base_url("http://localhost:11434")
///     .model("llama3.1")
///     .build()
///     .unwrap();
/// assert!(config.escalation.enabled);
/// ```
#[derive(Clone)]
pub struct MappingConfig {
    pub extraction: ExtractionConfig,
    pub grouping: GroupingConfig,
    pub scoring: ScoringWeights,
    pub escalation: EscalationConfig,

    /// Pre-constructed disambiguator. Takes precedence over every other
    /// backend setting.
    pub disambiguator: Option<Arc<dyn Disambiguator>>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Optional progress observer.
    pub progress_callback: Option<ProgressCallback>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            extraction: ExtractionConfig::default(),
            grouping: GroupingConfig::default(),
            scoring: ScoringWeights::default(),
            escalation: EscalationConfig::default(),
            disambiguator: None,
            provider: None,
            progress_callback: None,
            download_timeout_secs: 120,
        }
    }
}

impl fmt::Debug for MappingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingConfig")
            .field("extraction", &self.extraction)
            .field("grouping", &self.grouping)
            .field("scoring", &self.scoring)
            .field("escalation", &self.escalation)
            .field(
                "disambiguator",
                &self.disambiguator.as_ref().map(|d| d.name().to_string()),
            )
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn AnalysisProgressCallback>"),
            )
            .field("download_timeout_secs", &self.download_timeout_secs)
            .finish()
    }
}

impl MappingConfig {
    /// Create a new builder for `MappingConfig`.
    pub fn builder() -> MappingConfigBuilder {
        MappingConfigBuilder {
            config: Self::default(),
        }
    }

    /// Build a validated config from a JSON tuning profile. Missing
    /// sections and fields keep their defaults.
    pub fn from_tuning_json(json: &str) -> Result<MappingConfig, RefMapError> {
        let profile: TuningProfile = serde_json::from_str(json)
            .map_err(|e| RefMapError::InvalidConfig(format!("tuning profile: {e}")))?;
        Self::builder().tuning(profile).build()
    }

    /// The serialisable part of this config.
    pub fn tuning_profile(&self) -> TuningProfile {
        TuningProfile {
            extraction: self.extraction.clone(),
            grouping: self.grouping.clone(),
            scoring: self.scoring.clone(),
            escalation: self.escalation.clone(),
        }
    }
}

/// Builder for [`MappingConfig`].
#[derive(Debug)]
pub struct MappingConfigBuilder {
    config: MappingConfig,
}

impl MappingConfigBuilder {
    /// Replace all four tunable sections at once.
    pub fn tuning(mut self, profile: TuningProfile) -> Self {
        self.config.extraction = profile.extraction;
        self.config.grouping = profile.grouping;
        self.config.scoring = profile.scoring;
        self.config.escalation = profile.escalation;
        self
    }

    pub fn extraction(mut self, extraction: ExtractionConfig) -> Self {
        self.config.extraction = extraction;
        self
    }

    pub fn grouping(mut self, grouping: GroupingConfig) -> Self {
        self.config.grouping = grouping;
        self
    }

    pub fn scoring(mut self, scoring: ScoringWeights) -> Self {
        self.config.scoring = scoring;
        self
    }

    pub fn escalation(mut self, escalation: EscalationConfig) -> Self {
        self.config.escalation = escalation;
        self
    }

    pub fn bare_equation_proximity(mut self, distance: Option<f32>) -> Self {
        self.config.extraction.bare_equation_proximity = distance.map(|d| d.max(0.0));
        self
    }

    pub fn max_range_span(mut self, span: u32) -> Self {
        self.config.extraction.max_range_span = span;
        self
    }

    pub fn acceptance_threshold(mut self, threshold: f32) -> Self {
        self.config.scoring.acceptance_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn llm_enabled(mut self, enabled: bool) -> Self {
        self.config.escalation.enabled = enabled;
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.escalation.base_url = Some(url.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.escalation.provider_name = Some(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.escalation.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.escalation.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.escalation.max_tokens = n;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.config.escalation.timeout_ms = ms;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.escalation.timeout_ms = secs.saturating_mul(1000);
        self
    }

    pub fn retry_attempts(mut self, n: u32) -> Self {
        self.config.escalation.retry_attempts = n.max(1);
        self
    }

    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.escalation.retry_delay_ms = ms;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.escalation.concurrency = n.max(1);
        self
    }

    pub fn max_candidates(mut self, n: usize) -> Self {
        self.config.escalation.max_candidates = n.max(1);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.escalation.system_prompt = Some(prompt.into());
        self
    }

    /// Use this disambiguator and enable escalation.
    pub fn disambiguator(mut self, disambiguator: Arc<dyn Disambiguator>) -> Self {
        self.config.disambiguator = Some(disambiguator);
        self.config.escalation.enabled = true;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.config.progress_callback = Some(callback);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<MappingConfig, RefMapError> {
        let c = &self.config;
        let s = &c.scoring;
        for (name, w) in [
            ("id_match", s.id_match),
            ("spatial", s.spatial),
            ("order_bonus", s.order_bonus),
            ("order_penalty", s.order_penalty),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(RefMapError::InvalidConfig(format!(
                    "Scoring weight {name} must be 0–1, got {w}"
                )));
            }
        }
        if !(s.acceptance_threshold > 0.0 && s.acceptance_threshold <= 1.0) {
            return Err(RefMapError::InvalidConfig(format!(
                "Acceptance threshold must be in (0, 1], got {}",
                s.acceptance_threshold
            )));
        }
        if !(s.vertical_scale > 0.0 && s.vertical_scale.is_finite()) {
            return Err(RefMapError::InvalidConfig(
                "vertical_scale must be > 0".into(),
            ));
        }
        let g = &c.grouping;
        if !(g.caption_gap >= 0.0 && g.proximity_gap >= 0.0) {
            return Err(RefMapError::InvalidConfig(
                "Grouping gaps must be ≥ 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&g.min_caption_overlap) {
            return Err(RefMapError::InvalidConfig(format!(
                "min_caption_overlap must be 0–1, got {}",
                g.min_caption_overlap
            )));
        }
        let e = &c.escalation;
        if e.temperature.is_nan() {
            return Err(RefMapError::InvalidConfig(
                "Temperature must be a number".into(),
            ));
        }
        if e.concurrency == 0 {
            return Err(RefMapError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if e.retry_attempts == 0 {
            return Err(RefMapError::InvalidConfig(
                "retry_attempts must be ≥ 1".into(),
            ));
        }
        if e.timeout_ms == 0 {
            return Err(RefMapError::InvalidConfig(
                "Disambiguator timeout must be > 0".into(),
            ));
        }
        if e.max_candidates == 0 {
            return Err(RefMapError::InvalidConfig(
                "max_candidates must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}
