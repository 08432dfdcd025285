//! # pdf-refmap
//!
//! Map in-text references ("Fig. 3", "Tables 2–4", "Eq. (5)") in a laid-out
//! PDF to the figures, tables, equations, algorithms and examples they name.
//!
//! ## Why this crate?
//!
//! Layout detectors find the boxes on a page and OCR finds the text, but
//! neither knows that "see Fig. 3b" on page 7 points at the picture group
//! captioned "Figure 3" on page 6. This crate takes the layout collaborator's
//! output (text blocks and layout elements with bounding boxes), assigns every
//! element a number, merges the pieces of multi-part figures, and resolves
//! each mention with deterministic rules. Only what the rules leave open is
//! optionally handed to an LLM.
//!
//! ## Pipeline Overview
//!
//! ```text
//! LayoutDocument (JSON)
//!  │
//!  ├─ 1. Input     local file or URL, normalised page order and element ids
//!  ├─ 2. Extract   regex registry → ReferenceMention per id ("Figs. 1-3" → 3)
//!  ├─ 2. Group     caption numbering + union-find merge → FigureEntity
//!  ├─ 3. Resolve   weighted mention → figure edges, best edge above threshold
//!  ├─ 4. Escalate  optional LLM disambiguation with timeout + retry
//!  └─ 5. Output    pages with references, figures, stats, report
//! ```
//!
//! Extraction and grouping are independent and run side by side.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf_refmap::{analyze_file, MappingConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MappingConfig::default();
//!     let output = analyze_file("paper.layout.json", &config).await?;
//!     for r in output.references() {
//!         println!("{} -> {:?}", r.text, r.figure_id);
//!     }
//!     eprintln!("unmatched: {:.0}%", output.stats().not_matched_rate() * 100.0);
//!     Ok(())
//! }
//! ```
//!
//! ## LLM escalation
//!
//! Disabled by default. Enable it with
//! `MappingConfig::builder().llm_enabled(true)`; the backend is, in order of
//! precedence, a user-supplied [`Disambiguator`], an Ollama-compatible
//! `base_url`, or an `edgequake-llm` provider auto-detected from the
//! environment (`OPENAI_API_KEY`, `EDGEQUAKE_LLM_PROVIDER`, ...).
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `refmap` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod analyze;
pub mod cancel;
pub mod config;
pub mod disambiguator;
pub mod error;
pub mod model;
pub mod output;
pub mod patterns;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use analyze::{
    analyze, analyze_bytes, analyze_file, analyze_sync, analyze_to_file, analyze_with_cancel,
    write_output,
};
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use config::{
    EscalationConfig, ExtractionConfig, GroupingConfig, MappingConfig, MappingConfigBuilder,
    ScoringWeights, TuningProfile,
};
pub use disambiguator::{
    resolve_disambiguator, CandidateSummary, DisambiguationRequest, DisambiguationResponse,
    Disambiguator, OllamaDisambiguator, ProviderDisambiguator,
};
pub use error::{DisambiguatorError, EscalationError, RefMapError};
pub use model::{
    BBox, BlockRole, FigureEntity, FigureKind, LayoutDocument, LayoutElement, LayoutPage,
    MentionResolution, ReferenceMention, TextBlock,
};
pub use output::{AnalysisOutput, AnalysisReport, DocumentMetadata, MappingStats};
pub use progress::{AnalysisProgressCallback, NoopProgressCallback, ProgressCallback, Stage};
pub use stream::{analyze_stream, analyze_stream_with_cancel, AnalysisEvent, EventStatus, EventStream};
