//! Progress-callback trait for mapping-run events.
//!
//! Inject an [`Arc<dyn AnalysisProgressCallback>`] via
//! [`crate::config::MappingConfigBuilder::progress_callback`] to receive
//! events as the pipeline moves through its stages.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers can
//! forward events to a channel, a WebSocket, a job record or a terminal
//! progress bar without the library knowing how the host application
//! communicates. [`crate::stream::analyze_stream`] is itself built on a
//! callback that forwards into a channel.
//!
//! # Example
//!
//! ```rust
//! use pdf_refmap::{AnalysisProgressCallback, MappingConfig, Stage};
//! use std::sync::{Arc, Mutex};
//!
//! struct Recorder {
//!     seen: Mutex<Vec<u8>>,
//! }
//!
//! impl AnalysisProgressCallback for Recorder {
//!     fn on_stage_complete(&self, _stage: Stage, progress: u8) {
//!         self.seen.lock().unwrap().push(progress);
//!     }
//! }
//!
//! let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
//! let config = MappingConfig::builder()
//!     .progress_callback(recorder as Arc<dyn AnalysisProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::output::MappingStats;
use serde::Serialize;
use std::sync::Arc;

/// Pipeline checkpoints, in the order they complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    InputValidated,
    MentionsExtracted,
    FiguresGrouped,
    MappingResolved,
    EscalationFinished,
    DocumentAssembled,
}

impl Stage {
    /// Percentage reported once this stage completes.
    pub fn progress(self) -> u8 {
        match self {
            Stage::InputValidated => 10,
            Stage::MentionsExtracted => 40,
            Stage::FiguresGrouped => 60,
            Stage::MappingResolved => 80,
            Stage::EscalationFinished => 95,
            Stage::DocumentAssembled => 100,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Stage::InputValidated => "Layout validated",
            Stage::MentionsExtracted => "References extracted",
            Stage::FiguresGrouped => "Figures grouped",
            Stage::MappingResolved => "References mapped",
            Stage::EscalationFinished => "Ambiguous references resolved",
            Stage::DocumentAssembled => "Document assembled",
        }
    }
}

/// Called by the mapping pipeline as it progresses.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// `on_mention_escalated` may be called concurrently from different tasks
/// while escalation runs. Implementations must protect shared mutable
/// state with appropriate synchronisation primitives.
pub trait AnalysisProgressCallback: Send + Sync {
    /// Called once the layout is accepted.
    fn on_analysis_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called after each [`Stage`], with its progress percentage.
    fn on_stage_complete(&self, stage: Stage, progress: u8) {
        let _ = (stage, progress);
    }

    /// Called before LLM escalation with the number of mentions to escalate.
    fn on_escalation_start(&self, pending: usize) {
        let _ = pending;
    }

    /// Called when one escalated mention is settled, matched or not.
    fn on_mention_escalated(&self, mention: usize, matched: bool) {
        let _ = (mention, matched);
    }

    /// Called once with the final statistics.
    fn on_analysis_complete(&self, stats: &MappingStats) {
        let _ = stats;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl AnalysisProgressCallback for NoopProgressCallback {}

/// Convenience type alias.
pub type ProgressCallback = Arc<dyn AnalysisProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_progress_is_monotonic() {
        let stages = [
            Stage::InputValidated,
            Stage::MentionsExtracted,
            Stage::FiguresGrouped,
            Stage::MappingResolved,
            Stage::EscalationFinished,
            Stage::DocumentAssembled,
        ];
        let values: Vec<u8> = stages.iter().map(|s| s.progress()).collect();
        assert_eq!(values, vec![10, 40, 60, 80, 95, 100]);
    }

    #[test]
    fn noop_callback_accepts_everything() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_analysis_start(3);
        cb.on_stage_complete(Stage::FiguresGrouped, 60);
        cb.on_mention_escalated(0, true);
        cb.on_analysis_complete(&MappingStats::default());
    }
}
