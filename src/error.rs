//! Error types for the pdf-refmap library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`RefMapError`]: **Fatal**. The analysis cannot start at all (layout
//!   file missing, malformed JSON, disambiguator requested but not
//!   configured). Returned as `Err(RefMapError)` from the top-level
//!   `analyze*` functions.
//!
//! * [`EscalationError`]: **Non-fatal**. The LLM disambiguator could not
//!   settle one unmatched mention. The mention stays `not_matched` and the
//!   error is stored in [`crate::output::AnalysisReport`] for auditing.
//!
//! * [`DisambiguatorError`]: what a single disambiguator backend call
//!   returns. The retry loop in [`crate::pipeline::escalate`] folds these
//!   into an [`EscalationError`] once the attempt budget is spent.
//!
//! Nothing that happens *inside* the mapping engine is fatal: the worst
//! outcome of a bad document is a higher `not_matched` rate.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pdf-refmap library.
#[derive(Debug, Error)]
pub enum RefMapError {
    // ── Input errors ─────────────────────────────────────────────────────
    /// Layout file was not found at the given path.
    #[error("Layout file not found: '{path}'\nCheck the path exists and is readable.")]
    LayoutNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The layout payload was read but is not a valid layout document.
    #[error("Layout '{source_name}' is not a valid layout document: {detail}")]
    MalformedLayout { source_name: String, detail: String },

    // ── Disambiguator errors ──────────────────────────────────────────────
    /// LLM mode is enabled but no provider could be set up.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output JSON file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (a pipeline task panicked).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a single disambiguator call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DisambiguatorError {
    /// Network, HTTP status or provider-side failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The backend answered, but not with a usable `{chosen_id}` payload.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// A non-fatal escalation failure for one mention.
///
/// Stored in [`crate::output::AnalysisReport::escalation_failures`]. The
/// mention it names stays `not_matched` in the output.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum EscalationError {
    /// Every attempt exceeded the per-call timeout.
    #[error("Mention {mention}: disambiguator timed out after {attempts} attempts ({timeout_ms}ms each)")]
    Timeout {
        mention: usize,
        attempts: u32,
        timeout_ms: u64,
    },

    /// The last attempt failed at the transport level.
    #[error("Mention {mention}: disambiguator unreachable after {attempts} attempts: {detail}")]
    Transport {
        mention: usize,
        attempts: u32,
        detail: String,
    },

    /// The last attempt returned something that could not be parsed.
    #[error("Mention {mention}: malformed disambiguator response after {attempts} attempts: {detail}")]
    MalformedResponse {
        mention: usize,
        attempts: u32,
        detail: String,
    },

    /// The last attempt chose an id that was not among the candidates.
    #[error("Mention {mention}: disambiguator chose unknown candidate '{chosen}' after {attempts} attempts")]
    UnknownCandidate {
        mention: usize,
        attempts: u32,
        chosen: String,
    },

    /// The run was cancelled while the call was in flight.
    #[error("Mention {mention}: escalation cancelled")]
    Cancelled { mention: usize },
}

impl EscalationError {
    /// Index of the mention this failure belongs to.
    pub fn mention(&self) -> usize {
        match self {
            EscalationError::Timeout { mention, .. }
            | EscalationError::Transport { mention, .. }
            | EscalationError::MalformedResponse { mention, .. }
            | EscalationError::UnknownCandidate { mention, .. }
            | EscalationError::Cancelled { mention } => *mention,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_layout_display() {
        let e = RefMapError::MalformedLayout {
            source_name: "paper.json".into(),
            detail: "missing field `pages`".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("paper.json"), "got: {msg}");
        assert!(msg.contains("pages"), "got: {msg}");
    }

    #[test]
    fn timeout_display_mentions_attempts() {
        let e = EscalationError::Timeout {
            mention: 4,
            attempts: 3,
            timeout_ms: 15000,
        };
        let msg = e.to_string();
        assert!(msg.contains("Mention 4"));
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("15000ms"));
    }

    #[test]
    fn escalation_error_reports_its_mention() {
        let e = EscalationError::Cancelled { mention: 7 };
        assert_eq!(e.mention(), 7);
        let e = EscalationError::UnknownCandidate {
            mention: 2,
            attempts: 1,
            chosen: "9".into(),
        };
        assert_eq!(e.mention(), 2);
    }

    #[test]
    fn escalation_error_serialises_tagged() {
        let e = EscalationError::Transport {
            mention: 1,
            attempts: 3,
            detail: "connection refused".into(),
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["error"], "transport");
        assert_eq!(json["mention"], 1);
    }

    #[test]
    fn provider_not_configured_display() {
        let e = RefMapError::ProviderNotConfigured {
            provider: "auto".into(),
            hint: "Set OPENAI_API_KEY".into(),
        };
        assert!(e.to_string().contains("auto"));
        assert!(e.to_string().contains("OPENAI_API_KEY"));
    }
}
