//! Streaming analysis API: emit progress events while a document is mapped.
//!
//! ## Why stream?
//!
//! With LLM escalation enabled a run can take a while, and a UI or an HTTP
//! front end wants to show where it is. [`analyze_stream`] runs the same
//! pipeline as [`crate::analyze::analyze`] on a background task and yields
//! an [`AnalysisEvent`] per stage, ending with either a `completed` event
//! carrying the document or an `error` event.
//!
//! Each event serialises to the `{status, message, progress?, data?,
//! timestamp}` payload of a server-sent event; [`AnalysisEvent::to_sse_frame`]
//! renders the `data: ...` frame.

use crate::analyze::analyze_with_cancel;
use crate::cancel::CancelSignal;
use crate::config::MappingConfig;
use crate::model::LayoutDocument;
use crate::output::{AnalysisOutput, MappingStats};
use crate::progress::{AnalysisProgressCallback, ProgressCallback, Stage};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use tracing::{debug, warn};

/// Lifecycle of a streamed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Started,
    Progress,
    Completed,
    Error,
}

/// One event of a streamed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisEvent {
    pub status: EventStatus,
    pub message: String,
    /// Percentage in 0..=100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// The finished document; only on `completed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<AnalysisOutput>>,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl AnalysisEvent {
    fn new(status: EventStatus, message: impl Into<String>, progress: Option<u8>) -> Self {
        Self {
            status,
            message: message.into(),
            progress,
            data: None,
            timestamp: now_secs(),
        }
    }

    pub fn started(total_pages: usize) -> Self {
        Self::new(
            EventStatus::Started,
            format!("Analysis started ({total_pages} pages)"),
            Some(0),
        )
    }

    pub fn stage(stage: Stage) -> Self {
        Self::new(EventStatus::Progress, stage.message(), Some(stage.progress()))
    }

    pub fn completed(output: AnalysisOutput) -> Self {
        let stats = output.stats();
        let message = format!(
            "Analysis completed: {}/{} references matched",
            stats.total_mentions - stats.not_matched,
            stats.total_mentions
        );
        Self {
            data: Some(Box::new(output)),
            ..Self::new(EventStatus::Completed, message, Some(100))
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventStatus::Error, message, None)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, EventStatus::Completed | EventStatus::Error)
    }

    /// Render as a server-sent-event frame: `data: <json>\n\n`.
    pub fn to_sse_frame(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => format!("data: {json}\n\n"),
            Err(e) => {
                warn!("Failed to serialise event: {}", e);
                let fallback = AnalysisEvent::error(format!("event serialisation failed: {e}"));
                // The fallback carries no document, so it always serialises.
                format!(
                    "data: {}\n\n",
                    serde_json::to_string(&fallback).unwrap_or_default()
                )
            }
        }
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A boxed stream of analysis events.
pub type EventStream = Pin<Box<dyn Stream<Item = AnalysisEvent> + Send>>;

/// Forwards progress callbacks into the event channel, then to the
/// caller's own callback if there is one.
struct EventForwarder {
    tx: mpsc::UnboundedSender<AnalysisEvent>,
    inner: Option<ProgressCallback>,
}

impl EventForwarder {
    fn send(&self, event: AnalysisEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event stream dropped; discarding event");
        }
    }
}

impl AnalysisProgressCallback for EventForwarder {
    fn on_analysis_start(&self, total_pages: usize) {
        self.send(AnalysisEvent::started(total_pages));
        if let Some(ref cb) = self.inner {
            cb.on_analysis_start(total_pages);
        }
    }

    fn on_stage_complete(&self, stage: Stage, progress: u8) {
        self.send(AnalysisEvent::stage(stage));
        if let Some(ref cb) = self.inner {
            cb.on_stage_complete(stage, progress);
        }
    }

    fn on_escalation_start(&self, pending: usize) {
        if let Some(ref cb) = self.inner {
            cb.on_escalation_start(pending);
        }
    }

    fn on_mention_escalated(&self, mention: usize, matched: bool) {
        if let Some(ref cb) = self.inner {
            cb.on_mention_escalated(mention, matched);
        }
    }

    fn on_analysis_complete(&self, stats: &MappingStats) {
        if let Some(ref cb) = self.inner {
            cb.on_analysis_complete(stats);
        }
    }
}

/// Analyze a document on a background task, streaming progress events.
///
/// The stream always ends with exactly one `completed` or `error` event.
///
/// # Example
/// ```rust,no_run
/// use pdf_refmap::{analyze_stream, LayoutDocument, MappingConfig};
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let document = LayoutDocument::from_json_slice(&std::fs::read("layout.json")?)?;
/// let mut events = analyze_stream(document, &MappingConfig::default());
/// while let Some(event) = events.next().await {
///     print!("{}", event.to_sse_frame());
/// }
/// # Ok(())
/// # }
/// ```
pub fn analyze_stream(document: LayoutDocument, config: &MappingConfig) -> EventStream {
    analyze_stream_with_cancel(document, config, CancelSignal::never())
}

/// [`analyze_stream`] with cooperative cancellation of the LLM stage.
///
/// Must be called from within a tokio runtime.
pub fn analyze_stream_with_cancel(
    document: LayoutDocument,
    config: &MappingConfig,
    cancel: CancelSignal,
) -> EventStream {
    let (tx, rx) = mpsc::unbounded_channel();
    let forwarder = Arc::new(EventForwarder {
        tx: tx.clone(),
        inner: config.progress_callback.clone(),
    });
    let mut config = config.clone();
    config.progress_callback = Some(forwarder);

    tokio::spawn(async move {
        let last = match analyze_with_cancel(document, &config, cancel).await {
            Ok(output) => AnalysisEvent::completed(output),
            Err(e) => {
                warn!("Streamed analysis failed: {}", e);
                AnalysisEvent::error(e.to_string())
            }
        };
        // Dropping the config releases the forwarder's sender too, so the
        // stream ends after this event.
        drop(config);
        let _ = tx.send(last);
    });

    Box::pin(UnboundedReceiverStream::new(rx))
}
