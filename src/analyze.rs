//! Eager (full-document) mapping entry points.
//!
//! ## Why eager vs. streaming?
//!
//! This module provides the simpler API: run every stage, then return the
//! assembled [`AnalysisOutput`]. Use [`crate::stream::analyze_stream`]
//! instead when a client wants progress events while the LLM stage runs.
//!
//! ## Failure model
//!
//! Only input and configuration problems are fatal. Everything the mapping
//! engine meets inside a document (unparseable ids, conflicting groupings,
//! a disambiguator that times out) degrades to `not_matched` references
//! and entries in [`crate::output::AnalysisReport`].

use crate::cancel::CancelSignal;
use crate::config::MappingConfig;
use crate::disambiguator::resolve_disambiguator;
use crate::error::RefMapError;
use crate::model::{
    BBox, FigureKind, LayoutDocument, LayoutElement, MentionResolution, ReferenceMention,
    ResolvedBy, TextBlock,
};
use crate::output::{
    AnalysisOutput, AnalysisReport, BlockOutput, DocumentMetadata, FigureOutput, MappingStats,
    PageOutput, ReferenceOutput,
};
use crate::pipeline::escalate::{self, EscalationOutcome};
use crate::pipeline::graph::MappingGraph;
use crate::pipeline::group::{self, Grouping};
use crate::pipeline::{extract, identify, input};
use crate::progress::Stage;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Name reported in [`DocumentMetadata::processor`].
pub const PROCESSOR: &str = "pdf-refmap";

/// Map every reference in `document` to its figure.
pub async fn analyze(
    document: LayoutDocument,
    config: &MappingConfig,
) -> Result<AnalysisOutput, RefMapError> {
    analyze_with_cancel(document, config, CancelSignal::never()).await
}

/// [`analyze`] with cooperative cancellation of the LLM stage.
///
/// A cancelled run still returns a complete document; mentions whose
/// escalation was cut short stay `not_matched`.
pub async fn analyze_with_cancel(
    document: LayoutDocument,
    config: &MappingConfig,
    cancel: CancelSignal,
) -> Result<AnalysisOutput, RefMapError> {
    let total_start = Instant::now();

    // ── Step 1: Validate input and resolve the disambiguator ─────────────
    let disambiguator = resolve_disambiguator(config)?;
    let document = document.normalised();
    let total_pages = document.total_pages();
    info!(
        "Analyzing {} ({} pages)",
        document.filename.as_deref().unwrap_or("document"),
        total_pages
    );
    if let Some(ref cb) = config.progress_callback {
        cb.on_analysis_start(total_pages);
    }
    stage_done(config, Stage::InputValidated);

    let blocks: Arc<Vec<TextBlock>> = Arc::new(document.text_blocks());
    let elements: Arc<Vec<LayoutElement>> = Arc::new(document.layout_elements());
    let anchors: Vec<(usize, BBox)> = elements
        .iter()
        .filter(|e| e.kind == FigureKind::Equation)
        .map(|e| (e.page_index, e.bbox))
        .collect();

    // ── Step 2: Extract mentions and group figures side by side ──────────
    let extract_task = tokio::task::spawn_blocking({
        let blocks = Arc::clone(&blocks);
        let extraction = config.extraction.clone();
        move || extract::extract_mentions(&blocks, &anchors, &extraction)
    });
    let group_task = tokio::task::spawn_blocking({
        let blocks = Arc::clone(&blocks);
        let elements = Arc::clone(&elements);
        let grouping = config.grouping.clone();
        move || {
            let ids = identify::assign_identifiers(&elements, &blocks, &grouping);
            group::group_elements(&elements, &blocks, &ids, &grouping)
        }
    });
    let (mentions, grouping) = tokio::join!(extract_task, group_task);
    let mentions: Vec<ReferenceMention> =
        mentions.map_err(|e| RefMapError::Internal(format!("reference extraction task failed: {e}")))?;
    stage_done(config, Stage::MentionsExtracted);
    let grouping: Grouping =
        grouping.map_err(|e| RefMapError::Internal(format!("figure grouping task failed: {e}")))?;
    stage_done(config, Stage::FiguresGrouped);

    // ── Step 3: Score and resolve by rules ───────────────────────────────
    let graph = MappingGraph::build(&mentions, &grouping.entities, &config.scoring);
    let mut resolutions = graph.resolve(mentions.len(), config.scoring.acceptance_threshold);
    stage_done(config, Stage::MappingResolved);

    // ── Step 4: Escalate what the rules left open ────────────────────────
    let escalation = match disambiguator {
        Some(d) if !cancel.is_cancelled() => {
            let jobs = escalate::plan_escalation(
                &graph,
                &mentions,
                &grouping.entities,
                &blocks,
                &resolutions,
                &config.escalation,
            );
            escalate::run_escalation(
                d,
                jobs,
                &graph,
                &mut resolutions,
                &config.escalation,
                &cancel,
                config.progress_callback.as_ref(),
            )
            .await
        }
        Some(_) => {
            info!("Run cancelled before escalation; keeping rule-based results");
            EscalationOutcome {
                cancelled: true,
                ..Default::default()
            }
        }
        None => EscalationOutcome::default(),
    };
    stage_done(config, Stage::EscalationFinished);

    // ── Step 5: Assemble ─────────────────────────────────────────────────
    let elapsed = total_start.elapsed().as_secs_f64();
    let output = assemble(&document, &blocks, &mentions, &resolutions, grouping, escalation, elapsed);
    info!(
        "Analysis complete: {}/{} references matched, {} figures, {:.2}s",
        output.stats().total_mentions - output.stats().not_matched,
        output.stats().total_mentions,
        output.stats().total_figures,
        elapsed
    );
    stage_done(config, Stage::DocumentAssembled);
    if let Some(ref cb) = config.progress_callback {
        cb.on_analysis_complete(output.stats());
    }
    Ok(output)
}

/// Load a layout from a path or URL and analyze it.
pub async fn analyze_file(
    input_str: impl AsRef<str>,
    config: &MappingConfig,
) -> Result<AnalysisOutput, RefMapError> {
    let loaded = input::load_layout(input_str.as_ref(), config.download_timeout_secs).await?;
    let mut document = loaded.document;
    if document.filename.is_none() {
        document.filename = Some(loaded.source_name);
    }
    if document.file_size.is_none() {
        document.file_size = Some(loaded.size);
    }
    analyze(document, config).await
}

/// Analyze layout JSON held in memory.
pub async fn analyze_bytes(
    bytes: &[u8],
    config: &MappingConfig,
) -> Result<AnalysisOutput, RefMapError> {
    let document = input::parse_layout(bytes, "<memory>")?;
    analyze(document, config).await
}

/// Analyze a layout and write the JSON result directly to a file.
///
/// Uses atomic write (temp file in the target directory + rename) to
/// prevent partial files.
pub async fn analyze_to_file(
    input_str: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &MappingConfig,
) -> Result<MappingStats, RefMapError> {
    let output = analyze_file(input_str, config).await?;
    write_output(&output, output_path.as_ref(), true).await?;
    Ok(output.metadata.mapping)
}

/// Serialise `output` and write it atomically to `path`, creating parent
/// directories as needed.
pub async fn write_output(
    output: &AnalysisOutput,
    path: &Path,
    pretty: bool,
) -> Result<(), RefMapError> {
    let json = output
        .to_json(pretty)
        .map_err(|e| RefMapError::Internal(format!("serialising output: {e}")))?;
    write_atomic(path, json.as_bytes()).await?;
    debug!("Wrote {} bytes to {}", json.len(), path.display());
    Ok(())
}

/// Synchronous wrapper around [`analyze`].
///
/// Creates a temporary tokio runtime internally.
pub fn analyze_sync(
    document: LayoutDocument,
    config: &MappingConfig,
) -> Result<AnalysisOutput, RefMapError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| RefMapError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(analyze(document, config))
}

// ── Internal helpers ─────────────────────────────────────────────────────

fn stage_done(config: &MappingConfig, stage: Stage) {
    debug!("Stage {:?} complete ({}%)", stage, stage.progress());
    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_complete(stage, stage.progress());
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RefMapError> {
    let write_err = |source: std::io::Error| RefMapError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&parent).await.map_err(write_err)?;

    let target = path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(&bytes)?;
        tmp.flush()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| RefMapError::Internal(format!("output write task failed: {e}")))?
    .map_err(write_err)
}

/// Build the output document from the pipeline results.
fn assemble(
    document: &LayoutDocument,
    blocks: &[TextBlock],
    mentions: &[ReferenceMention],
    resolutions: &[MentionResolution],
    grouping: Grouping,
    escalation: EscalationOutcome,
    elapsed_secs: f64,
) -> AnalysisOutput {
    let entities = &grouping.entities;

    let mut stats = MappingStats {
        total_mentions: mentions.len(),
        total_figures: entities.len(),
        synthetic_figures: entities.iter().filter(|e| e.synthetic).count(),
        escalated: escalation.escalated,
        escalation_failures: escalation.failures.len(),
        grouping_conflicts: grouping.conflicts.len(),
        cancelled: escalation.cancelled,
        ..Default::default()
    };
    for r in resolutions {
        match (r.is_matched(), r.resolved_by) {
            (true, Some(ResolvedBy::Disambiguator)) => stats.matched_by_disambiguator += 1,
            (true, _) => stats.matched_by_rules += 1,
            (false, _) => stats.not_matched += 1,
        }
    }

    let pages = document
        .pages
        .iter()
        .map(|page| PageOutput {
            index: page.index,
            page_size: page.page_size,
            blocks: blocks
                .iter()
                .filter(|b| b.page_index == page.index)
                .map(|b| BlockOutput {
                    text: b.text.clone(),
                    bbox: b.bbox,
                })
                .collect(),
            references: mentions
                .iter()
                .zip(resolutions)
                .filter(|(m, _)| m.page_index == page.index)
                .map(|(m, r)| {
                    let figure_id = r.entity.map(|e| entities[e].figure_id.clone());
                    ReferenceOutput {
                        text: m.raw_text.clone(),
                        bbox: m.bbox,
                        not_matched: figure_id.is_none(),
                        figure_id,
                        kind: m.kind,
                    }
                })
                .collect(),
        })
        .collect();

    AnalysisOutput {
        metadata: DocumentMetadata {
            filename: document
                .filename
                .clone()
                .unwrap_or_else(|| "document".to_string()),
            total_pages: document.total_pages(),
            file_size: document.file_size.unwrap_or(0),
            processing_time: (elapsed_secs * 100.0).round() / 100.0,
            processor: PROCESSOR.to_string(),
            mapping: stats,
        },
        pages,
        figures: entities.iter().map(FigureOutput::from).collect(),
        report: AnalysisReport {
            grouping_conflicts: grouping.conflicts,
            escalation_failures: escalation.failures,
        },
    }
}
