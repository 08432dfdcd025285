//! Output types: the JSON document a mapping run produces.
//!
//! Layout:
//!
//! ```text
//! AnalysisOutput
//! ├── metadata: DocumentMetadata (+ MappingStats)
//! ├── pages[]:  PageOutput { index, page_size, blocks[], references[] }
//! ├── figures[]: FigureOutput
//! └── report:   AnalysisReport (omitted when empty)
//! ```
//!
//! Every mention appears exactly once, on its page, with `not_matched`
//! telling whether `figure_id` points anywhere.

use crate::error::EscalationError;
use crate::model::{BBox, FigureEntity, FigureKind};
use crate::pipeline::group::GroupingConflict;
use serde::Serialize;

/// Counters describing one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MappingStats {
    pub total_mentions: usize,
    pub matched_by_rules: usize,
    pub matched_by_disambiguator: usize,
    pub not_matched: usize,
    pub total_figures: usize,
    pub synthetic_figures: usize,
    pub escalated: usize,
    pub escalation_failures: usize,
    pub grouping_conflicts: usize,
    /// Escalation stopped early because the run was cancelled.
    pub cancelled: bool,
}

impl MappingStats {
    /// Fraction of mentions left unmatched; 0 when there are none.
    pub fn not_matched_rate(&self) -> f64 {
        if self.total_mentions == 0 {
            0.0
        } else {
            self.not_matched as f64 / self.total_mentions as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentMetadata {
    pub filename: String,
    pub total_pages: usize,
    /// Size of the source in bytes, 0 when unknown.
    pub file_size: u64,
    /// Wall-clock seconds, two decimals.
    pub processing_time: f64,
    pub processor: String,
    pub mapping: MappingStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockOutput {
    pub text: String,
    pub bbox: BBox,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceOutput {
    pub text: String,
    pub bbox: BBox,
    /// Id of the target figure; `None` when not matched.
    pub figure_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: FigureKind,
    pub not_matched: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageOutput {
    pub index: usize,
    pub page_size: [f32; 2],
    pub blocks: Vec<BlockOutput>,
    pub references: Vec<ReferenceOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FigureOutput {
    pub figure_id: String,
    #[serde(rename = "type")]
    pub kind: FigureKind,
    pub bbox: BBox,
    pub page_idx: usize,
    pub text: String,
    pub synthetic: bool,
    /// Ids of the layout elements merged into this figure.
    pub elements: Vec<String>,
}

impl From<&FigureEntity> for FigureOutput {
    fn from(entity: &FigureEntity) -> Self {
        Self {
            figure_id: entity.figure_id.clone(),
            kind: entity.kind,
            bbox: entity.bbox,
            page_idx: entity.page_index,
            text: entity.caption_text.clone(),
            synthetic: entity.synthetic,
            elements: entity.constituent_element_ids.clone(),
        }
    }
}

/// Audit trail of everything that did not go cleanly.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisReport {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub grouping_conflicts: Vec<GroupingConflict>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub escalation_failures: Vec<EscalationError>,
}

impl AnalysisReport {
    pub fn is_empty(&self) -> bool {
        self.grouping_conflicts.is_empty() && self.escalation_failures.is_empty()
    }
}

/// The complete result of a mapping run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisOutput {
    pub metadata: DocumentMetadata,
    pub pages: Vec<PageOutput>,
    pub figures: Vec<FigureOutput>,
    #[serde(skip_serializing_if = "AnalysisReport::is_empty")]
    pub report: AnalysisReport,
}

impl AnalysisOutput {
    pub fn stats(&self) -> &MappingStats {
        &self.metadata.mapping
    }

    /// All references across pages, in page order.
    pub fn references(&self) -> impl Iterator<Item = &ReferenceOutput> {
        self.pages.iter().flat_map(|p| p.references.iter())
    }

    pub fn figure(&self, kind: FigureKind, figure_id: &str) -> Option<&FigureOutput> {
        self.figures
            .iter()
            .find(|f| f.kind == kind && f.figure_id == figure_id)
    }

    pub fn to_json(&self, pretty: bool) -> Result<String, serde_json::Error> {
        if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        }
    }
}
