//! Layout data model and the engine's intermediate entities.
//!
//! The layout/OCR collaborator hands the engine a [`LayoutDocument`]: pages
//! of [`TextBlock`]s and [`LayoutElement`]s, each with a page-space
//! [`BBox`]. The engine turns those into [`ReferenceMention`]s (from text)
//! and [`FigureEntity`]s (from elements), then links them through
//! [`MentionResolution`]s.
//!
//! ## Why lenient deserialisation
//!
//! Layout collaborators disagree on labels (`Picture` vs `figure`,
//! `Formula` vs `equation`) and on box encodings (`[x0, y0, x1, y1]` vs
//! `{x, y, w, h}`). Serde aliases and the [`BBox`] corner form absorb those
//! differences at the boundary so the engine only ever sees one vocabulary.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// ── Geometry ─────────────────────────────────────────────────────────────

/// Axis-aligned rectangle in page coordinates (origin top-left, y grows
/// downward).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "BBoxRepr")]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// Accepted wire encodings of a box.
#[derive(Deserialize)]
#[serde(untagged)]
enum BBoxRepr {
    Rect { x: f32, y: f32, w: f32, h: f32 },
    Corners([f32; 4]),
}

impl From<BBoxRepr> for BBox {
    fn from(repr: BBoxRepr) -> Self {
        match repr {
            BBoxRepr::Rect { x, y, w, h } => BBox::new(x, y, w, h),
            BBoxRepr::Corners([x0, y0, x1, y1]) => BBox::from_corners(x0, y0, x1, y1),
        }
    }
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self {
            x,
            y,
            w: w.max(0.0),
            h: h.max(0.0),
        }
    }

    /// Build from two opposite corners in any order.
    pub fn from_corners(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        let (left, right) = (x0.min(x1), x0.max(x1));
        let (top, bottom) = (y0.min(y1), y0.max(y1));
        Self::new(left, top, right - left, bottom - top)
    }

    pub fn right(&self) -> f32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.h
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &BBox) -> BBox {
        BBox::from_corners(
            self.x.min(other.x),
            self.y.min(other.y),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    /// Empty space between the boxes along the y axis; 0 when they overlap
    /// vertically.
    pub fn vertical_gap(&self, other: &BBox) -> f32 {
        (other.y - self.bottom()).max(self.y - other.bottom()).max(0.0)
    }

    pub fn horizontal_gap(&self, other: &BBox) -> f32 {
        (other.x - self.right()).max(self.x - other.right()).max(0.0)
    }

    /// Horizontal overlap as a fraction of the narrower box's width.
    pub fn horizontal_overlap_ratio(&self, other: &BBox) -> f32 {
        let overlap = (self.right().min(other.right()) - self.x.max(other.x)).max(0.0);
        let narrower = self.w.min(other.w);
        if narrower <= 0.0 {
            0.0
        } else {
            overlap / narrower
        }
    }

    /// Euclidean distance between the closest edges; 0 when the boxes touch
    /// or intersect.
    pub fn edge_distance(&self, other: &BBox) -> f32 {
        self.horizontal_gap(other).hypot(self.vertical_gap(other))
    }
}

/// Reading-order position of something on a page.
///
/// Ordered by page, then top edge, then left edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DocPosition {
    pub page: usize,
    pub y: f32,
    pub x: f32,
}

impl DocPosition {
    pub fn of(page: usize, bbox: &BBox) -> Self {
        Self {
            page,
            y: bbox.y,
            x: bbox.x,
        }
    }

    pub fn reading_cmp(&self, other: &DocPosition) -> Ordering {
        self.page
            .cmp(&other.page)
            .then(self.y.total_cmp(&other.y))
            .then(self.x.total_cmp(&other.x))
    }
}

// ── Layout vocabulary ────────────────────────────────────────────────────

/// Category of a referenceable element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FigureKind {
    #[serde(alias = "Figure", alias = "Picture", alias = "picture", alias = "PictureGroup", alias = "FigureGroup")]
    Figure,
    #[serde(alias = "Table", alias = "TableGroup")]
    Table,
    #[serde(alias = "Equation", alias = "EquationGroup", alias = "Formula", alias = "formula")]
    Equation,
    #[serde(alias = "Algorithm", alias = "Code", alias = "code", alias = "CodeGroup")]
    Algorithm,
    #[serde(alias = "Example")]
    Example,
}

impl FigureKind {
    pub const ALL: [FigureKind; 5] = [
        FigureKind::Figure,
        FigureKind::Table,
        FigureKind::Equation,
        FigureKind::Algorithm,
        FigureKind::Example,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FigureKind::Figure => "figure",
            FigureKind::Table => "table",
            FigureKind::Equation => "equation",
            FigureKind::Algorithm => "algorithm",
            FigureKind::Example => "example",
        }
    }

    /// Dense index for per-kind counters.
    pub(crate) fn slot(&self) -> usize {
        match self {
            FigureKind::Figure => 0,
            FigureKind::Table => 1,
            FigureKind::Equation => 2,
            FigureKind::Algorithm => 3,
            FigureKind::Example => 4,
        }
    }
}

impl fmt::Display for FigureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a text block is, according to the layout collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockRole {
    #[serde(alias = "Text", alias = "TextInlineMath", alias = "ListItem", alias = "text")]
    Body,
    #[serde(alias = "Caption")]
    Caption,
    #[serde(alias = "SectionHeader", alias = "Title", alias = "PageHeader")]
    Title,
    #[serde(alias = "Footnote", alias = "PageFooter")]
    Footnote,
    #[default]
    #[serde(other)]
    Unknown,
}

/// A run of text with its page location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub text: String,
    pub bbox: BBox,
    #[serde(default, alias = "page_idx")]
    pub page_index: usize,
    #[serde(default, alias = "block_type")]
    pub role: BlockRole,
}

/// A non-text region detected by the layout collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutElement {
    /// Stable id; filled in by [`LayoutDocument::normalised`] when absent.
    #[serde(default)]
    pub id: String,
    #[serde(alias = "block_type", alias = "type")]
    pub kind: FigureKind,
    pub bbox: BBox,
    #[serde(default, alias = "page_idx")]
    pub page_index: usize,
    /// OCR text inside the element, if any.
    #[serde(default, alias = "text")]
    pub raw_text: String,
    /// Number the collaborator already knows (e.g. from PDF structure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutPage {
    pub index: usize,
    /// `[width, height]` in the same units as the boxes.
    #[serde(default)]
    pub page_size: [f32; 2],
    #[serde(default)]
    pub blocks: Vec<TextBlock>,
    #[serde(default, alias = "figures")]
    pub elements: Vec<LayoutElement>,
}

/// Everything the layout collaborator produced for one PDF.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Size of the source PDF in bytes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    pub pages: Vec<LayoutPage>,
}

impl LayoutDocument {
    /// Parse collaborator JSON and normalise it.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let doc: LayoutDocument = serde_json::from_slice(bytes)?;
        Ok(doc.normalised())
    }

    /// Sort pages, stamp page indices onto blocks and elements, and assign
    /// `p<page>-e<n>` ids to elements that arrived without one.
    ///
    /// Idempotent.
    pub fn normalised(mut self) -> Self {
        self.pages.sort_by_key(|p| p.index);
        for page in &mut self.pages {
            for block in &mut page.blocks {
                block.page_index = page.index;
            }
            for (n, element) in page.elements.iter_mut().enumerate() {
                element.page_index = page.index;
                if element.id.trim().is_empty() {
                    element.id = format!("p{}-e{}", page.index, n);
                }
            }
        }
        self
    }

    pub fn total_pages(&self) -> usize {
        self.pages.len()
    }

    /// All text blocks in page order, then collaborator order.
    pub fn text_blocks(&self) -> Vec<TextBlock> {
        self.pages
            .iter()
            .flat_map(|p| p.blocks.iter().cloned())
            .collect()
    }

    /// All layout elements in page order.
    pub fn layout_elements(&self) -> Vec<LayoutElement> {
        self.pages
            .iter()
            .flat_map(|p| p.elements.iter().cloned())
            .collect()
    }
}

// ── Engine entities ──────────────────────────────────────────────────────

/// One textual reference such as "Fig. 3" found in a text block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceMention {
    /// Matched surface text, e.g. `"Figs. 2-4"`.
    pub raw_text: String,
    pub kind: FigureKind,
    /// Canonical number; `None` when the token could not be normalised.
    pub normalized_id: Option<String>,
    /// Estimated location of the mention inside its block.
    pub bbox: BBox,
    pub page_index: usize,
    /// Index into the document-wide block list.
    pub block_index: usize,
    /// Byte range of `raw_text` within the block text.
    pub span: (usize, usize),
}

impl ReferenceMention {
    pub fn position(&self) -> DocPosition {
        DocPosition::of(self.page_index, &self.bbox)
    }
}

/// A logical figure, table, equation, algorithm or example.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FigureEntity {
    pub figure_id: String,
    pub kind: FigureKind,
    pub bbox: BBox,
    pub caption_text: String,
    pub page_index: usize,
    pub constituent_element_ids: Vec<String>,
    /// `true` when the id was invented rather than read from the document.
    pub synthetic: bool,
}

impl FigureEntity {
    pub fn position(&self) -> DocPosition {
        DocPosition::of(self.page_index, &self.bbox)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Matched,
    NotMatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    /// Picked by the rule-based scorer.
    Rules,
    /// Picked by the LLM disambiguator.
    Disambiguator,
}

/// Final decision for one mention.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MentionResolution {
    pub mention: usize,
    pub status: ResolutionStatus,
    /// Index into the entity list when matched.
    pub entity: Option<usize>,
    pub score: f32,
    pub resolved_by: Option<ResolvedBy>,
}

impl MentionResolution {
    pub fn unmatched(mention: usize) -> Self {
        Self {
            mention,
            status: ResolutionStatus::NotMatched,
            entity: None,
            score: 0.0,
            resolved_by: None,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.status == ResolutionStatus::Matched
    }
}
