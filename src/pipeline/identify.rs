//! Figure identification: give every layout element a number.
//!
//! Precedence, first hit wins:
//!
//! 1. the collaborator's `explicit_id`, or a number the element's own text
//!    declares ("Figure 3:" at the start, or a trailing equation tag);
//! 2. a caption-like block adjacent to the element ("Table 2. Results");
//! 3. a synthetic `<kind>-seq-<n>` id, numbered per kind in reading order.
//!
//! Adjacency means same page, within `caption_gap` vertically and
//! overlapping horizontally by at least `min_caption_overlap`.

use crate::config::GroupingConfig;
use crate::model::{BlockRole, DocPosition, FigureKind, LayoutElement, TextBlock};
use crate::patterns;
use serde::Serialize;
use tracing::debug;

/// Where an element's identifier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdSource {
    Explicit,
    OwnText,
    Caption,
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifiedElement {
    pub element_index: usize,
    pub figure_id: String,
    pub source: IdSource,
    /// Block that supplied the id, for [`IdSource::Caption`].
    pub caption_block: Option<usize>,
}

impl IdentifiedElement {
    pub fn is_synthetic(&self) -> bool {
        self.source == IdSource::Sequential
    }
}

/// Whether a block may serve as a caption.
///
/// Caption-role blocks always can. Blocks of unknown role can when they
/// start like one ("Figure 2: ..."). Body text never does.
pub fn is_caption_like(block: &TextBlock) -> bool {
    match block.role {
        BlockRole::Caption => true,
        BlockRole::Unknown => patterns::caption_kind(&block.text).is_some(),
        _ => false,
    }
}

/// Caption-like blocks adjacent to `element`, nearest first, as
/// `(block_index, vertical_gap)`.
pub fn adjacent_captions(
    element: &LayoutElement,
    blocks: &[TextBlock],
    config: &GroupingConfig,
) -> Vec<(usize, f32)> {
    let mut adjacent: Vec<(usize, f32)> = blocks
        .iter()
        .enumerate()
        .filter(|(_, b)| b.page_index == element.page_index && is_caption_like(b))
        .filter_map(|(i, b)| {
            let gap = element.bbox.vertical_gap(&b.bbox);
            let overlap = element.bbox.horizontal_overlap_ratio(&b.bbox);
            (gap <= config.caption_gap && overlap >= config.min_caption_overlap).then_some((i, gap))
        })
        .collect();
    adjacent.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    adjacent
}

/// Assign an identifier to every element. Output is in element order.
pub fn assign_identifiers(
    elements: &[LayoutElement],
    blocks: &[TextBlock],
    config: &GroupingConfig,
) -> Vec<IdentifiedElement> {
    let mut identified: Vec<Option<IdentifiedElement>> = elements
        .iter()
        .enumerate()
        .map(|(i, e)| identify_from_document(i, e, blocks, config))
        .collect();

    // ── Synthetic ids, per kind, in reading order ──
    let mut order: Vec<usize> = (0..elements.len()).collect();
    order.sort_by(|&a, &b| {
        let pa = DocPosition::of(elements[a].page_index, &elements[a].bbox);
        let pb = DocPosition::of(elements[b].page_index, &elements[b].bbox);
        pa.reading_cmp(&pb).then(a.cmp(&b))
    });
    let mut counters = [0usize; FigureKind::ALL.len()];
    for i in order {
        if identified[i].is_some() {
            continue;
        }
        let kind = elements[i].kind;
        counters[kind.slot()] += 1;
        identified[i] = Some(IdentifiedElement {
            element_index: i,
            figure_id: synthetic_id(kind, counters[kind.slot()]),
            source: IdSource::Sequential,
            caption_block: None,
        });
    }

    let identified: Vec<IdentifiedElement> = identified.into_iter().flatten().collect();
    debug!(
        "Identified {} elements ({} synthetic)",
        identified.len(),
        identified.iter().filter(|e| e.is_synthetic()).count()
    );
    identified
}

pub fn synthetic_id(kind: FigureKind, n: usize) -> String {
    format!("{kind}-seq-{n}")
}

fn identify_from_document(
    index: usize,
    element: &LayoutElement,
    blocks: &[TextBlock],
    config: &GroupingConfig,
) -> Option<IdentifiedElement> {
    let found = |figure_id: String, source: IdSource, caption_block: Option<usize>| IdentifiedElement {
        element_index: index,
        figure_id,
        source,
        caption_block,
    };

    // ── Step 1: explicit or self-declared ──
    if let Some(id) = element
        .explicit_id
        .as_deref()
        .and_then(|raw| patterns::normalize_id(element.kind, raw))
    {
        return Some(found(id, IdSource::Explicit, None));
    }
    if let Some(id) = own_text_id(element) {
        return Some(found(id, IdSource::OwnText, None));
    }

    // ── Step 2: adjacent caption ──
    adjacent_captions(element, blocks, config)
        .into_iter()
        .find_map(|(b, _)| {
            patterns::caption_id(element.kind, &blocks[b].text)
                .map(|id| found(id, IdSource::Caption, Some(b)))
        })
}

fn own_text_id(element: &LayoutElement) -> Option<String> {
    let text = element.raw_text.trim();
    if text.is_empty() {
        return None;
    }
    patterns::caption_id(element.kind, text).or_else(|| {
        (element.kind == FigureKind::Equation)
            .then(|| patterns::equation_tag(text))
            .flatten()
    })
}
