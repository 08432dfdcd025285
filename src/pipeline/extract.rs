//! Reference extraction: text blocks → [`ReferenceMention`]s.
//!
//! Every block that is not caption-like (see [`identify::is_caption_like`])
//! is scanned with each kind's mention pattern. Identifier lists and ranges fan out into one mention per identifier,
//! all sharing the matched surface text and its estimated box. Bare `(n)`
//! equation references are accepted only inside blocks close to an equation
//! element, and never where an explicit mention already covers the text.
//!
//! Mentions come out in reading order: block order first, then position
//! inside the block.

use crate::config::ExtractionConfig;
use crate::model::{BBox, FigureKind, ReferenceMention, TextBlock};
use crate::patterns;
use crate::pipeline::identify;
use tracing::debug;

/// Narrowest box a mention may get, in page units.
const MIN_MENTION_WIDTH: f32 = 5.0;

/// Extract every reference mention from `blocks`.
///
/// `equation_anchors` are `(page_index, bbox)` of equation elements; they
/// gate bare `(n)` references.
pub fn extract_mentions(
    blocks: &[TextBlock],
    equation_anchors: &[(usize, BBox)],
    config: &ExtractionConfig,
) -> Vec<ReferenceMention> {
    let mut mentions = Vec::new();
    for (block_index, block) in blocks.iter().enumerate() {
        if identify::is_caption_like(block) || block.text.trim().is_empty() {
            continue;
        }
        let found = extract_from_block(block_index, block, equation_anchors, config);
        mentions.extend(found);
    }
    debug!("Extracted {} reference mentions from {} blocks", mentions.len(), blocks.len());
    mentions
}

fn extract_from_block(
    block_index: usize,
    block: &TextBlock,
    equation_anchors: &[(usize, BBox)],
    config: &ExtractionConfig,
) -> Vec<ReferenceMention> {
    let text = block.text.as_str();
    let mut found: Vec<ReferenceMention> = Vec::new();

    // ── Explicit "Fig. 3" style mentions ──
    for pattern in patterns::compiled() {
        let kind = pattern.descriptor.kind;
        for caps in pattern.mention.captures_iter(text) {
            let (Some(whole), Some(ids)) = (caps.get(0), caps.name("ids")) else {
                continue;
            };
            let listed = patterns::split_id_list(kind, ids.as_str(), config.max_range_span);
            let raw_text = whole.as_str().trim_end().to_string();
            let span = (whole.start(), whole.start() + raw_text.len());
            let bbox = span_bbox(block, span.0, span.1);
            if listed.is_empty() {
                found.push(mention(block_index, block, kind, None, &raw_text, span, bbox));
            }
            for item in listed {
                found.push(mention(block_index, block, kind, Some(item.id), &raw_text, span, bbox));
            }
        }
    }

    // ── Bare "(n)" equation mentions ──
    if near_equation(block, equation_anchors, config.bare_equation_proximity) {
        for bare in patterns::bare_equations(text) {
            let covered = found
                .iter()
                .any(|m| bare.start < m.span.1 && m.span.0 < bare.end);
            if covered {
                continue;
            }
            let span = (bare.start, bare.end);
            let bbox = span_bbox(block, span.0, span.1);
            found.push(mention(
                block_index,
                block,
                FigureKind::Equation,
                Some(bare.id),
                &text[bare.start..bare.end],
                span,
                bbox,
            ));
        }
    }

    // Stable: ids of one list keep their written order.
    found.sort_by_key(|m| m.span.0);
    found
}

fn mention(
    block_index: usize,
    block: &TextBlock,
    kind: FigureKind,
    normalized_id: Option<String>,
    raw_text: &str,
    span: (usize, usize),
    bbox: BBox,
) -> ReferenceMention {
    ReferenceMention {
        raw_text: raw_text.to_string(),
        kind,
        normalized_id,
        bbox,
        page_index: block.page_index,
        block_index,
        span,
    }
}

fn near_equation(block: &TextBlock, anchors: &[(usize, BBox)], proximity: Option<f32>) -> bool {
    let Some(max_distance) = proximity else {
        return false;
    };
    anchors
        .iter()
        .any(|(page, bbox)| *page == block.page_index && block.bbox.edge_distance(bbox) <= max_distance)
}

/// Estimate the box of `text[start..end]` inside its block.
///
/// Lines are assumed to share the block height evenly and characters to
/// share a line's width evenly. The result is clamped to the block and is
/// never narrower than [`MIN_MENTION_WIDTH`] unless the block itself is.
pub fn span_bbox(block: &TextBlock, start: usize, end: usize) -> BBox {
    let text = block.text.as_str();
    let lines: Vec<&str> = text.split('\n').collect();
    let line_height = block.bbox.h / lines.len().max(1) as f32;

    let mut line_start = 0usize;
    for (i, line) in lines.iter().enumerate() {
        let line_end = line_start + line.len();
        if start <= line_end {
            let line_chars = line.chars().count().max(1) as f32;
            let char_width = block.bbox.w / line_chars;
            let before = line[..start - line_start].chars().count() as f32;
            let span_end = end.min(line_end).max(start);
            let len = text[start..span_end].chars().count() as f32;

            let x0 = (block.bbox.x + before * char_width).min(block.bbox.right());
            let x1 = (x0 + (len * char_width).max(MIN_MENTION_WIDTH)).min(block.bbox.right());
            let y = block.bbox.y + i as f32 * line_height;
            return BBox::new(x0, y, x1 - x0, line_height);
        }
        // +1 for the '\n' consumed by split.
        line_start = line_end + 1;
    }
    block.bbox
}
