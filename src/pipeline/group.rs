//! Figure grouping: layout elements → logical [`FigureEntity`]s.
//!
//! Three strategies propose merges and caption attachments:
//!
//! | Strategy  | Proposes                                                      |
//! |-----------|---------------------------------------------------------------|
//! | id        | merging same-kind elements that carry the same non-synthetic id |
//! | pattern   | attaching each caption to the adjacent element it names, and merging the other elements of that kind it also touches |
//! | proximity | merging same-kind elements whose edges nearly touch (configured kinds only) |
//!
//! ## Why an arbiter
//!
//! Strategies disagree. A sub-figure panel sits right next to its sibling
//! (proximity says merge) while two separately captioned figures can be
//! just as close. The arbiter applies proposals in strategy order over a
//! union-find and refuses any merge that would put two different document
//! ids into one entity. Refusals are logged and reported as
//! [`GroupingConflict`]s instead of silently picking a winner.
//!
//! After merging, ids are checked for uniqueness per kind. A duplicate (the
//! same id on two pages the strategies did not connect) keeps its first
//! occurrence; later ones are renamed `<id>-dup-<n>` and marked synthetic.

use crate::config::GroupingConfig;
use crate::model::{DocPosition, FigureEntity, FigureKind, LayoutElement, TextBlock};
use crate::patterns;
use crate::pipeline::identify::{self, IdentifiedElement};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Id,
    Pattern,
    Proximity,
}

/// Proposal to put two elements into one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeProposal {
    pub left: usize,
    pub right: usize,
    pub strategy: Strategy,
}

/// Caption block owned by an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptionAttachment {
    pub element: usize,
    pub block: usize,
}

/// A merge the arbiter refused.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupingConflict {
    pub kind: FigureKind,
    pub strategy: Strategy,
    /// Element ids of the proposal.
    pub elements: (String, String),
    /// The two document ids that could not be reconciled.
    pub figure_ids: (String, String),
}

/// Result of the grouping stage.
#[derive(Debug, Clone, Default)]
pub struct Grouping {
    /// Entities in reading order of their first element.
    pub entities: Vec<FigureEntity>,
    pub conflicts: Vec<GroupingConflict>,
    /// Entities renamed by the uniqueness check.
    pub renamed: usize,
}

// ── Strategies ───────────────────────────────────────────────────────────

/// Same kind and same non-synthetic id.
pub fn id_proposals(elements: &[LayoutElement], ids: &[IdentifiedElement]) -> Vec<MergeProposal> {
    let mut first: HashMap<(FigureKind, &str), usize> = HashMap::new();
    let mut proposals = Vec::new();
    for ident in ids.iter().filter(|i| !i.is_synthetic()) {
        let key = (elements[ident.element_index].kind, ident.figure_id.as_str());
        match first.get(&key) {
            Some(&anchor) => proposals.push(MergeProposal {
                left: anchor,
                right: ident.element_index,
                strategy: Strategy::Id,
            }),
            None => {
                first.insert(key, ident.element_index);
            }
        }
    }
    proposals
}

/// Attach each caption to its owner; propose merging the other elements of
/// the owner's kind that the caption also touches.
///
/// The owner is, in order: the nearest element that took its id from this
/// caption, the nearest adjacent element of the kind the caption names
/// ("Table 2: ..." only attaches to tables), or the nearest adjacent element
/// when the caption names no kind. A typed caption with no adjacent element
/// of its kind is left unattached.
pub fn pattern_proposals(
    elements: &[LayoutElement],
    blocks: &[TextBlock],
    ids: &[IdentifiedElement],
    config: &GroupingConfig,
) -> (Vec<CaptionAttachment>, Vec<MergeProposal>) {
    let mut attachments = Vec::new();
    let mut proposals = Vec::new();

    for (b, block) in blocks.iter().enumerate() {
        if !identify::is_caption_like(block) {
            continue;
        }
        let mut touching: Vec<(usize, f32)> = elements
            .iter()
            .enumerate()
            .filter(|(_, e)| e.page_index == block.page_index)
            .filter_map(|(i, e)| {
                let gap = e.bbox.vertical_gap(&block.bbox);
                let overlap = e.bbox.horizontal_overlap_ratio(&block.bbox);
                (gap <= config.caption_gap && overlap >= config.min_caption_overlap)
                    .then_some((i, gap))
            })
            .collect();
        touching.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let named_kind = patterns::caption_kind(&block.text).map(|(kind, _)| kind);
        let owner = touching
            .iter()
            .find(|&&(i, _)| ids.get(i).and_then(|id| id.caption_block) == Some(b))
            .or_else(|| match named_kind {
                Some(kind) => touching.iter().find(|&&(i, _)| elements[i].kind == kind),
                None => touching.first(),
            });
        let Some(&(owner, _)) = owner else {
            if !touching.is_empty() {
                debug!(
                    "Caption '{}' on page {} touches no {:?} element; left unattached",
                    block.text.trim(),
                    block.page_index,
                    named_kind
                );
            }
            continue;
        };
        attachments.push(CaptionAttachment {
            element: owner,
            block: b,
        });
        let kind = elements[owner].kind;
        for &(other, _) in touching.iter().filter(|&&(i, _)| i != owner) {
            if elements[other].kind == kind {
                proposals.push(MergeProposal {
                    left: owner,
                    right: other,
                    strategy: Strategy::Pattern,
                });
            }
        }
    }
    (attachments, proposals)
}

/// Same page, same kind from `proximity_kinds`, edges within
/// `proximity_gap`. Pairs that carry two different document ids are never
/// proposed.
pub fn proximity_proposals(
    elements: &[LayoutElement],
    ids: &[IdentifiedElement],
    config: &GroupingConfig,
) -> Vec<MergeProposal> {
    let mut proposals = Vec::new();
    for (i, a) in elements.iter().enumerate() {
        if !config.proximity_kinds.contains(&a.kind) {
            continue;
        }
        for (j, b) in elements.iter().enumerate().skip(i + 1) {
            if a.kind != b.kind || a.page_index != b.page_index {
                continue;
            }
            if a.bbox.edge_distance(&b.bbox) > config.proximity_gap {
                continue;
            }
            let both_named = !ids[i].is_synthetic() && !ids[j].is_synthetic();
            if both_named && ids[i].figure_id != ids[j].figure_id {
                continue;
            }
            proposals.push(MergeProposal {
                left: i,
                right: j,
                strategy: Strategy::Proximity,
            });
        }
    }
    proposals
}

// ── Arbiter ──────────────────────────────────────────────────────────────

/// Union-find over element indices, tracking the document id of each set.
struct Groups {
    parent: Vec<usize>,
    named: Vec<Option<String>>,
}

impl Groups {
    fn new(ids: &[IdentifiedElement]) -> Self {
        Self {
            parent: (0..ids.len()).collect(),
            named: ids
                .iter()
                .map(|i| (!i.is_synthetic()).then(|| i.figure_id.clone()))
                .collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        while self.parent[x] != root {
            let next = self.parent[x];
            self.parent[x] = root;
            x = next;
        }
        root
    }

    /// Merge the sets of `a` and `b`. On conflict returns the two ids.
    fn union(&mut self, a: usize, b: usize) -> Result<(), (String, String)> {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return Ok(());
        }
        if let (Some(x), Some(y)) = (&self.named[ra], &self.named[rb]) {
            if x != y {
                return Err((x.clone(), y.clone()));
            }
        }
        let (keep, absorbed) = (ra.min(rb), ra.max(rb));
        self.parent[absorbed] = keep;
        if self.named[keep].is_none() {
            self.named[keep] = self.named[absorbed].take();
        }
        Ok(())
    }
}

/// Run every strategy and build the final entities.
///
/// `ids` must be the output of [`identify::assign_identifiers`] for the
/// same `elements`.
pub fn group_elements(
    elements: &[LayoutElement],
    blocks: &[TextBlock],
    ids: &[IdentifiedElement],
    config: &GroupingConfig,
) -> Grouping {
    let (attachments, pattern) = pattern_proposals(elements, blocks, ids, config);
    let proposals = id_proposals(elements, ids)
        .into_iter()
        .chain(pattern)
        .chain(proximity_proposals(elements, ids, config));

    let mut groups = Groups::new(ids);
    let mut conflicts = Vec::new();
    for p in proposals {
        let (a, b) = (&elements[p.left], &elements[p.right]);
        if a.kind != b.kind {
            continue;
        }
        if let Err((left_id, right_id)) = groups.union(p.left, p.right) {
            warn!(
                "Grouping conflict ({:?}): {} '{}' vs '{}' for elements {} and {}",
                p.strategy, a.kind, left_id, right_id, a.id, b.id
            );
            conflicts.push(GroupingConflict {
                kind: a.kind,
                strategy: p.strategy,
                elements: (a.id.clone(), b.id.clone()),
                figure_ids: (left_id, right_id),
            });
        }
    }

    // ── Collect sets ──
    let mut members: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..elements.len() {
        let root = groups.find(i);
        members.entry(root).or_default().push(i);
    }
    let mut captions: HashMap<usize, Vec<usize>> = HashMap::new();
    for att in &attachments {
        let root = groups.find(att.element);
        captions.entry(root).or_default().push(att.block);
    }

    let mut sets: Vec<(usize, Vec<usize>)> = members.into_iter().collect();
    for (_, m) in sets.iter_mut() {
        m.sort_by(|&a, &b| position(elements, a).reading_cmp(&position(elements, b)).then(a.cmp(&b)));
    }
    sets.sort_by(|(_, a), (_, b)| {
        position(elements, a[0])
            .reading_cmp(&position(elements, b[0]))
            .then(a[0].cmp(&b[0]))
    });

    let mut entities: Vec<FigureEntity> = sets
        .iter()
        .map(|(root, m)| {
            let mut caption_blocks = captions.remove(root).unwrap_or_default();
            caption_blocks.sort_unstable();
            caption_blocks.dedup();
            build_entity(elements, blocks, ids, m, &caption_blocks, groups.named[*root].clone())
        })
        .collect();

    let renamed = enforce_unique_ids(&mut entities);
    debug!(
        "Grouped {} elements into {} entities ({} conflicts, {} renamed)",
        elements.len(),
        entities.len(),
        conflicts.len(),
        renamed
    );
    Grouping {
        entities,
        conflicts,
        renamed,
    }
}

fn position(elements: &[LayoutElement], i: usize) -> DocPosition {
    DocPosition::of(elements[i].page_index, &elements[i].bbox)
}

fn build_entity(
    elements: &[LayoutElement],
    blocks: &[TextBlock],
    ids: &[IdentifiedElement],
    members: &[usize],
    caption_blocks: &[usize],
    named: Option<String>,
) -> FigureEntity {
    let first = &elements[members[0]];
    let bbox = members
        .iter()
        .map(|&i| elements[i].bbox)
        .chain(caption_blocks.iter().map(|&b| blocks[b].bbox))
        .reduce(|acc, b| acc.union(&b))
        .unwrap_or_default();

    let mut caption_text = caption_blocks
        .iter()
        .map(|&b| blocks[b].text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if caption_text.is_empty() {
        caption_text = members
            .iter()
            .map(|&i| elements[i].raw_text.trim())
            .find(|t| !t.is_empty())
            .unwrap_or_default()
            .to_string();
    }

    let (figure_id, synthetic) = match named {
        Some(id) => (id, false),
        None => (ids[members[0]].figure_id.clone(), true),
    };

    FigureEntity {
        figure_id,
        kind: first.kind,
        bbox,
        caption_text,
        page_index: members.iter().map(|&i| elements[i].page_index).min().unwrap_or(first.page_index),
        constituent_element_ids: members.iter().map(|&i| elements[i].id.clone()).collect(),
        synthetic,
    }
}

/// Rename later duplicates of `(kind, id)` to `<id>-dup-<n>`. Returns the
/// number of renamed entities.
fn enforce_unique_ids(entities: &mut [FigureEntity]) -> usize {
    let mut seen: HashMap<(FigureKind, String), usize> = HashMap::new();
    let mut renamed = 0;
    for entity in entities.iter_mut() {
        let count = seen
            .entry((entity.kind, entity.figure_id.clone()))
            .or_insert(0);
        *count += 1;
        if *count > 1 {
            let new_id = format!("{}-dup-{}", entity.figure_id, *count - 1);
            error!(
                "Duplicate {} id '{}' on page {}; renamed to '{}'",
                entity.kind, entity.figure_id, entity.page_index, new_id
            );
            entity.figure_id = new_id;
            entity.synthetic = true;
            renamed += 1;
        }
    }
    renamed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BBox, BlockRole};
    use crate::pipeline::identify::assign_identifiers;

    fn element(id: &str, kind: FigureKind, page: usize, bbox: BBox) -> LayoutElement {
        LayoutElement {
            id: id.to_string(),
            kind,
            bbox,
            page_index: page,
            raw_text: String::new(),
            explicit_id: None,
        }
    }

    fn caption(text: &str, page: usize, bbox: BBox) -> TextBlock {
        TextBlock {
            id: None,
            text: text.to_string(),
            bbox,
            page_index: page,
            role: BlockRole::Caption,
        }
    }

    fn run(elements: &[LayoutElement], blocks: &[TextBlock]) -> Grouping {
        let config = GroupingConfig::default();
        let ids = assign_identifiers(elements, blocks, &config);
        group_elements(elements, blocks, &ids, &config)
    }

    #[test]
    fn shared_caption_merges_panels() {
        // Two panels side by side, one caption spanning both.
        let elements = vec![
            element("a", FigureKind::Figure, 0, BBox::new(50.0, 100.0, 200.0, 150.0)),
            element("b", FigureKind::Figure, 0, BBox::new(300.0, 100.0, 200.0, 150.0)),
        ];
        let blocks = vec![caption("Figure 2: Two panels", 0, BBox::new(50.0, 260.0, 450.0, 20.0))];
        let g = run(&elements, &blocks);
        assert_eq!(g.entities.len(), 1);
        let e = &g.entities[0];
        assert_eq!(e.figure_id, "2");
        assert!(!e.synthetic);
        assert_eq!(e.constituent_element_ids, vec!["a", "b"]);
        assert_eq!(e.caption_text, "Figure 2: Two panels");
        assert_eq!(e.bbox, BBox::new(50.0, 100.0, 450.0, 180.0));
    }

    #[test]
    fn typed_caption_goes_to_the_element_it_names() {
        // "Table 2" caption sits closer to the figure above than to its table.
        let elements = vec![
            element("fig", FigureKind::Figure, 0, BBox::new(50.0, 50.0, 400.0, 100.0)),
            element("tab", FigureKind::Table, 0, BBox::new(50.0, 200.0, 400.0, 200.0)),
        ];
        let blocks = vec![caption("Table 2: Timings", 0, BBox::new(60.0, 160.0, 380.0, 20.0))];
        let g = run(&elements, &blocks);
        assert_eq!(g.entities.len(), 2);

        let figure = &g.entities[0];
        assert_eq!(figure.figure_id, "figure-seq-1");
        assert_eq!(figure.caption_text, "");
        assert_eq!(figure.bbox, BBox::new(50.0, 50.0, 400.0, 100.0));

        let table = &g.entities[1];
        assert_eq!(table.figure_id, "2");
        assert_eq!(table.caption_text, "Table 2: Timings");
        assert_eq!(table.bbox, BBox::new(50.0, 160.0, 400.0, 240.0));
    }

    #[test]
    fn typed_caption_without_its_kind_nearby_stays_unattached() {
        let elements = vec![element("fig", FigureKind::Figure, 0, BBox::new(50.0, 50.0, 400.0, 100.0))];
        let blocks = vec![caption("Table 5: Elsewhere", 0, BBox::new(60.0, 160.0, 380.0, 20.0))];
        let config = GroupingConfig::default();
        let ids = assign_identifiers(&elements, &blocks, &config);
        let (attachments, proposals) = pattern_proposals(&elements, &blocks, &ids, &config);
        assert!(attachments.is_empty());
        assert!(proposals.is_empty());
    }

    #[test]
    fn untyped_caption_falls_back_to_the_nearest_element() {
        let elements = vec![
            element("fig", FigureKind::Figure, 0, BBox::new(50.0, 50.0, 400.0, 100.0)),
            element("tab", FigureKind::Table, 0, BBox::new(50.0, 200.0, 400.0, 200.0)),
        ];
        let blocks = vec![caption("Overview of the measurement setup", 0, BBox::new(60.0, 160.0, 380.0, 20.0))];
        let g = run(&elements, &blocks);
        assert_eq!(g.entities[0].caption_text, "Overview of the measurement setup");
        assert_eq!(g.entities[1].caption_text, "");
    }

    #[test]
    fn proximity_merges_uncaptioned_neighbours_of_listed_kinds_only() {
        let elements = vec![
            element("a", FigureKind::Figure, 0, BBox::new(50.0, 100.0, 200.0, 100.0)),
            element("b", FigureKind::Figure, 0, BBox::new(50.0, 210.0, 200.0, 100.0)),
            element("c", FigureKind::Equation, 0, BBox::new(50.0, 400.0, 200.0, 30.0)),
            element("d", FigureKind::Equation, 0, BBox::new(50.0, 435.0, 200.0, 30.0)),
        ];
        let g = run(&elements, &[]);
        assert_eq!(g.entities.len(), 3);
        assert_eq!(g.entities[0].constituent_element_ids, vec!["a", "b"]);
        assert_eq!(g.entities[0].figure_id, "figure-seq-1");
        assert!(g.entities[0].synthetic);
        assert_eq!(g.entities[1].figure_id, "equation-seq-1");
        assert_eq!(g.entities[2].figure_id, "equation-seq-2");
    }

    #[test]
    fn same_id_across_pages_merges() {
        let mut a = element("a", FigureKind::Table, 0, BBox::new(50.0, 600.0, 400.0, 100.0));
        a.explicit_id = Some("3".into());
        let mut b = element("b", FigureKind::Table, 1, BBox::new(50.0, 50.0, 400.0, 100.0));
        b.explicit_id = Some("3".into());
        let g = run(&[a, b], &[]);
        assert_eq!(g.entities.len(), 1);
        assert_eq!(g.entities[0].page_index, 0);
        assert_eq!(g.entities[0].constituent_element_ids.len(), 2);
    }

    #[test]
    fn conflicting_ids_are_not_merged_and_are_reported() {
        // One caption touching two differently numbered tables.
        let mut a = element("a", FigureKind::Table, 0, BBox::new(50.0, 100.0, 400.0, 100.0));
        a.explicit_id = Some("1".into());
        let mut b = element("b", FigureKind::Table, 0, BBox::new(50.0, 230.0, 400.0, 100.0));
        b.explicit_id = Some("2".into());
        let blocks = vec![caption("Table 1: Shared", 0, BBox::new(50.0, 205.0, 400.0, 20.0))];
        let g = run(&[a, b], &blocks);
        assert_eq!(g.entities.len(), 2);
        assert_eq!(g.conflicts.len(), 1);
        assert_eq!(g.conflicts[0].strategy, Strategy::Pattern);
        assert_eq!(g.conflicts[0].figure_ids, ("1".to_string(), "2".to_string()));
    }

    #[test]
    fn later_duplicates_are_renamed() {
        let mut entities = vec![
            FigureEntity {
                figure_id: "4".into(),
                kind: FigureKind::Figure,
                bbox: BBox::default(),
                caption_text: String::new(),
                page_index: 0,
                constituent_element_ids: vec!["x".into()],
                synthetic: false,
            };
            3
        ];
        entities[1].kind = FigureKind::Table;
        let renamed = enforce_unique_ids(&mut entities);
        assert_eq!(renamed, 1);
        assert_eq!(entities[0].figure_id, "4");
        assert_eq!(entities[1].figure_id, "4");
        assert_eq!(entities[2].figure_id, "4-dup-1");
        assert!(entities[2].synthetic);
    }

    #[test]
    fn ids_are_unique_per_kind_after_grouping() {
        let elements = vec![
            element("a", FigureKind::Figure, 0, BBox::new(50.0, 100.0, 200.0, 100.0)),
            element("b", FigureKind::Figure, 1, BBox::new(50.0, 100.0, 200.0, 100.0)),
            element("c", FigureKind::Table, 1, BBox::new(50.0, 400.0, 200.0, 100.0)),
        ];
        let blocks = vec![
            caption("Figure 1: a", 0, BBox::new(50.0, 210.0, 200.0, 20.0)),
            caption("Figure 2: b", 1, BBox::new(50.0, 210.0, 200.0, 20.0)),
            caption("Table 1: c", 1, BBox::new(50.0, 510.0, 200.0, 20.0)),
        ];
        let g = run(&elements, &blocks);
        let mut keys: Vec<_> = g.entities.iter().map(|e| (e.kind, e.figure_id.clone())).collect();
        let before = keys.len();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), before);
        assert_eq!(before, 3);
    }
}
