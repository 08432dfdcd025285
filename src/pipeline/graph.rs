//! Mapping graph: scored edges from mentions to entities.
//!
//! An edge exists only between a mention and an entity of the same kind.
//! Each edge carries its evidence and a score in `[0, 1]`:
//!
//! ```text
//! score = w_id · id_match + w_spatial · spatial + order_term     (clamped)
//!
//! id_match = 1 if the mention id equals a non-synthetic entity id, else 0
//! spatial  = 0.5 + 0.5 / (1 + vdist / vertical_scale)      same page
//!          = 0.5 / (1 + page_distance)                       other page
//! order    = +order_bonus     mention after the entity in reading order
//!          = 0                entity ahead, within forward_window_pages
//!          = -order_penalty   entity further ahead than that
//! ```
//!
//! Resolution takes, per mention, the highest-scoring edge at or above the
//! acceptance threshold. Ties go to the entity that comes first in reading
//! order. Because the threshold sits above every score an edge can reach
//! without an id match, a mention is never matched by the rules to an
//! entity with a different number.

use crate::config::ScoringWeights;
use crate::model::{FigureEntity, MentionResolution, ReferenceMention, ResolutionStatus, ResolvedBy};
use serde::Serialize;
use std::cmp::Ordering;
use tracing::debug;

/// Why an edge scored what it scored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EdgeEvidence {
    pub id_match: f32,
    pub type_match: bool,
    pub page_distance: usize,
    /// Vertical gap between the boxes; only meaningful on the same page.
    pub vertical_distance: f32,
    pub spatial_proximity: f32,
    /// +1 after the entity, 0 shortly before, -1 far before.
    pub order_proximity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MappingEdge {
    pub mention: usize,
    pub entity: usize,
    pub score: f32,
    pub evidence: EdgeEvidence,
}

/// All candidate edges of a document, indexed by mention.
#[derive(Debug, Clone, Default)]
pub struct MappingGraph {
    edges: Vec<MappingEdge>,
    by_mention: Vec<Vec<usize>>,
}

impl MappingGraph {
    pub fn build(
        mentions: &[ReferenceMention],
        entities: &[FigureEntity],
        weights: &ScoringWeights,
    ) -> Self {
        let mut edges = Vec::new();
        let mut by_mention = vec![Vec::new(); mentions.len()];
        for (m, mention) in mentions.iter().enumerate() {
            for (e, entity) in entities.iter().enumerate() {
                let Some(evidence) = evidence(mention, entity, weights) else {
                    continue;
                };
                by_mention[m].push(edges.len());
                edges.push(MappingEdge {
                    mention: m,
                    entity: e,
                    score: score(&evidence, weights),
                    evidence,
                });
            }
        }
        debug!(
            "Mapping graph: {} mentions, {} entities, {} edges",
            mentions.len(),
            entities.len(),
            edges.len()
        );
        Self { edges, by_mention }
    }

    pub fn edges(&self) -> &[MappingEdge] {
        &self.edges
    }

    pub fn edges_for(&self, mention: usize) -> impl Iterator<Item = &MappingEdge> + '_ {
        self.by_mention
            .get(mention)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }

    /// Edge from `mention` to `entity`, if the kinds allowed one.
    pub fn edge(&self, mention: usize, entity: usize) -> Option<&MappingEdge> {
        self.edges_for(mention).find(|e| e.entity == entity)
    }

    /// Edges of `mention`, best first, at most `limit`.
    pub fn ranked(&self, mention: usize, limit: usize) -> Vec<&MappingEdge> {
        let mut ranked: Vec<&MappingEdge> = self.edges_for(mention).collect();
        ranked.sort_by(|a, b| rank(a, b));
        ranked.truncate(limit);
        ranked
    }

    /// Best edge of `mention` scoring at least `threshold`.
    pub fn best(&self, mention: usize, threshold: f32) -> Option<&MappingEdge> {
        self.edges_for(mention)
            .filter(|e| e.score >= threshold)
            .min_by(|a, b| rank(a, b))
    }

    /// Resolve every mention with the rule-based scorer.
    pub fn resolve(&self, mention_count: usize, threshold: f32) -> Vec<MentionResolution> {
        (0..mention_count)
            .map(|m| match self.best(m, threshold) {
                Some(edge) => MentionResolution {
                    mention: m,
                    status: ResolutionStatus::Matched,
                    entity: Some(edge.entity),
                    score: edge.score,
                    resolved_by: Some(ResolvedBy::Rules),
                },
                None => MentionResolution::unmatched(m),
            })
            .collect()
    }
}

/// Higher score first, then lower entity index.
fn rank(a: &MappingEdge, b: &MappingEdge) -> Ordering {
    b.score.total_cmp(&a.score).then(a.entity.cmp(&b.entity))
}

/// Evidence for a mention/entity pair; `None` when the kinds differ.
pub fn evidence(
    mention: &ReferenceMention,
    entity: &FigureEntity,
    weights: &ScoringWeights,
) -> Option<EdgeEvidence> {
    if mention.kind != entity.kind {
        return None;
    }
    let id_match = match &mention.normalized_id {
        Some(id) if !entity.synthetic && *id == entity.figure_id => 1.0,
        _ => 0.0,
    };

    let page_distance = mention.page_index.abs_diff(entity.page_index);
    let vertical_distance = if page_distance == 0 {
        mention.bbox.vertical_gap(&entity.bbox)
    } else {
        0.0
    };
    let spatial_proximity = if page_distance == 0 {
        0.5 + 0.5 / (1.0 + vertical_distance / weights.vertical_scale)
    } else {
        0.5 / (1.0 + page_distance as f32)
    };

    let order_proximity = match mention.position().reading_cmp(&entity.position()) {
        Ordering::Greater => 1.0,
        _ if entity.page_index.saturating_sub(mention.page_index) > weights.forward_window_pages => -1.0,
        _ => 0.0,
    };

    Some(EdgeEvidence {
        id_match,
        type_match: true,
        page_distance,
        vertical_distance,
        spatial_proximity,
        order_proximity,
    })
}

pub fn score(evidence: &EdgeEvidence, weights: &ScoringWeights) -> f32 {
    let order = if evidence.order_proximity > 0.0 {
        weights.order_bonus * evidence.order_proximity
    } else {
        weights.order_penalty * evidence.order_proximity
    };
    (weights.id_match * evidence.id_match + weights.spatial * evidence.spatial_proximity + order)
        .clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BBox, FigureKind};

    fn mention(kind: FigureKind, id: &str, page: usize, y: f32) -> ReferenceMention {
        ReferenceMention {
            raw_text: format!("{kind} {id}"),
            kind,
            normalized_id: Some(id.to_string()),
            bbox: BBox::new(50.0, y, 40.0, 12.0),
            page_index: page,
            block_index: 0,
            span: (0, 0),
        }
    }

    fn entity(kind: FigureKind, id: &str, page: usize, y: f32) -> FigureEntity {
        FigureEntity {
            figure_id: id.to_string(),
            kind,
            bbox: BBox::new(50.0, y, 400.0, 200.0),
            caption_text: String::new(),
            page_index: page,
            constituent_element_ids: vec![format!("e-{id}")],
            synthetic: false,
        }
    }

    #[test]
    fn no_edges_across_kinds() {
        let mentions = vec![mention(FigureKind::Table, "1", 0, 100.0)];
        let entities = vec![entity(FigureKind::Figure, "1", 0, 300.0)];
        let graph = MappingGraph::build(&mentions, &entities, &ScoringWeights::default());
        assert!(graph.edges().is_empty());
        let res = graph.resolve(1, 0.5);
        assert_eq!(res[0].status, ResolutionStatus::NotMatched);
    }

    #[test]
    fn same_page_id_match_scores_high() {
        let mentions = vec![mention(FigureKind::Figure, "1", 0, 100.0)];
        let entities = vec![entity(FigureKind::Figure, "1", 0, 262.0)];
        let w = ScoringWeights::default();
        let graph = MappingGraph::build(&mentions, &entities, &w);
        let edge = graph.edge(0, 0).unwrap();
        // vdist 150: spatial = 0.5 + 0.5 / 1.75
        let expected = 0.70 + 0.20 * (0.5 + 0.5 / 1.75);
        assert!((edge.score - expected).abs() < 1e-5, "score {}", edge.score);
        assert_eq!(edge.evidence.order_proximity, 0.0);
    }

    #[test]
    fn order_bonus_and_far_forward_penalty() {
        let w = ScoringWeights::default();
        let after = mention(FigureKind::Figure, "1", 2, 100.0);
        let e = entity(FigureKind::Figure, "1", 0, 100.0);
        let ev = evidence(&after, &e, &w).unwrap();
        assert_eq!(ev.order_proximity, 1.0);
        assert_eq!(ev.page_distance, 2);

        let far_before = mention(FigureKind::Figure, "1", 0, 100.0);
        let far = entity(FigureKind::Figure, "1", 5, 100.0);
        let ev = evidence(&far_before, &far, &w).unwrap();
        assert_eq!(ev.order_proximity, -1.0);
        let s = score(&ev, &w);
        let expected = 0.70 + 0.20 * (0.5 / 6.0) - 0.15;
        assert!((s - expected).abs() < 1e-5);
    }

    #[test]
    fn synthetic_entities_never_match_by_id() {
        let mut e = entity(FigureKind::Figure, "figure-seq-1", 0, 300.0);
        e.synthetic = true;
        let m = mention(FigureKind::Figure, "figure-seq-1", 0, 100.0);
        let w = ScoringWeights::default();
        let ev = evidence(&m, &e, &w).unwrap();
        assert_eq!(ev.id_match, 0.0);
        assert!(score(&ev, &w) < w.acceptance_threshold);
    }

    #[test]
    fn wrong_id_never_clears_default_threshold() {
        let w = ScoringWeights::default();
        // Best case without id: same page, touching, mention after entity.
        let m = mention(FigureKind::Figure, "2", 0, 400.0);
        let e = entity(FigureKind::Figure, "1", 0, 100.0);
        let s = score(&evidence(&m, &e, &w).unwrap(), &w);
        assert!(s < w.acceptance_threshold, "score {s}");
    }

    #[test]
    fn ties_go_to_the_earlier_entity() {
        let mentions = vec![mention(FigureKind::Figure, "1", 1, 100.0)];
        // Same id, same score: one page before and one page after.
        let entities = vec![
            entity(FigureKind::Figure, "1", 0, 100.0),
            entity(FigureKind::Figure, "1", 2, 100.0),
        ];
        let w = ScoringWeights {
            order_bonus: 0.0,
            ..Default::default()
        };
        let graph = MappingGraph::build(&mentions, &entities, &w);
        let res = graph.resolve(1, w.acceptance_threshold);
        assert_eq!(res[0].entity, Some(0));
        assert_eq!(res[0].resolved_by, Some(ResolvedBy::Rules));
    }

    #[test]
    fn ranked_orders_by_score() {
        let mentions = vec![mention(FigureKind::Table, "3", 0, 100.0)];
        let entities = vec![
            entity(FigureKind::Table, "1", 3, 100.0),
            entity(FigureKind::Table, "2", 0, 300.0),
            entity(FigureKind::Table, "3", 1, 100.0),
        ];
        let graph = MappingGraph::build(&mentions, &entities, &ScoringWeights::default());
        let ranked: Vec<usize> = graph.ranked(0, 2).iter().map(|e| e.entity).collect();
        assert_eq!(ranked, vec![2, 1]);
    }
}
