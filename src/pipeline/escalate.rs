//! LLM escalation: settle mentions the rules left unmatched.
//!
//! For each unmatched mention that has at least one same-kind candidate,
//! a [`DisambiguationRequest`] is built from the mention text, the
//! surrounding blocks and the top-ranked candidates. Requests run
//! concurrently (`buffer_unordered`) and results are applied in mention
//! order, so the output does not depend on completion order.
//!
//! ## Retry strategy
//!
//! Every call runs under a timeout. Timeouts, transport failures,
//! malformed answers and answers naming an unknown candidate are all
//! retried with exponential backoff (`base_delay_ms * 2^(attempt-2)`,
//! capped at `max_delay_ms`). With 500 ms base and 3 attempts the waits
//! are 500 ms → 1 s. When the budget is spent the mention stays
//! `not_matched` and an [`EscalationError`] records why.
//!
//! A `{"chosen_id": null}` answer is a valid outcome and is not retried.
//!
//! ## Cancellation
//!
//! The [`CancelSignal`] is raced against every call and every backoff
//! sleep. A cancelled mention reports [`EscalationError::Cancelled`] and
//! keeps its rule-based resolution.

use crate::cancel::CancelSignal;
use crate::config::EscalationConfig;
use crate::disambiguator::{CandidateSummary, DisambiguationRequest, Disambiguator};
use crate::error::{DisambiguatorError, EscalationError};
use crate::model::{FigureEntity, MentionResolution, ReferenceMention, ResolutionStatus, ResolvedBy, TextBlock};
use crate::pipeline::graph::MappingGraph;
use crate::progress::ProgressCallback;
use crate::prompts::{self, CAPTION_EXCERPT_CHARS};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// Attempt budget and backoff for one mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first call included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Wait before `attempt` (1-based). Zero before the first attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(attempt - 2);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// One mention queued for the disambiguator.
#[derive(Debug, Clone)]
pub struct EscalationJob {
    pub mention: usize,
    pub request: DisambiguationRequest,
    /// `(candidate id, entity index)` in the order offered.
    pub candidates: Vec<(String, usize)>,
}

/// What escalation changed.
#[derive(Debug, Clone, Default)]
pub struct EscalationOutcome {
    /// Mentions sent to the disambiguator.
    pub escalated: usize,
    /// Mentions the disambiguator matched.
    pub resolved: usize,
    pub failures: Vec<EscalationError>,
    pub cancelled: bool,
}

/// Build jobs for every unmatched mention with same-kind candidates.
pub fn plan_escalation(
    graph: &MappingGraph,
    mentions: &[ReferenceMention],
    entities: &[FigureEntity],
    blocks: &[TextBlock],
    resolutions: &[MentionResolution],
    config: &EscalationConfig,
) -> Vec<EscalationJob> {
    resolutions
        .iter()
        .filter(|r| r.status == ResolutionStatus::NotMatched)
        .filter_map(|r| {
            let ranked = graph.ranked(r.mention, config.max_candidates);
            if ranked.is_empty() {
                return None;
            }
            let mention = &mentions[r.mention];
            let candidates: Vec<(String, usize)> = ranked
                .iter()
                .map(|edge| (entities[edge.entity].figure_id.clone(), edge.entity))
                .collect();
            let candidate_list = ranked
                .iter()
                .map(|edge| {
                    let entity = &entities[edge.entity];
                    CandidateSummary {
                        id: entity.figure_id.clone(),
                        kind: entity.kind,
                        caption_excerpt: prompts::excerpt(&entity.caption_text, CAPTION_EXCERPT_CHARS),
                    }
                })
                .collect();
            Some(EscalationJob {
                mention: r.mention,
                request: DisambiguationRequest {
                    mention_text: mention.raw_text.clone(),
                    context_window: context_window(blocks, mention, config),
                    candidate_list,
                },
                candidates,
            })
        })
        .collect()
}

/// Text of the mention's block plus up to `context_blocks` neighbours on
/// each side from the same page, cut to `context_chars` around the mention.
pub fn context_window(
    blocks: &[TextBlock],
    mention: &ReferenceMention,
    config: &EscalationConfig,
) -> String {
    let Some(own) = blocks.get(mention.block_index) else {
        return mention.raw_text.clone();
    };
    let lo = mention.block_index.saturating_sub(config.context_blocks);
    let hi = (mention.block_index + config.context_blocks).min(blocks.len().saturating_sub(1));

    let same_page = |b: &&TextBlock| b.page_index == mention.page_index;
    let before: Vec<&str> = blocks[lo..mention.block_index]
        .iter()
        .filter(same_page)
        .map(|b| b.text.trim())
        .collect();
    let after: Vec<&str> = blocks[mention.block_index + 1..=hi]
        .iter()
        .filter(same_page)
        .map(|b| b.text.trim())
        .collect();
    let before = before.join("\n");
    let after = after.join("\n");
    let own = own.text.as_str();

    let full_chars = before.chars().count() + own.chars().count() + after.chars().count() + 2;
    if full_chars <= config.context_chars {
        return [before.as_str(), own, after.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n");
    }

    // Centre the window on the mention within its own block.
    let own_chars: Vec<char> = own.chars().collect();
    let mention_at = own[..mention.span.0.min(own.len())].chars().count();
    let half = config.context_chars / 2;
    let start = mention_at.saturating_sub(half);
    let end = (start + config.context_chars).min(own_chars.len());
    let start = end.saturating_sub(config.context_chars).min(start);
    own_chars[start..end].iter().collect()
}

/// Run every job, update `resolutions` in place and report what changed.
pub async fn run_escalation(
    disambiguator: Arc<dyn Disambiguator>,
    jobs: Vec<EscalationJob>,
    graph: &MappingGraph,
    resolutions: &mut [MentionResolution],
    config: &EscalationConfig,
    cancel: &CancelSignal,
    progress: Option<&ProgressCallback>,
) -> EscalationOutcome {
    let mut outcome = EscalationOutcome {
        escalated: jobs.len(),
        ..Default::default()
    };
    if jobs.is_empty() {
        return outcome;
    }
    if let Some(cb) = progress {
        cb.on_escalation_start(jobs.len());
    }
    info!(
        "Escalating {} unmatched mentions to {} (concurrency {})",
        jobs.len(),
        disambiguator.name(),
        config.concurrency
    );

    let policy = config.retry_policy();
    let call_timeout = Duration::from_millis(config.timeout_ms);

    let mut results: Vec<(usize, Result<Option<usize>, EscalationError>)> =
        stream::iter(jobs.into_iter().map(|job| {
            let disambiguator = Arc::clone(&disambiguator);
            let cancel = cancel.clone();
            async move {
                let result = disambiguate_with_retry(&*disambiguator, &job, policy, call_timeout, &cancel).await;
                (job.mention, result)
            }
        }))
        .buffer_unordered(config.concurrency.max(1))
        .collect()
        .await;
    results.sort_by_key(|(mention, _)| *mention);

    for (mention, result) in results {
        let matched = match result {
            Ok(Some(entity)) => {
                let score = graph.edge(mention, entity).map_or(0.0, |e| e.score);
                resolutions[mention] = MentionResolution {
                    mention,
                    status: ResolutionStatus::Matched,
                    entity: Some(entity),
                    score,
                    resolved_by: Some(ResolvedBy::Disambiguator),
                };
                outcome.resolved += 1;
                true
            }
            Ok(None) => {
                debug!("Mention {}: disambiguator found no fitting candidate", mention);
                false
            }
            Err(e) => {
                if matches!(e, EscalationError::Cancelled { .. }) {
                    outcome.cancelled = true;
                } else {
                    warn!("{}", e);
                }
                outcome.failures.push(e);
                false
            }
        };
        if let Some(cb) = progress {
            cb.on_mention_escalated(mention, matched);
        }
    }

    info!(
        "Escalation finished: {}/{} resolved, {} failed",
        outcome.resolved,
        outcome.escalated,
        outcome.failures.len()
    );
    outcome
}

/// Why the last attempt failed.
enum LastFailure {
    Timeout,
    Transport(String),
    Malformed(String),
    Unknown(String),
}

/// Ask the disambiguator about one mention, retrying per `policy`.
///
/// `Ok(Some(entity))` is a match, `Ok(None)` a valid "no candidate fits".
pub async fn disambiguate_with_retry(
    disambiguator: &dyn Disambiguator,
    job: &EscalationJob,
    policy: RetryPolicy,
    call_timeout: Duration,
    cancel: &CancelSignal,
) -> Result<Option<usize>, EscalationError> {
    let mention = job.mention;
    let mut last = LastFailure::Timeout;

    for attempt in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(EscalationError::Cancelled { mention });
        }
        let backoff = policy.delay_before(attempt);
        if !backoff.is_zero() {
            warn!(
                "Mention {}: retry {}/{} after {}ms",
                mention,
                attempt - 1,
                policy.max_attempts - 1,
                backoff.as_millis()
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(EscalationError::Cancelled { mention }),
                _ = sleep(backoff) => {}
            }
        }

        let call = timeout(call_timeout, disambiguator.disambiguate(&job.request));
        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EscalationError::Cancelled { mention }),
            answer = call => answer,
        };

        last = match answer {
            Err(_) => LastFailure::Timeout,
            Ok(Err(DisambiguatorError::Transport(detail))) => LastFailure::Transport(detail),
            Ok(Err(DisambiguatorError::MalformedResponse(detail))) => LastFailure::Malformed(detail),
            Ok(Ok(response)) => match response.chosen_id {
                None => return Ok(None),
                Some(chosen) => match job.candidates.iter().find(|(id, _)| *id == chosen) {
                    Some(&(_, entity)) => return Ok(Some(entity)),
                    None => LastFailure::Unknown(chosen),
                },
            },
        };
        match &last {
            LastFailure::Timeout => warn!(
                "Mention {}: attempt {} timed out after {}ms",
                mention,
                attempt,
                call_timeout.as_millis()
            ),
            LastFailure::Transport(d) | LastFailure::Malformed(d) => {
                warn!("Mention {}: attempt {} failed: {}", mention, attempt, d)
            }
            LastFailure::Unknown(id) => warn!(
                "Mention {}: attempt {} chose unknown candidate '{}'",
                mention, attempt, id
            ),
        }
    }

    let attempts = policy.max_attempts;
    Err(match last {
        LastFailure::Timeout => EscalationError::Timeout {
            mention,
            attempts,
            timeout_ms: call_timeout.as_millis() as u64,
        },
        LastFailure::Transport(detail) => EscalationError::Transport {
            mention,
            attempts,
            detail,
        },
        LastFailure::Malformed(detail) => EscalationError::MalformedResponse {
            mention,
            attempts,
            detail,
        },
        LastFailure::Unknown(chosen) => EscalationError::UnknownCandidate {
            mention,
            attempts,
            chosen,
        },
    })
}
