//! Prompts for LLM-based reference disambiguation.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: the answer contract (`{"chosen_id": ...}`)
//!    is stated in exactly one place, next to the renderer that fills it in.
//!
//! 2. **Testability**: unit tests can render a request and inspect it
//!    without a live model, so prompt regressions are easy to catch.
//!
//! Callers can override the system prompt via
//! [`crate::config::EscalationConfig::system_prompt`]; the constant here is
//! used only when no override is provided.

use crate::disambiguator::DisambiguationRequest;
use std::fmt::Write;

/// Default system prompt for choosing the target of an ambiguous reference.
pub const DEFAULT_DISAMBIGUATION_PROMPT: &str = r#"You resolve cross-references in scientific documents.

You receive:
- a reference exactly as it appears in the text (for example "Fig. 3" or "(12)")
- the text surrounding that reference
- a numbered list of candidate figures, tables, equations, algorithms or examples, each with its id and caption

Decide which single candidate the reference points to.

Rules:
1. Choose only from the listed candidate ids.
2. Prefer the candidate whose caption matches what the surrounding text says about it.
3. If no candidate fits, answer null.

Answer with JSON only, no commentary and no code fences:
{"chosen_id": "<candidate id>"}
or
{"chosen_id": null}"#;

/// Most characters of a caption shown per candidate.
pub const CAPTION_EXCERPT_CHARS: usize = 200;

/// Render the user message for one disambiguation request.
pub fn render_request(request: &DisambiguationRequest) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Reference: \"{}\"", request.mention_text);
    let _ = writeln!(out);
    let _ = writeln!(out, "Context:");
    let _ = writeln!(out, "\"\"\"");
    let _ = writeln!(out, "{}", request.context_window.trim());
    let _ = writeln!(out, "\"\"\"");
    let _ = writeln!(out);
    let _ = writeln!(out, "Candidates:");
    for (n, candidate) in request.candidate_list.iter().enumerate() {
        let caption = if candidate.caption_excerpt.is_empty() {
            "(no caption)"
        } else {
            candidate.caption_excerpt.as_str()
        };
        let _ = writeln!(
            out,
            "{}. id={} ({}): {}",
            n + 1,
            candidate.id,
            candidate.kind,
            caption
        );
    }
    out
}

/// Shorten `text` to at most `max_chars` characters on a char boundary,
/// marking the cut with an ellipsis.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disambiguator::CandidateSummary;
    use crate::model::FigureKind;

    #[test]
    fn default_prompt_states_the_answer_contract() {
        assert!(DEFAULT_DISAMBIGUATION_PROMPT.contains(r#"{"chosen_id": null}"#));
        assert!(DEFAULT_DISAMBIGUATION_PROMPT.contains("Choose only from the listed candidate ids"));
    }

    #[test]
    fn request_lists_every_candidate() {
        let request = DisambiguationRequest {
            mention_text: "Fig. 3".into(),
            context_window: "As Fig. 3 shows, accuracy rises.".into(),
            candidate_list: vec![
                CandidateSummary {
                    id: "3".into(),
                    kind: FigureKind::Figure,
                    caption_excerpt: "Figure 3: Accuracy".into(),
                },
                CandidateSummary {
                    id: "figure-seq-2".into(),
                    kind: FigureKind::Figure,
                    caption_excerpt: String::new(),
                },
            ],
        };
        let text = render_request(&request);
        assert!(text.contains("Reference: \"Fig. 3\""));
        assert!(text.contains("1. id=3 (figure): Figure 3: Accuracy"));
        assert!(text.contains("2. id=figure-seq-2 (figure): (no caption)"));
        assert!(text.contains("accuracy rises"));
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("short", 10), "short");
        let cut = excerpt("αβγδεζηθ", 4);
        assert_eq!(cut, "αβγ…");
        assert_eq!(cut.chars().count(), 4);
    }
}
