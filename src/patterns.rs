//! Reference pattern lexicon.
//!
//! One [`PatternDescriptor`] per [`FigureKind`] lists the trigger words that
//! introduce a reference ("Fig.", "Table", "Eq.", ...). From those, three
//! regex families are compiled once:
//!
//! * **mention** patterns: trigger + one or more identifiers with list and
//!   range separators (`Figs. 2, 3 and 5`, `Tables 1-3`).
//! * **caption** patterns: the same triggers anchored at the start of a
//!   block (`Figure 3: Overview ...`).
//! * **bare equation** pattern: a standalone `(n)`.
//!
//! Identifier grammar: optional uppercase appendix letter, dotted integer
//! segments, optional lowercase suffix (`A1`, `2.3`, `3b`). Normalisation
//! trims leading zeros from every segment and drops the suffix for every
//! kind except equations, where `(3a)` is a distinct equation rather than a
//! sub-panel.

use crate::model::FigureKind;
use once_cell::sync::Lazy;
use regex::Regex;

/// Trigger lexicon for one kind.
#[derive(Debug)]
pub struct PatternDescriptor {
    pub kind: FigureKind,
    /// Regex alternatives, longest first. Matched case-insensitively.
    pub triggers: &'static [&'static str],
    /// Whether a trailing lowercase letter is part of the identity.
    pub keep_suffix: bool,
}

pub static DESCRIPTORS: [PatternDescriptor; 5] = [
    PatternDescriptor {
        kind: FigureKind::Figure,
        triggers: &[r"Figures?", r"Figs?\.?"],
        keep_suffix: false,
    },
    PatternDescriptor {
        kind: FigureKind::Table,
        triggers: &[r"Tables?", r"Tabs?\."],
        keep_suffix: false,
    },
    PatternDescriptor {
        kind: FigureKind::Equation,
        triggers: &[r"Equations?", r"Eqns?\.?", r"Eqs?\.?"],
        keep_suffix: true,
    },
    PatternDescriptor {
        kind: FigureKind::Algorithm,
        triggers: &[r"Algorithms?", r"Algs?\."],
        keep_suffix: false,
    },
    PatternDescriptor {
        kind: FigureKind::Example,
        triggers: &[r"Examples?", r"Exs?\."],
        keep_suffix: false,
    },
];

/// One identifier token: appendix letter, dotted number and suffix letter,
/// optionally wrapped in parentheses.
const ITEM: &str = r"(?:\([A-Z]?\d+(?:\.\d+)*[a-z]?\)|[A-Z]?\d+(?:\.\d+)*[a-z]?)";

/// Separators allowed between identifiers of one mention.
const SEPARATOR: &str = r"\s*(?:,\s*(?:and\s+|&\s*)?|;|\band\b|&|\bto\b|-|–|—)\s*";

static ITEM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(ITEM).unwrap());

static ID_PARTS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z]?)(\d+(?:\.\d+)*)([a-z]?)$").unwrap());

static BARE_EQUATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d+(?:\.\d+)*[a-z]?)\)").unwrap());

static EQUATION_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(([A-Z]?\d+(?:\.\d+)*[a-z]?)\)\s*[.,;]?\s*$").unwrap());

/// Compiled regexes for one kind.
#[derive(Debug)]
pub struct CompiledPattern {
    pub descriptor: &'static PatternDescriptor,
    /// Trigger followed by an identifier list; group `ids` spans the list.
    pub mention: Regex,
    /// Trigger + single identifier anchored at the start of a block.
    pub caption: Regex,
}

static COMPILED: Lazy<Vec<CompiledPattern>> = Lazy::new(|| {
    DESCRIPTORS
        .iter()
        .map(|d| {
            let triggers = d.triggers.join("|");
            let mention = format!(
                r"\b(?i:{triggers})\s*(?P<ids>{ITEM}(?:{SEPARATOR}{ITEM})*)"
            );
            let caption = format!(
                r"^\s*(?i:{triggers})\s*(?P<id>{ITEM})(?:\s*[:.|–—-]|\s|$)"
            );
            CompiledPattern {
                descriptor: d,
                mention: Regex::new(&mention).unwrap(),
                caption: Regex::new(&caption).unwrap(),
            }
        })
        .collect()
});

/// All compiled patterns, in [`FigureKind::ALL`] order.
pub fn compiled() -> &'static [CompiledPattern] {
    &COMPILED
}

pub fn descriptor(kind: FigureKind) -> &'static PatternDescriptor {
    &DESCRIPTORS[kind.slot()]
}

/// Canonical form of an identifier token, or `None` if it does not follow
/// the identifier grammar.
///
/// `"(03)"` → `"3"`, `"2.01"` → `"2.1"`, figure `"3b"` → `"3"`, equation
/// `"3b"` → `"3b"`.
pub fn normalize_id(kind: FigureKind, raw: &str) -> Option<String> {
    let token = raw
        .trim()
        .trim_matches(|c: char| c == '(' || c == ')')
        .trim_end_matches(['.', ':', ','])
        .trim();
    let caps = ID_PARTS_RE.captures(token)?;
    let prefix = caps.get(1).map_or("", |m| m.as_str());
    let number = caps
        .get(2)?
        .as_str()
        .split('.')
        .map(|seg| {
            let trimmed = seg.trim_start_matches('0');
            if trimmed.is_empty() {
                "0"
            } else {
                trimmed
            }
        })
        .collect::<Vec<_>>()
        .join(".");
    let suffix = if descriptor(kind).keep_suffix {
        caps.get(3).map_or("", |m| m.as_str())
    } else {
        ""
    };
    Some(format!("{prefix}{number}{suffix}"))
}

/// Identifier declared by a caption-like text, e.g. `"Figure 3: ..."` → `"3"`.
pub fn caption_id(kind: FigureKind, text: &str) -> Option<String> {
    let pattern = &compiled()[kind.slot()];
    let caps = pattern.caption.captures(text)?;
    normalize_id(kind, caps.name("id")?.as_str())
}

/// Kind and identifier of a caption-like text, checked against every kind.
pub fn caption_kind(text: &str) -> Option<(FigureKind, String)> {
    FigureKind::ALL
        .iter()
        .find_map(|&kind| caption_id(kind, text).map(|id| (kind, id)))
}

/// Trailing equation tag, e.g. `"E = mc^2  (4)"` → `"4"`.
pub fn equation_tag(text: &str) -> Option<String> {
    let caps = EQUATION_TAG_RE.captures(text)?;
    normalize_id(FigureKind::Equation, caps.get(1)?.as_str())
}

/// One identifier pulled out of a mention's identifier list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedId {
    pub id: String,
    /// `true` when produced by range expansion rather than written out.
    pub expanded: bool,
}

/// Split the `ids` group of a mention match into normalised identifiers.
///
/// Lists keep every item. A range between two plain integers is expanded
/// when its span is at most `max_range_span`; otherwise only the endpoints
/// are kept.
pub fn split_id_list(kind: FigureKind, ids: &str, max_range_span: u32) -> Vec<ListedId> {
    let items: Vec<_> = ITEM_RE.find_iter(ids).collect();
    let mut out: Vec<ListedId> = Vec::with_capacity(items.len());

    for (i, item) in items.iter().enumerate() {
        let Some(id) = normalize_id(kind, item.as_str()) else {
            continue;
        };
        if i > 0 {
            let between = ids[items[i - 1].end()..item.start()].trim();
            let is_range = matches!(between, "-" | "–" | "—") || between.eq_ignore_ascii_case("to");
            if is_range {
                if let Some(prev) = out.last().map(|l| l.id.clone()) {
                    expand_range(&prev, &id, max_range_span, &mut out);
                }
            }
        }
        if !out.iter().any(|l| l.id == id) {
            out.push(ListedId {
                id,
                expanded: false,
            });
        }
    }
    out
}

fn expand_range(start: &str, end: &str, max_span: u32, out: &mut Vec<ListedId>) {
    let (Ok(lo), Ok(hi)) = (start.parse::<u32>(), end.parse::<u32>()) else {
        return;
    };
    if hi <= lo || hi - lo > max_span {
        return;
    }
    for n in lo + 1..hi {
        out.push(ListedId {
            id: n.to_string(),
            expanded: true,
        });
    }
}

/// A standalone `(n)` that may be an equation reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BareEquation {
    pub id: String,
    pub start: usize,
    pub end: usize,
}

/// Strictly formatted `(n)` tokens: not glued to letters or other brackets
/// and with a leading number below 1000 (so years are ignored).
pub fn bare_equations(text: &str) -> Vec<BareEquation> {
    BARE_EQUATION_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let before = text[..whole.start()].chars().next_back();
            let after = text[whole.end()..].chars().next();
            let glued = |c: Option<char>| c.is_some_and(|c| c.is_alphanumeric() || c == '(' || c == ')');
            if glued(before) || glued(after) {
                return None;
            }
            let inner = caps.get(1)?.as_str();
            let lead: u32 = inner
                .split(|c: char| !c.is_ascii_digit())
                .next()?
                .parse()
                .ok()?;
            if lead >= 1000 {
                return None;
            }
            Some(BareEquation {
                id: normalize_id(FigureKind::Equation, inner)?,
                start: whole.start(),
                end: whole.end(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(kind: FigureKind, text: &str) -> Vec<String> {
        let pattern = &compiled()[kind.slot()];
        pattern
            .mention
            .captures_iter(text)
            .flat_map(|c| split_id_list(kind, c.name("ids").unwrap().as_str(), 10))
            .map(|l| l.id)
            .collect()
    }

    #[test]
    fn normalises_leading_zeros_and_brackets() {
        assert_eq!(normalize_id(FigureKind::Figure, "(03)").as_deref(), Some("3"));
        assert_eq!(normalize_id(FigureKind::Table, "2.01").as_deref(), Some("2.1"));
        assert_eq!(normalize_id(FigureKind::Table, "A1").as_deref(), Some("A1"));
        assert_eq!(normalize_id(FigureKind::Figure, "0").as_deref(), Some("0"));
        assert_eq!(normalize_id(FigureKind::Figure, "three"), None);
    }

    #[test]
    fn panel_suffix_dropped_except_for_equations() {
        assert_eq!(normalize_id(FigureKind::Figure, "3b").as_deref(), Some("3"));
        assert_eq!(normalize_id(FigureKind::Equation, "3b").as_deref(), Some("3b"));
    }

    #[test]
    fn matches_trigger_variants() {
        assert_eq!(ids(FigureKind::Figure, "see Fig. 1"), vec!["1"]);
        assert_eq!(ids(FigureKind::Figure, "see Figure 12"), vec!["12"]);
        assert_eq!(ids(FigureKind::Figure, "see fig 4"), vec!["4"]);
        assert_eq!(ids(FigureKind::Table, "in Tab. 2"), vec!["2"]);
        assert_eq!(ids(FigureKind::Equation, "from Eq. (7)"), vec!["7"]);
        assert_eq!(ids(FigureKind::Algorithm, "Alg. 2 runs"), vec!["2"]);
        assert_eq!(ids(FigureKind::Example, "as Example 5 shows"), vec!["5"]);
    }

    #[test]
    fn ignores_words_that_only_start_like_triggers() {
        assert!(ids(FigureKind::Figure, "we figured 3 out").is_empty());
        assert!(ids(FigureKind::Equation, "Equal 3 parts").is_empty());
        assert!(ids(FigureKind::Table, "the tablet 4").is_empty());
    }

    #[test]
    fn expands_lists_and_ranges() {
        assert_eq!(ids(FigureKind::Figure, "Figs. 2, 3 and 5"), vec!["2", "3", "5"]);
        assert_eq!(ids(FigureKind::Table, "Tables 1-3"), vec!["1", "2", "3"]);
        assert_eq!(ids(FigureKind::Figure, "Figures 4 to 6"), vec!["4", "5", "6"]);
        assert_eq!(ids(FigureKind::Equation, "Eqs. (2)–(4)"), vec!["2", "3", "4"]);
    }

    #[test]
    fn oversized_ranges_keep_endpoints() {
        assert_eq!(ids(FigureKind::Figure, "Figs. 1-40"), vec!["1", "40"]);
    }

    #[test]
    fn caption_ids() {
        assert_eq!(caption_id(FigureKind::Figure, "Figure 3: Overview").as_deref(), Some("3"));
        assert_eq!(caption_id(FigureKind::Table, "TABLE 2. Results").as_deref(), Some("2"));
        assert_eq!(caption_id(FigureKind::Figure, "Fig. 4b shows"), Some("4".to_string()));
        assert_eq!(caption_id(FigureKind::Figure, "As in Figure 3"), None);
        assert_eq!(
            caption_kind("Algorithm 1: Greedy search"),
            Some((FigureKind::Algorithm, "1".to_string()))
        );
    }

    #[test]
    fn equation_tags() {
        assert_eq!(equation_tag("E = mc^2   (4)").as_deref(), Some("4"));
        assert_eq!(equation_tag("x + y = z (2.1)."), Some("2.1".to_string()));
        assert_eq!(equation_tag("f(x) = y"), None);
    }

    #[test]
    fn bare_equations_are_strict() {
        let found = bare_equations("as shown in (3), and also (12a).");
        let found: Vec<_> = found.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(found, vec!["3", "12a"]);
        assert!(bare_equations("published (2019)").is_empty());
        assert!(bare_equations("f(3) is defined").is_empty());
        assert!(bare_equations("((3))").is_empty());
    }
}
