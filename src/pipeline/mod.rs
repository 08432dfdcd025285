//! Pipeline stages for reference-to-figure mapping.
//!
//! Each submodule implements exactly one transformation step.
//! Keeping stages separate makes each independently testable and lets the
//! rule-based stages run without any network or LLM dependency.
//!
//! ## Data Flow
//!
//! ```text
//!            ┌──▶ extract ──────────────┐
//! input ─────┤                          ├──▶ graph ──▶ escalate
//! (path/URL) └──▶ identify ──▶ group ───┘   (score)    (LLM, optional)
//! ```
//!
//! 1. [`input`]    : load the layout JSON from a path or URL
//! 2. [`extract`]  : find "Fig. 3"-style mentions in text blocks
//! 3. [`identify`] : give every layout element a number
//! 4. [`group`]    : merge elements into logical figures; enforce unique ids
//! 5. [`graph`]    : score mention → figure edges and resolve by rules
//! 6. [`escalate`] : ask the disambiguator about what the rules left open
//!
//! Extraction and identify+group are independent CPU-bound passes; the
//! orchestrator runs them side by side on the blocking pool.

pub mod escalate;
pub mod extract;
pub mod graph;
pub mod group;
pub mod identify;
pub mod input;
