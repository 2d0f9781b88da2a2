//! Heuristic query classifier.
//!
//! Picks how many chunks to retrieve and how long an answer to ask for before
//! any collaborator is called. Trivial chatter skips retrieval entirely.

use serde::Serialize;

const TRIVIAL_QUERIES: &[&str] = &[
    "hello", "hi", "hey", "thanks", "thank you", "bye", "goodbye", "ok", "okay", "yes", "no",
    "help", "test",
];

const NARROW_MARKERS: &[&str] = &[
    "what is",
    "define",
    "who is",
    "when",
    "where",
    "yes or no",
    "true or false",
];

const BROAD_MARKERS: &[&str] = &[
    "list",
    "all",
    "every",
    "explain",
    "describe",
    "compare",
    "difference",
    "how many",
    "what are",
    "summarize",
    "overview",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ComplexityDecision {
    /// Chunks to retrieve; 0 skips retrieval
    pub top_k: usize,
    pub max_tokens: u32,
}

impl ComplexityDecision {
    pub const fn new(top_k: usize, max_tokens: u32) -> Self {
        Self { top_k, max_tokens }
    }
}

pub fn classify(query: &str) -> ComplexityDecision {
    let normalized = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let word_count = normalized.split(' ').filter(|w| !w.is_empty()).count();
    let char_count = normalized.chars().count();

    if TRIVIAL_QUERIES.contains(&normalized.as_str()) || (word_count == 1 && char_count < 10) {
        return ComplexityDecision::new(0, 32);
    }

    if word_count < 8 && NARROW_MARKERS.iter().any(|m| normalized.contains(m)) {
        return ComplexityDecision::new(2, 64);
    }

    if BROAD_MARKERS.iter().any(|m| normalized.contains(m)) || char_count > 100 || word_count > 15 {
        return ComplexityDecision::new(3, 128);
    }

    ComplexityDecision::new(3, 96)
}

/// Human label for a retrieval depth, echoed in stream `start` events
pub fn describe(top_k: usize) -> &'static str {
    match top_k {
        0 => "trivial (no context)",
        1..=3 => "simple",
        4..=5 => "medium",
        _ => "complex",
    }
}
