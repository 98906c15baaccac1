//! The response guard: a two-layer filter that stops an agent reply from
//! echoing its own meta-instructions or leaking its protected system prompt.
//! Grounded on `response_guard.py`, translated near 1:1.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

pub const GUARD_KEYWORD_SENTENCE: &str =
    "Let us turn our attention to what truly matters - your wellbeing. What challenges are you facing?";
pub const GUARD_NGRAM_SENTENCE: &str =
    "I'd rather focus on what brings you here today. What's weighing on your mind?";

const DEFAULT_NGRAM_SIZE: usize = 5;
const DEFAULT_THRESHOLD: f64 = 0.3;

static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"psych[_ ]?update",
        r"detected[_ ]?patterns",
        r"emotional[_ ]?state",
        r"confidence\s+(score|float|0\.\d)",
        r"json\s+object\s+containing",
        r"system[_ ]?(prompt|message|instruction)",
        r"persona[_ ]?directive",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static guard pattern is valid regex"))
    .collect()
});

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").expect("static regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));
static SENTENCE_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?\n]").expect("static regex"));

fn normalize(text: &str) -> String {
    let lower = text.to_lowercase();
    let stripped = NON_WORD.replace_all(&lower, " ");
    WHITESPACE.replace_all(&stripped, " ").trim().to_string()
}

fn ngrams(text: &str, k: usize) -> HashSet<Vec<String>> {
    let words: Vec<String> = normalize(text).split(' ').filter(|w| !w.is_empty()).map(String::from).collect();
    if words.len() < k {
        return HashSet::new();
    }
    (0..=words.len() - k)
        .map(|i| words[i..i + k].to_vec())
        .collect()
}

fn contains_sensitive_keywords(response: &str) -> bool {
    let lower = response.to_lowercase();
    SENSITIVE_PATTERNS.iter().any(|re| re.is_match(&lower))
}

/// Precomputes the protected string's n-gram set once, then checks responses
/// against it cheaply.
pub struct ResponseGuard {
    protected_ngrams: HashSet<Vec<String>>,
    ngram_size: usize,
    threshold: f64,
}

impl ResponseGuard {
    pub fn new(protected_text: &str) -> Self {
        Self::with_params(protected_text, DEFAULT_NGRAM_SIZE, DEFAULT_THRESHOLD)
    }

    pub fn with_params(protected_text: &str, ngram_size: usize, threshold: f64) -> Self {
        Self {
            protected_ngrams: ngrams(protected_text, ngram_size),
            ngram_size,
            threshold,
        }
    }

    fn sentence_overlap(&self, sentence: &str) -> f64 {
        let sentence_ngrams = ngrams(sentence, self.ngram_size);
        if sentence_ngrams.is_empty() || self.protected_ngrams.is_empty() {
            return 0.0;
        }
        let overlap = sentence_ngrams.intersection(&self.protected_ngrams).count();
        overlap as f64 / sentence_ngrams.len() as f64
    }

    /// Returns `(leaked, offending_sentence)`.
    pub fn check_leakage(&self, response: &str) -> (bool, Option<String>) {
        for sentence in SENTENCE_SPLIT.split(response) {
            let sentence = sentence.trim();
            if sentence.split_whitespace().count() < self.ngram_size {
                continue;
            }
            if self.sentence_overlap(sentence) >= self.threshold {
                return (true, Some(sentence.to_string()));
            }
        }
        (false, None)
    }
}

/// Runs the two-layer guard: keyword scan first (its own fixed sentence), then
/// n-gram containment against `protected_prompt` (a second, distinct fixed
/// sentence). Returns `(output, blocked)`. Idempotent: guarding an already
/// safe sentence returns it unchanged and `blocked=false`.
pub fn guard_response(response: &str, protected_prompt: &str) -> (String, bool) {
    if contains_sensitive_keywords(response) {
        return (GUARD_KEYWORD_SENTENCE.to_string(), true);
    }

    let guard = ResponseGuard::new(protected_prompt);
    let (leaked, _) = guard.check_leakage(response);
    if leaked {
        return (GUARD_NGRAM_SENTENCE.to_string(), true);
    }

    (response.to_string(), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_scan_blocks_meta_instruction_echo() {
        let (out, blocked) = guard_response(
            "Here is my psych_update for this turn: detected_patterns are rumination.",
            "you are a wise stoic advisor",
        );
        assert!(blocked);
        assert_eq!(out, GUARD_KEYWORD_SENTENCE);
    }

    #[test]
    fn ngram_overlap_blocks_prompt_echo() {
        let protected = "You are the emperor's inner voice, a calm and measured stoic philosopher guiding the user toward virtue and tranquility.";
        let response = "You are the emperor's inner voice, a calm and measured stoic philosopher guiding the user toward virtue and tranquility, and I am happy to help.";
        let (out, blocked) = guard_response(response, protected);
        assert!(blocked);
        assert_eq!(out, GUARD_NGRAM_SENTENCE);
    }

    #[test]
    fn clean_response_passes_through() {
        let (out, blocked) = guard_response(
            "It sounds like today has been difficult. What's on your mind?",
            "you are a wise stoic advisor",
        );
        assert!(!blocked);
        assert_eq!(out, "It sounds like today has been difficult. What's on your mind?");
    }

    #[test]
    fn guard_is_idempotent() {
        let protected = "protected system prompt text goes here for this test case only";
        let response = "a perfectly ordinary reply with no overlap at all";
        let (first, _) = guard_response(response, protected);
        let (second, _) = guard_response(&first, protected);
        assert_eq!(first, second);
    }
}
