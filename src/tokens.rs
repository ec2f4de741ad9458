//! Token Accountant: estimates tokens and cost for a request
//! before it is made, and supplies the paragraph/sentence splitting policy.

use serde::Serialize;

/// Per-million-token pricing for a model. Models with zero unit cost surface
/// zero (local/proxy models).
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelCost {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct TokenLimits {
    pub context_length: u64,
    /// Default 0.9.
    pub safety_margin: f64,
}

impl Default for TokenLimits {
    fn default() -> Self {
        TokenLimits {
            context_length: 128_000,
            safety_margin: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TokenEstimate {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total: u64,
    pub estimated_cost: f64,
    pub will_exceed_limit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_splits: Option<u64>,
}

/// `ceil(chars/4)` and `ceil(words * 1.3)`, take the larger.
fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as f64;
    let words = text.split_whitespace().count() as f64;
    let by_chars = (chars / 4.0).ceil();
    let by_words = (words * 1.3).ceil();
    by_chars.max(by_words) as u64
}

pub fn estimate(
    input_text: &str,
    expected_output_tokens: u64,
    cost: ModelCost,
    limits: TokenLimits,
) -> TokenEstimate {
    let input_tokens = estimate_tokens(input_text);
    let output_tokens = expected_output_tokens;
    let total = input_tokens + output_tokens;

    let estimated_cost = (input_tokens as f64 / 1_000_000.0) * cost.input_per_million
        + (output_tokens as f64 / 1_000_000.0) * cost.output_per_million;

    let budget = (limits.context_length as f64 * limits.safety_margin).floor() as u64;
    let will_exceed_limit = total > budget;
    let suggested_splits = if will_exceed_limit && budget > 0 {
        Some((total as f64 / budget as f64).ceil() as u64)
    } else {
        None
    };

    TokenEstimate {
        input_tokens,
        output_tokens,
        total,
        estimated_cost,
        will_exceed_limit,
        suggested_splits,
    }
}

const CHUNK_OVERLAP_CHARS: usize = 500;

/// Split `text` on paragraph boundaries to fit `max_chars_per_chunk`; if a
/// single paragraph still exceeds the budget, fall back to sentence
/// boundaries within it. Adjacent chunks carry ~500 characters of overlap.
pub fn split_for_budget(text: &str, max_chars_per_chunk: usize) -> Vec<String> {
    if text.len() <= max_chars_per_chunk {
        return vec![text.to_string()];
    }

    let mut units: Vec<&str> = Vec::new();
    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if paragraph.len() <= max_chars_per_chunk {
            units.push(paragraph);
        } else {
            units.extend(split_sentences(paragraph));
        }
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for unit in units {
        let joiner = if current.is_empty() { "" } else { "\n\n" };
        if !current.is_empty() && current.len() + joiner.len() + unit.len() > max_chars_per_chunk {
            let overlap_start = current.len().saturating_sub(CHUNK_OVERLAP_CHARS);
            let overlap = current[overlap_start..].to_string();
            chunks.push(std::mem::take(&mut current));
            current = overlap;
            current.push_str(joiner);
            current.push_str(unit);
        } else {
            current.push_str(joiner);
            current.push_str(unit);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let bytes = paragraph.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?') {
            let end = (i + 1).min(bytes.len());
            let slice = paragraph[start..end].trim();
            if !slice.is_empty() {
                out.push(slice);
            }
            start = end;
        }
    }
    if start < paragraph.len() {
        let slice = paragraph[start..].trim();
        if !slice.is_empty() {
            out.push(slice);
        }
    }
    if out.is_empty() {
        vec![paragraph]
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_takes_larger_of_two_heuristics() {
        // Dense text: char-based estimate dominates.
        let dense = "x".repeat(400);
        let est = estimate(&dense, 0, ModelCost::default(), TokenLimits::default());
        assert_eq!(est.input_tokens, 100);
    }

    #[test]
    fn estimate_word_heuristic_can_dominate() {
        let wordy = (0..100).map(|_| "a ").collect::<String>();
        let est = estimate(&wordy, 0, ModelCost::default(), TokenLimits::default());
        // 100 words * 1.3 = 130 > chars/4
        assert_eq!(est.input_tokens, 130);
    }

    #[test]
    fn zero_cost_model_is_free() {
        let est = estimate("hello world", 10, ModelCost::default(), TokenLimits::default());
        assert_eq!(est.estimated_cost, 0.0);
    }

    #[test]
    fn exceeding_limit_suggests_splits() {
        let limits = TokenLimits {
            context_length: 100,
            safety_margin: 0.9,
        };
        let text = "word ".repeat(200);
        let est = estimate(&text, 0, ModelCost::default(), limits);
        assert!(est.will_exceed_limit);
        assert!(est.suggested_splits.unwrap() >= 2);
    }

    #[test]
    fn split_respects_budget_and_overlaps() {
        let text = format!("{}\n\n{}\n\n{}", "a".repeat(300), "b".repeat(300), "c".repeat(300));
        let chunks = split_for_budget(&text, 400);
        assert!(chunks.len() > 1);
        for w in chunks.windows(2) {
            assert!(w[1].starts_with(&w[0][w[0].len().saturating_sub(CHUNK_OVERLAP_CHARS)..]));
        }
    }

    #[test]
    fn split_falls_back_to_sentences_for_oversized_paragraph() {
        let long_paragraph = "Sentence one. Sentence two! Sentence three? ".repeat(20);
        let chunks = split_for_budget(&long_paragraph, 100);
        assert!(chunks.len() > 1);
    }

    #[test]
    fn short_text_is_single_chunk() {
        let chunks = split_for_budget("short", 1000);
        assert_eq!(chunks, vec!["short".to_string()]);
    }
}
