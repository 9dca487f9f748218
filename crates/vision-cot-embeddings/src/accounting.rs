//! Compression accounting over token counts.

use serde::Serialize;

/// How much a reasoning trace shrank when carried as soft tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompressionReport {
    pub original_tokens: usize,
    pub synthesized_tokens: usize,
    /// `original / synthesized`; 0 when nothing was synthesized.
    pub ratio: f64,
    /// Negative when the soft sequence is longer than the text.
    pub tokens_saved: i64,
    /// `tokens_saved / original * 100`; 0 for empty text.
    pub percentage_saved: f64,
}

/// Compare a text token count with a soft token count.
pub fn report(original_tokens: usize, synthesized_tokens: usize) -> CompressionReport {
    let ratio = if synthesized_tokens == 0 {
        0.0
    } else {
        original_tokens as f64 / synthesized_tokens as f64
    };
    let tokens_saved = original_tokens as i64 - synthesized_tokens as i64;
    let percentage_saved = if original_tokens == 0 {
        0.0
    } else {
        tokens_saved as f64 / original_tokens as f64 * 100.0
    };

    CompressionReport {
        original_tokens,
        synthesized_tokens,
        ratio,
        tokens_saved,
        percentage_saved,
    }
}

impl CompressionReport {
    /// One-line human summary.
    pub fn summary(&self) -> String {
        format!(
            "{} text tokens -> {} vision tokens ({:.2}x, {:.1}% saved)",
            self.original_tokens, self.synthesized_tokens, self.ratio, self.percentage_saved
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression() {
        let r = report(100, 25);
        assert_eq!(r.ratio, 4.0);
        assert_eq!(r.tokens_saved, 75);
        assert_eq!(r.percentage_saved, 75.0);
    }

    #[test]
    fn test_expansion_is_negative() {
        let r = report(4, 8);
        assert_eq!(r.tokens_saved, -4);
        assert_eq!(r.percentage_saved, -100.0);
        assert_eq!(r.ratio, 0.5);
    }

    #[test]
    fn test_zero_counts() {
        let r = report(10, 0);
        assert_eq!(r.ratio, 0.0);
        assert_eq!(r.tokens_saved, 10);
        let r = report(0, 0);
        assert_eq!(r.percentage_saved, 0.0);
    }

    #[test]
    fn test_summary_mentions_counts() {
        assert!(report(40, 10).summary().contains("40 text tokens -> 10"));
    }
}
