//! Bilingual token estimation for budget math.
//!
//! Hangul is much denser per token than Latin text, so the heuristic
//! counts it separately: `ceil(1.5 * hangul + other / 4)`. Only used for
//! budgeting; ±15% is fine.

use crate::traits::Message;

/// Code points in the Hangul Jamo and Syllable blocks.
fn is_hangul(c: char) -> bool {
    matches!(
        c as u32,
        0x1100..=0x11FF      // Jamo
        | 0x3130..=0x318F    // Compatibility Jamo
        | 0xA960..=0xA97F    // Jamo Extended-A
        | 0xAC00..=0xD7A3    // Syllables
        | 0xD7B0..=0xD7FF    // Jamo Extended-B
    )
}

pub fn estimate(text: &str) -> usize {
    let mut hangul = 0usize;
    let mut other = 0usize;
    for c in text.chars() {
        if is_hangul(c) {
            hangul += 1;
        } else {
            other += 1;
        }
    }
    (1.5 * hangul as f64 + other as f64 / 4.0).ceil() as usize
}

/// Per-message overhead covers role markers and separators.
pub fn estimate_messages(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| estimate(&m.content_as_text()) + 4)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(estimate(""), 0);
    }

    #[test]
    fn latin_text_counts_quarters() {
        // 8 chars / 4 = 2
        assert_eq!(estimate("abcdefgh"), 2);
        // 9 chars -> ceil(2.25) = 3
        assert_eq!(estimate("abcdefghi"), 3);
    }

    #[test]
    fn hangul_counts_one_and_a_half() {
        // 2 syllables -> ceil(3.0) = 3
        assert_eq!(estimate("안녕"), 3);
        // mixed: 2 hangul + 4 latin -> ceil(3 + 1) = 4
        assert_eq!(estimate("안녕 hi!"), estimate("안녕") + estimate(" hi!"));
    }

    #[test]
    fn message_overhead_is_four_each() {
        let msgs = vec![Message::user(""), Message::assistant("")];
        assert_eq!(estimate_messages(&msgs), 8);
    }
}
