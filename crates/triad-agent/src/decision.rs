//! Reading a verdict out of free-form agent output.

use std::sync::OnceLock;

use regex::Regex;
use triad_core::consensus::Vote;

fn approve_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(APPROVE|APPROVED|LGTM|ACCEPT|YES)\b").expect("static regex"))
}

fn reject_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(REJECT|REJECTED|DENY|DENIED|NO|BLOCK)\b").expect("static regex")
    })
}

/// Approval keywords win over rejection keywords; anything else abstains.
pub fn extract_decision(text: &str) -> Vote {
    if approve_re().is_match(text) {
        Vote::Approve
    } else if reject_re().is_match(text) {
        Vote::Reject
    } else {
        Vote::Abstain
    }
}

const CONFIDENCE_LEVELS: &[(&str, f64)] = &[
    (r"(?i)\b(definitely|certainly|absolutely|clearly|strongly)\b", 0.9),
    (r"(?i)\b(likely|probably|appears|seems|looks)\b", 0.7),
    (r"(?i)\b(maybe|might|could|possibly|perhaps|unsure)\b", 0.4),
    (r"(?i)\b(difficult to say|hard to tell|cannot determine|need more)\b", 0.2),
];

fn confidence_res() -> &'static [(Regex, f64)] {
    static RES: OnceLock<Vec<(Regex, f64)>> = OnceLock::new();
    RES.get_or_init(|| {
        CONFIDENCE_LEVELS
            .iter()
            .map(|(pat, score)| (Regex::new(pat).expect("static regex"), *score))
            .collect()
    })
}

/// Hedging language lowers confidence; strong language raises it. 0.5 when
/// neither appears.
pub fn confidence(text: &str) -> f64 {
    confidence_res()
        .iter()
        .find(|(re, _)| re.is_match(text))
        .map(|(_, score)| *score)
        .unwrap_or(0.5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions() {
        let cases = [
            ("I APPROVE this change.", Vote::Approve),
            ("APPROVED - looks good!", Vote::Approve),
            ("LGTM", Vote::Approve),
            ("I accept this implementation", Vote::Approve),
            ("YES, this is correct", Vote::Approve),
            ("I REJECT this code.", Vote::Reject),
            ("REJECTED due to security issues", Vote::Reject),
            ("DENY this request", Vote::Reject),
            ("NO, this is incorrect", Vote::Reject),
            ("BLOCK this merge", Vote::Reject),
            ("I'm UNSURE about this", Vote::Abstain),
            ("Cannot determine the answer", Vote::Abstain),
            ("Need more information", Vote::Abstain),
            ("Some random text", Vote::Abstain),
            ("", Vote::Abstain),
        ];
        for (text, expected) in cases {
            assert_eq!(extract_decision(text), expected, "{text:?}");
        }
    }

    #[test]
    fn keywords_need_word_boundaries() {
        assert_eq!(extract_decision("the nonblocking path"), Vote::Abstain);
        assert_eq!(extract_decision("yesterday it was noted"), Vote::Abstain);
    }

    #[test]
    fn confidence_levels() {
        let cases = [
            ("I definitely approve this.", 0.9),
            ("This is clearly correct.", 0.9),
            ("It probably works.", 0.7),
            ("This seems fine.", 0.7),
            ("Maybe this could work.", 0.4),
            ("I'm unsure about this.", 0.4),
            ("It's difficult to say.", 0.2),
            ("Hard to tell without more context.", 0.2),
            ("Cannot determine the impact.", 0.2),
            ("Some neutral text.", 0.5),
        ];
        for (text, expected) in cases {
            assert_eq!(confidence(text), expected, "{text:?}");
        }
    }
}
