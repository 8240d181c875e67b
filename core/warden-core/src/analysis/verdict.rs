//! Verdict extraction from free-form judge output.
//!
//! Judges are asked for a `[Verdict]` block but answer in many shapes: the
//! token on the marker line or below it, with bullets or bold markers, in
//! Japanese symbols, or as a legacy `{"IsViolation": ...}` object. Text
//! without any marker is never a violation.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static RE_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\[\s*(?:verdict|判定)\s*\]|verdict\s*[:：]|判定\s*[:：]").unwrap()
});
static RE_REASON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^[\s*>#-]*(?:reason|理由|content|内容)\s*[:：]\s*(.+?)\s*$").unwrap()
});

const MARKER_WORDS: &[&str] = &["verdict", "判定"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub is_violation: bool,
    pub reason: String,
}

pub fn extract(raw: &str) -> Extracted {
    if let Some(found) = json_verdict(raw) {
        return found;
    }
    let is_violation = marker_verdict(raw)
        .or_else(|| scan_verdict(raw))
        .unwrap_or(false);
    Extracted {
        is_violation,
        reason: extract_reason(raw),
    }
}

pub fn is_violation(raw: &str) -> bool {
    extract(raw).is_violation
}

/// Text after the last `Reason:` / `Content:` label.
pub fn extract_reason(raw: &str) -> String {
    RE_REASON
        .captures_iter(raw)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim_matches('*').trim().to_string())
        .unwrap_or_default()
}

fn json_verdict(raw: &str) -> Option<Extracted> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: Value = serde_json::from_str(&raw[start..=end]).ok()?;
    let is_violation = match value.get("IsViolation")? {
        Value::Bool(flag) => *flag,
        Value::String(text) => text.trim().eq_ignore_ascii_case("true"),
        _ => return None,
    };
    let reason = value
        .get("Reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some(Extracted {
        is_violation,
        reason,
    })
}

/// Token right after the last marker, on the same line or the next non-empty one.
fn marker_verdict(raw: &str) -> Option<bool> {
    let marker = RE_MARKER.find_iter(raw).last()?;
    raw[marker.end()..]
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(classify)
}

/// First line starting with a token anywhere after the first marker line.
fn scan_verdict(raw: &str) -> Option<bool> {
    raw.lines()
        .skip_while(|line| {
            let lower = line.to_lowercase();
            !MARKER_WORDS.iter().any(|word| lower.contains(word))
        })
        .skip(1)
        .find_map(classify)
}

fn classify(line: &str) -> Option<bool> {
    let text = line.trim_start_matches(|c: char| {
        c.is_whitespace() || matches!(c, '*' | '#' | '>' | '-' | '`' | '_' | ':' | '：')
    });
    match text.chars().next()? {
        '×' | '✗' | '✕' => return Some(true),
        '○' | '◯' => return Some(false),
        _ => {}
    }
    const WORDS: &[(&str, bool)] = &[
        ("VIOLATION", true),
        ("COMPLIANT", false),
        ("NG", true),
        ("OK", false),
        ("X", true),
    ];
    WORDS
        .iter()
        .find(|(word, _)| starts_with_word(text, word))
        .map(|(_, violation)| *violation)
}

fn starts_with_word(text: &str, word: &str) -> bool {
    let Some(head) = text.get(..word.len()) else {
        return false;
    };
    head.eq_ignore_ascii_case(word)
        && text[word.len()..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_on_next_line() {
        assert!(is_violation("[Analysis]\nYouTube fullscreen.\n\n[Verdict]\nNG\nReason: watching videos"));
        assert!(!is_violation("[Verdict]\nOK\nContent: writing a report"));
    }

    #[test]
    fn token_on_marker_line() {
        assert!(is_violation("Verdict: NG"));
        assert!(is_violation("判定：×"));
        assert!(!is_violation("Verdict: OK - editing code"));
    }

    #[test]
    fn decorated_tokens() {
        assert!(is_violation("[Verdict]\n**NG**\nReason: game"));
        assert!(is_violation("[判定]\n  ✗ social media"));
        assert!(is_violation("[Verdict]\n- x"));
        assert!(!is_violation("[判定]\n○\n内容: 論文執筆"));
        assert!(!is_violation("[Verdict]\n◯"));
        assert!(is_violation("[Verdict]\nVIOLATION"));
        assert!(!is_violation("[Verdict]\ncompliant"));
    }

    #[test]
    fn last_marker_wins() {
        let raw = "The verdict: ok so far, but then\n[Verdict]\nNG\nReason: streaming";
        assert!(is_violation(raw));
    }

    #[test]
    fn scan_fallback_skips_non_token_lines() {
        let raw = "[Verdict]\n(one of the following)\n\nNG\nReason: chat app";
        assert!(is_violation(raw));
    }

    #[test]
    fn words_starting_with_tokens_do_not_count() {
        assert!(!is_violation("[Verdict]\nXcode is open\nOkay then"));
        assert!(!is_violation("[Verdict]\nNGINX config"));
    }

    #[test]
    fn no_marker_is_compliant() {
        assert!(!is_violation("NG\nReason: something"));
        assert!(!is_violation(""));
    }

    #[test]
    fn json_object_wins() {
        let raw = "Sure.\n{\n  \"IsViolation\": true,\n  \"Reason\": \"YouTube\"\n}";
        let extracted = extract(raw);
        assert!(extracted.is_violation);
        assert_eq!(extracted.reason, "YouTube");
        assert!(!is_violation(r#"{"IsViolation": "false", "Reason": "working"}"#));
    }

    #[test]
    fn reason_from_labels() {
        assert_eq!(extract_reason("NG\nReason: watching videos"), "watching videos");
        assert_eq!(extract_reason("×\n理由：動画サイト"), "動画サイト");
        assert_eq!(extract_reason("OK\n**Content:** coding"), "coding");
        assert_eq!(extract_reason("no labels"), "");
    }
}
