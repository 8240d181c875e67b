//! Cleanup of judge CLI output before verdict extraction.
//!
//! The CLI writes a terminal UI: colour codes, hyperlinks, framed boxes and
//! tool-call chatter. Only the model's prose matters.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_CSI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").unwrap());
static RE_OSC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1B\][^\x07\x1B]*(?:\x07|\x1B\\)?").unwrap());
static RE_ESC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1B[@-Z\\-_]").unwrap());
static RE_FRAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[╭╮╰╯─│┌┐└┘├┤┬┴┼═║✓]").unwrap());

const LOCAL_READ_FAILURES: &[&str] = &[
    "file not found",
    "cannot open",
    "could not read",
    "no such file",
    "unable to read",
];

/// Removes escape sequences, frame glyphs and CLI status lines.
pub fn clean_cli_output(raw: &str) -> String {
    let text = RE_OSC.replace_all(raw, "");
    let text = RE_CSI.replace_all(&text, "");
    let text = RE_ESC.replace_all(&text, "");
    let text = RE_FRAME.replace_all(&text, "");

    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !is_chatter(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn is_chatter(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("[STARTUP]")
        || trimmed.starts_with("ReadFile")
        || line.contains("Tool Calls")
        || line.contains("YOLO mode")
}

/// True when the judge reports it could not read the screenshots itself.
/// Such output says nothing about the user and must fall through.
pub fn is_local_read_failure(text: &str) -> bool {
    let lower = text.to_lowercase();
    LOCAL_READ_FAILURES
        .iter()
        .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_escapes_and_frames() {
        let raw = "\x1B[32m╭──────╮\x1B[0m\n│ \x1B]8;;https://x\x07link\x1B]8;;\x07 │\n[Verdict]\nOK\r\n";
        assert_eq!(clean_cli_output(raw), "link \n[Verdict]\nOK");
    }

    #[test]
    fn drops_tool_chatter() {
        let raw = "[STARTUP] loading\nYOLO mode is enabled\n ReadFile Screenshot_1.png\nTool Calls: 1\n[Verdict]\nNG\nReason: video site";
        assert_eq!(clean_cli_output(raw), "[Verdict]\nNG\nReason: video site");
    }

    #[test]
    fn detects_local_read_failure() {
        assert!(is_local_read_failure("Error: File not found: /tmp/a.png"));
        assert!(is_local_read_failure("I was unable to read the image"));
        assert!(!is_local_read_failure("[Verdict]\nOK\nContent: editing a report"));
    }
}
