//! Final-text cleanup
//!
//! Fixes the formatting artifacts the upstream model tends to leave behind:
//! stray annotation markers, literal escape sequences, unbalanced emphasis and
//! repeated brackets. Sanitizing already-sanitized text changes nothing.

use regex::Regex;
use std::sync::LazyLock;

/// Upper bound on cleanup passes; each pass only shrinks or normalizes the text,
/// so a fixed point is reached in a handful of iterations.
const MAX_PASSES: usize = 16;

static ANNOTATION_MARKER: LazyLock<Regex> = LazyLock::new(|| compile(r"【[^】]*】"));
static UNDERSCORE_BOLD: LazyLock<Regex> = LazyLock::new(|| compile(r"__([^_\n]+?)__"));
static ASTERISK_RUN: LazyLock<Regex> = LazyLock::new(|| compile(r"\*{3,}"));
static OPEN_BRACKET_RUN: LazyLock<Regex> = LazyLock::new(|| compile(r"\[{2,}"));
static CLOSE_BRACKET_RUN: LazyLock<Regex> = LazyLock::new(|| compile(r"\]{2,}"));
static SPACE_BEFORE_PUNCT: LazyLock<Regex> = LazyLock::new(|| compile(r"[ \t]+([.,;:!?])"));

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid sanitizer pattern {pattern}: {e}"))
}

/// Normalize assistant output for display
pub fn sanitize(text: &str) -> String {
    let mut current = text.to_string();
    for _ in 0..MAX_PASSES {
        let next = clean_pass(&current);
        if next == current {
            return next;
        }
        current = next;
    }
    tracing::warn!("Sanitizer did not converge; returning last pass");
    current
}

fn clean_pass(text: &str) -> String {
    let text = ANNOTATION_MARKER.replace_all(text, "");
    let text = text
        .replace("\\r\\n", "\n")
        .replace("\\n", "\n")
        .replace("\r\n", "\n");
    let text = UNDERSCORE_BOLD.replace_all(&text, "**$1**");
    let text = ASTERISK_RUN.replace_all(&text, "**");
    let text = OPEN_BRACKET_RUN.replace_all(&text, "[");
    let text = CLOSE_BRACKET_RUN.replace_all(&text, "]");
    let text = SPACE_BEFORE_PUNCT.replace_all(&text, "$1");

    let mut out = String::with_capacity(text.len());
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&balance_bold(line.trim_end()));
    }

    // Collapse runs of blank lines to a single paragraph break
    while out.contains("\n\n\n") {
        out = out.replace("\n\n\n", "\n\n");
    }
    out.trim_end().to_string()
}

/// Drop the last `**` on a line whose bold markers don't pair up
fn balance_bold(line: &str) -> String {
    if line.matches("**").count() % 2 == 0 {
        return line.to_string();
    }
    match line.rsplit_once("**") {
        Some((head, tail)) => format!("{head}{tail}"),
        None => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_clean_text_is_unchanged() {
        let text = "Lesson 1 asks you to look around slowly.\n\nNothing you see **means** anything.";
        assert_eq!(sanitize(text), text);
    }

    #[test]
    fn test_removes_annotation_markers() {
        assert_eq!(
            sanitize("Nothing I see means anything.【4:0†source】"),
            "Nothing I see means anything."
        );
    }

    #[test]
    fn test_literal_escapes_become_newlines() {
        assert_eq!(sanitize("First line\\nSecond line"), "First line\nSecond line");
        assert_eq!(sanitize("a\\r\\nb"), "a\nb");
    }

    #[test]
    fn test_underscore_bold_becomes_asterisks() {
        assert_eq!(sanitize("This is __important__."), "This is **important**.");
    }

    #[test]
    fn test_collapses_asterisk_and_bracket_runs() {
        assert_eq!(sanitize("***Note***"), "**Note**");
        assert_eq!(sanitize("see [[W-1]]"), "see [W-1]");
    }

    #[test]
    fn test_drops_dangling_bold_marker() {
        assert_eq!(sanitize("**Forgiveness is the key"), "Forgiveness is the key");
        assert_eq!(sanitize("**A** and **B"), "**A** and B");
        assert_eq!(sanitize("Günther’s **çà va"), "Günther’s çà va");
    }

    #[test]
    fn test_bold_balanced_per_line() {
        // Each line is balanced independently
        assert_eq!(sanitize("**open\nclose**"), "open\nclose");
    }

    #[test]
    fn test_whitespace_cleanup() {
        assert_eq!(sanitize("Hello , world  \n\n\n\nNext"), "Hello, world\n\nNext");
        assert_eq!(sanitize("trailing   \n"), "trailing");
    }

    #[test]
    fn test_empty() {
        assert_eq!(sanitize(""), "");
    }

    proptest! {
        #[test]
        fn prop_sanitize_is_idempotent(s in "[a-z *_\\[\\]\\\\n\n.,【】]{0,120}") {
            let once = sanitize(&s);
            prop_assert_eq!(sanitize(&once), once);
        }

        #[test]
        fn prop_sanitize_never_grows_plain_text(s in "[a-zA-Z .,\n]{0,120}") {
            prop_assert!(sanitize(&s).len() <= s.len());
        }

        #[test]
        fn prop_no_triple_runs_survive(s in "[a-z *\\[\\]]{0,120}") {
            let clean = sanitize(&s);
            prop_assert!(!clean.contains("***"));
            prop_assert!(!clean.contains("[["));
            prop_assert!(!clean.contains("]]"));
        }

        #[test]
        fn prop_no_line_has_odd_bold_markers(s in "[a-z *\n]{0,120}") {
            for line in sanitize(&s).lines() {
                prop_assert_eq!(line.matches("**").count() % 2, 0);
            }
        }
    }
}
