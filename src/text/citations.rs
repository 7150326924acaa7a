//! Quotation + reference extraction
//!
//! Recognizes a quoted passage immediately followed by a parenthesized locator:
//!
//! ```text
//! "Nothing I see means anything." (W-1)
//! “There is no order of difficulty in miracles.” (T-1.I.1:1)
//! "Love holds no grievances." (Lesson 68)
//! ```
//!
//! Parentheticals that do not look like a locator (`(see above)`, `(emphasis mine)`)
//! are dropped, not guessed at.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// A quoted passage and where it comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub quoted_text: String,
    pub source_reference: String,
}

/// Longest quote accepted; longer spans are almost always mismatched quote marks
const MAX_QUOTE_CHARS: usize = 600;

static QUOTE_WITH_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"["“]([^"“”\n]+)["”]\s*\(([^()\n]{1,80})\)"#)
        .unwrap_or_else(|e| panic!("invalid quote pattern: {e}"))
});

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)^(?:
            # section locators: W-1, T-1.I.1:1, M-4.I.A.3, W-pI.169.5:1-2
            [A-Za-z]{1,4}-[A-Za-z0-9]*\d[A-Za-z0-9.:,\-–]*
          | # numbered units: Lesson 12, lesson 12:3, p. 45, pp. 45-47
            (?i:lesson|p\.|pp\.|page|chapter|ch\.)\s*\d+(?:[.:\-–]\d+)*
          | # book chapter:verse: John 3:16, Matthew 5:3-12, 1 John 4:18
            (?:[1-3]\s)?[A-Z][a-z]+\.?\s\d+:\d+(?:[\-–]\d+)?
        )$",
    )
    .unwrap_or_else(|e| panic!("invalid reference pattern: {e}"))
});

/// Extract every recognized quote/reference pair, in the order the quotes appear
pub fn extract(text: &str) -> Vec<Citation> {
    QUOTE_WITH_REFERENCE
        .captures_iter(text)
        .filter_map(|caps| {
            let quoted = caps.get(1)?.as_str().trim();
            let reference = caps.get(2)?.as_str().trim();

            if quoted.is_empty() || quoted.chars().count() > MAX_QUOTE_CHARS {
                return None;
            }
            if !REFERENCE.is_match(reference) {
                tracing::debug!(reference, "Dropping unrecognized reference");
                return None;
            }

            Some(Citation {
                quoted_text: quoted.to_string(),
                source_reference: reference.to_string(),
            })
        })
        .collect()
}
