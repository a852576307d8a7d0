//! Free-text scrubbing for audit details.
//!
//! Model output and operator notes end up in audit `details` fields.
//! Every SQL statement in this workspace is parameterised, so this is
//! defence-in-depth for downstream consumers of the audit log, not an
//! injection barrier: SQL metacharacters and statement keywords are
//! stripped, control characters collapse to spaces, and the result is
//! length-capped.

/// Maximum length of a scrubbed string.
const MAX_LEN: usize = 2000;

/// Statement keywords removed when they appear as standalone tokens.
const SQL_KEYWORDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "DROP", "TRUNCATE", "ALTER", "GRANT", "REVOKE",
    "UNION", "EXEC", "EXECUTE",
];

/// Scrub one free-form string.
///
/// Whitespace runs collapse to single spaces as a side effect of token
/// filtering.
#[must_use]
pub fn scrub(input: &str) -> String {
    let without_controls: String = input
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();

    let without_meta = without_controls
        .replace("--", " ")
        .replace("/*", " ")
        .replace("*/", " ")
        .replace(';', " ");

    let filtered: Vec<&str> = without_meta
        .split_whitespace()
        .map(|token| {
            let bare = token.trim_matches(|c: char| !c.is_alphanumeric());
            if SQL_KEYWORDS.iter().any(|kw| bare.eq_ignore_ascii_case(kw)) {
                "[filtered]"
            } else {
                token
            }
        })
        .collect();

    let mut out = filtered.join(" ");
    if out.chars().count() > MAX_LEN {
        out = out.chars().take(MAX_LEN).collect();
    }
    out
}

/// Scrub every string inside a JSON value, in place.
pub fn scrub_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => *s = scrub(s),
        serde_json::Value::Array(items) => {
            for item in items {
                scrub_json(item);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                scrub_json(v);
            }
        }
        _ => {}
    }
}
