//! Compiled endpoint-key patterns for templated policy entries.
//!
//! Policy files may key endpoints with `{param}` placeholders, e.g.
//! `GET|/users/{id}`. When a request arrives without a route template its
//! key carries the raw path, so exact lookup misses; these compiled
//! patterns bridge that gap by matching raw-path keys against templated
//! configuration keys.
//!
//! Placeholders match a single path segment (`[^/|]+`). Patterns with more
//! placeholders are considered less specific and are tried later.

use regex::Regex;
use std::sync::Arc;
use thiserror::Error;

/// Errors from endpoint-pattern compilation.
#[derive(Error, Debug, PartialEq)]
pub enum PatternError {
    /// Malformed placeholder syntax (unclosed brace, empty or invalid name).
    #[error("invalid endpoint pattern: {pattern}")]
    InvalidPattern { pattern: String },

    /// The generated regex failed to compile.
    #[error("regex compilation failed: {0}")]
    RegexError(String),
}

/// A policy endpoint key compiled into a regex for raw-path matching.
///
/// The regex is wrapped in an `Arc` so compiled patterns can be shared
/// across worker threads without recompilation.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    /// The original templated key, e.g. `GET|/users/{id}`.
    pub source: String,
    pub regex: Arc<Regex>,
    /// Placeholder count; used to order patterns by specificity.
    pub param_count: usize,
}

/// True when the key contains `{param}` placeholders and needs a compiled
/// pattern rather than exact lookup.
pub fn is_dynamic(key: &str) -> bool {
    key.contains('{')
}

/// Compiles a templated endpoint key into a [`CompiledPattern`].
pub fn compile(pattern: &str) -> Result<CompiledPattern, PatternError> {
    let regex_pattern = convert_to_regex(pattern)?;
    let regex = Regex::new(&regex_pattern).map_err(|e| PatternError::RegexError(e.to_string()))?;
    Ok(CompiledPattern {
        source: pattern.to_string(),
        regex: Arc::new(regex),
        param_count: pattern.matches('{').count(),
    })
}

/// Converts a templated key to an anchored regex, escaping regex
/// metacharacters and replacing each `{name}` with a single-segment
/// capture.
fn convert_to_regex(pattern: &str) -> Result<String, PatternError> {
    let mut regex_pattern = String::with_capacity(pattern.len() * 2);
    regex_pattern.push('^');

    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                let mut param_name = String::new();
                let mut found_closing = false;
                for inner_ch in chars.by_ref() {
                    if inner_ch == '}' {
                        found_closing = true;
                        break;
                    }
                    if inner_ch.is_alphanumeric() || inner_ch == '_' {
                        param_name.push(inner_ch);
                    } else {
                        return Err(PatternError::InvalidPattern {
                            pattern: pattern.to_string(),
                        });
                    }
                }
                if !found_closing || param_name.is_empty() {
                    return Err(PatternError::InvalidPattern {
                        pattern: pattern.to_string(),
                    });
                }
                regex_pattern.push_str("([^/|]+)");
            }
            '.' | '?' | '*' | '+' | '^' | '$' | '[' | ']' | '(' | ')' | '|' | '\\' => {
                regex_pattern.push('\\');
                regex_pattern.push(ch);
            }
            _ => regex_pattern.push(ch),
        }
    }

    regex_pattern.push('$');
    Ok(regex_pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_keys_are_not_dynamic() {
        assert!(!is_dynamic("POST|/api/ask"));
        assert!(is_dynamic("GET|/users/{id}"));
    }

    #[test]
    fn compiled_pattern_matches_raw_path_keys() {
        let compiled = compile("GET|/users/{id}").unwrap();
        assert!(compiled.regex.is_match("GET|/users/42"));
        assert!(compiled.regex.is_match("GET|/users/alice"));
        assert!(!compiled.regex.is_match("GET|/users/42/posts"));
        assert!(!compiled.regex.is_match("POST|/users/42"));
    }

    #[test]
    fn placeholder_does_not_cross_segments() {
        let compiled = compile("GET|/files/{name}/meta").unwrap();
        assert!(compiled.regex.is_match("GET|/files/report.pdf/meta"));
        assert!(!compiled.regex.is_match("GET|/files/a/b/meta"));
    }

    #[test]
    fn method_separator_is_escaped() {
        // The '|' separating method from path must be literal, not regex
        // alternation.
        let compiled = compile("GET|/ping").unwrap();
        assert!(compiled.regex.is_match("GET|/ping"));
        assert!(!compiled.regex.is_match("GET"));
        assert!(!compiled.regex.is_match("/ping"));
    }

    #[test]
    fn malformed_placeholders_are_rejected() {
        assert!(matches!(
            compile("GET|/users/{unclosed"),
            Err(PatternError::InvalidPattern { .. })
        ));
        assert!(matches!(
            compile("GET|/users/{}"),
            Err(PatternError::InvalidPattern { .. })
        ));
        assert!(matches!(
            compile("GET|/users/{bad name}"),
            Err(PatternError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn param_count_tracks_placeholders() {
        assert_eq!(compile("GET|/a/{b}/c/{d}").unwrap().param_count, 2);
        assert_eq!(compile("GET|/a").unwrap().param_count, 0);
    }
}
