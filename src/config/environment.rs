//! # Environment Name Sanitization
//!
//! Environment names become directory components under both the buffer and
//! database roots, so they are restricted to `[A-Za-z0-9_]`. Anything else
//! is stripped rather than rejected: callers routinely pass user-supplied
//! names and the original system's contract is "keep what is usable".
//!
//! An environment that sanitizes to the empty string falls back to the
//! configured default, which [`crate::config::Config::validate`] guarantees
//! sanitizes non-empty.

/// Removes every character outside `[A-Za-z0-9_]`.
pub fn strip(environment: &str) -> String {
    environment
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Sanitizes `environment`, falling back to the sanitized `default` when the
/// result is empty.
pub fn sanitize_with_default(environment: &str, default: &str) -> String {
    let stripped = strip(environment);
    if stripped.is_empty() {
        strip(default)
    } else {
        stripped
    }
}

/// Sanitizes `environment` against the stock default environment name.
pub fn sanitize(environment: &str) -> String {
    sanitize_with_default(environment, "default")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_non_alphanumeric_characters() {
        assert_eq!(sanitize("$%&foo@3**"), "foo3");
    }

    #[test]
    fn keeps_underscores() {
        assert_eq!(sanitize("$_%&test_@envir==--onment*_*"), "_test_environment_");
    }

    #[test]
    fn empty_input_returns_default() {
        assert_eq!(sanitize(""), "default");
        assert_eq!(sanitize_with_default("", "prod"), "prod");
    }

    #[test]
    fn default_is_itself_sanitized() {
        assert_eq!(sanitize_with_default("", "%$#9blah@@3foo1#$"), "9blah3foo1");
    }
}
