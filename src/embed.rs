// src/embed.rs

//! `@(name)` variable interpolation for script bodies.
//!
//! Tokens have the form `@(name)` (required) or `@(name?)` (optional). Names
//! are matched case-insensitively against the stage's reserved table first,
//! then the user table. The transform is pure: it returns a fresh string and
//! never mutates its inputs.

use crate::error::{Error, Result};

/// Variable names the stage executor supplies itself. User variables with
/// these names are refused on the command line.
pub const RESERVED_NAMES: &[&str] = &[
    "thread_count",
    "prefix",
    "sysroot_dir",
    "sources_dir",
    "cache_dir",
    "build_dir",
    "install_dir",
    "source_dir",
];

/// Returns true if `name` collides with a reserved variable.
pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(name))
}

/// Expand every `@(name)` / `@(name?)` token in `input`.
///
/// A required token whose name is in neither table fails the whole
/// interpolation; an optional one is deleted. `@()` passes through verbatim.
/// Anything other than `@(` is literal text.
pub fn expand(
    input: &str,
    reserved: &[(&str, &str)],
    user: &[(String, String)],
) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(at) = rest.find("@(") {
        out.push_str(&rest[..at]);
        let after = &rest[at + 2..];
        let close = after.find(')').ok_or_else(|| {
            let snippet: String = rest[at..].chars().take(32).collect();
            Error::UnterminatedEmbed(snippet)
        })?;

        let raw = &after[..close];
        if raw.is_empty() {
            out.push_str("@()");
        } else {
            let (name, optional) = match raw.strip_suffix('?') {
                Some(name) => (name, true),
                None => (raw, false),
            };
            match lookup(name, reserved, user) {
                Some(value) => out.push_str(value),
                None if optional => {}
                None => return Err(Error::UnknownEmbed(name.to_string())),
            }
        }

        rest = &after[close + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

fn lookup<'a>(
    name: &str,
    reserved: &'a [(&str, &str)],
    user: &'a [(String, String)],
) -> Option<&'a str> {
    reserved
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| *value)
        .or_else(|| {
            user.iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_user() -> Vec<(String, String)> {
        Vec::new()
    }

    #[test]
    fn test_plain_text_is_identity() {
        let input = "make -j8 && make install";
        let out = expand(input, &[("prefix", "/usr")], &no_user()).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_required_token_replaced() {
        let out = expand(
            "./configure --prefix=@(prefix)",
            &[("prefix", "/usr/local")],
            &no_user(),
        )
        .unwrap();
        assert_eq!(out, "./configure --prefix=/usr/local");
    }

    #[test]
    fn test_required_token_missing_fails() {
        let err = expand("cp @(nope)/x .", &[], &no_user()).unwrap_err();
        assert!(matches!(err, Error::UnknownEmbed(name) if name == "nope"));
    }

    #[test]
    fn test_optional_token_found() {
        let out = expand("@(flags?) make", &[("flags", "-v")], &no_user()).unwrap();
        assert_eq!(out, "-v make");
    }

    #[test]
    fn test_optional_token_missing_deleted() {
        let out = expand("make @(flags?)all", &[], &no_user()).unwrap();
        assert_eq!(out, "make all");
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let out = expand("@(PREFIX)", &[("prefix", "/usr")], &no_user()).unwrap();
        assert_eq!(out, "/usr");
    }

    #[test]
    fn test_reserved_table_wins_over_user() {
        let user = vec![("prefix".to_string(), "/home/me".to_string())];
        let out = expand("@(prefix)", &[("prefix", "/usr")], &user).unwrap();
        assert_eq!(out, "/usr");
    }

    #[test]
    fn test_user_table_consulted_second() {
        let user = vec![("arch".to_string(), "x86_64".to_string())];
        let out = expand("--target=@(arch)", &[("prefix", "/usr")], &user).unwrap();
        assert_eq!(out, "--target=x86_64");
    }

    #[test]
    fn test_empty_token_passes_through() {
        let out = expand("a @() b", &[], &no_user()).unwrap();
        assert_eq!(out, "a @() b");
    }

    #[test]
    fn test_lone_at_is_literal() {
        let out = expand("user@host and @ alone", &[], &no_user()).unwrap();
        assert_eq!(out, "user@host and @ alone");
    }

    #[test]
    fn test_unterminated_token_rejected() {
        let err = expand("echo @(prefix", &[("prefix", "/usr")], &no_user()).unwrap_err();
        assert!(matches!(err, Error::UnterminatedEmbed(_)));
    }

    #[test]
    fn test_deterministic() {
        let vars = [("prefix", "/usr"), ("sysroot_dir", "/chariot/sysroot")];
        let input = "cfg @(prefix) @(sysroot_dir) @(missing?)";
        let first = expand(input, &vars, &no_user()).unwrap();
        let second = expand(input, &vars, &no_user()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_is_reserved() {
        assert!(is_reserved("thread_count"));
        assert!(is_reserved("PREFIX"));
        assert!(!is_reserved("arch"));
    }
}
