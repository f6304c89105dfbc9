//! Build identifier generation.
//!
//! The identifier namespaces the keychain, provisioning profile and plist
//! created for one build so that concurrent builds on the same host never
//! collide on file names.

use regex_lite::Regex;
use std::sync::LazyLock;

use crate::models::BuildIdentifier;

/// Hard cap imposed by keychain file naming.
pub const MAX_IDENTIFIER_LEN: usize = 50;

static NON_ALPHANUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("static pattern is valid"));

/// Derives the build identifier for a team/bundle pair.
///
/// Deterministic and pure. The result only contains `[a-z0-9_]`, never starts
/// or ends with `_`, and is at most [`MAX_IDENTIFIER_LEN`] characters long.
/// Pairs sharing a 50-character normalized prefix map to the same identifier.
pub fn generate(team_id: &str, bundle_id: &str) -> BuildIdentifier {
    let combined = format!("{}_{}", normalize(team_id), normalize(bundle_id));
    let mut identifier = combined.trim_matches('_').to_string();

    // Output of `normalize` is ASCII, so byte truncation is char-safe.
    if identifier.len() > MAX_IDENTIFIER_LEN {
        identifier.truncate(MAX_IDENTIFIER_LEN);
        identifier.truncate(identifier.trim_end_matches('_').len());
    }

    BuildIdentifier(identifier)
}

/// Lower-cases and collapses every non `[a-z0-9]` run into a single `_`.
fn normalize(input: &str) -> String {
    let lowered = input.to_lowercase();
    NON_ALPHANUMERIC
        .replace_all(&lowered, "_")
        .trim_matches('_')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_well_formed(id: &str) -> bool {
        id.len() <= MAX_IDENTIFIER_LEN
            && !id.starts_with('_')
            && !id.ends_with('_')
            && !id.contains("__")
            && id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }

    #[test]
    fn test_basic_identifier() {
        assert_eq!(
            generate("ABCD123456", "com.example.app").as_str(),
            "abcd123456_com_example_app"
        );
    }

    #[test]
    fn test_special_characters_collapse() {
        assert_eq!(
            generate("ABC-123", "com.test.app-beta").as_str(),
            "abc_123_com_test_app_beta"
        );
        assert_eq!(
            generate("--TEAM..", "com..example--app!!").as_str(),
            "team_com_example_app"
        );
    }

    #[test]
    fn test_long_input_is_truncated() {
        let id = generate(
            "VERYLONGTEAMIDTHATEXCEEDSTHERECOMMENDEDLENGTH",
            "com.verylongbundleid.application.name.test",
        );
        // The 50-character cut lands on a separator, which is then trimmed.
        assert_eq!(id.as_str(), "verylongteamidthatexceedstherecommendedlength_com");
        assert!(is_well_formed(id.as_str()));
    }

    #[test]
    fn test_truncation_keeps_exactly_fifty_when_possible() {
        let id = generate("TEAM1234567", "com.example.averyveryveryverylongapplicationname");
        assert_eq!(id.as_str().len(), MAX_IDENTIFIER_LEN);
        assert!(is_well_formed(id.as_str()));
    }

    #[test]
    fn test_deterministic() {
        let a = generate("ABCD123456", "com.example.app");
        let b = generate("ABCD123456", "com.example.app");
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_pairs_produce_distinct_identifiers() {
        assert_ne!(
            generate("TEAM000001", "com.example.app"),
            generate("TEAM000002", "com.example.app")
        );
        assert_ne!(
            generate("TEAM000001", "com.example.app"),
            generate("TEAM000001", "com.example.app2")
        );
    }

    #[test]
    fn test_missing_bundle_id() {
        assert_eq!(generate("ABCD123456", "").as_str(), "abcd123456");
    }

    #[test]
    fn test_non_ascii_input_is_safe_for_file_names() {
        let id = generate("Tëam/ID\"1", "com.exämple.app's");
        assert!(is_well_formed(id.as_str()));
        assert!(!id.as_str().contains('/'));
        assert!(!id.as_str().contains('"'));
    }

    #[test]
    fn test_well_formed_for_assorted_inputs() {
        let inputs = [
            ("", ""),
            ("_", "_"),
            ("A", "b"),
            ("  spaced team  ", " com . spaced "),
            ("X".repeat(80).as_str(), "com.example.app"),
        ]
        .map(|(t, b)| (t.to_string(), b.to_string()));

        for (team, bundle) in inputs {
            let id = generate(&team, &bundle);
            assert!(is_well_formed(id.as_str()), "bad identifier {:?}", id);
        }
    }
}
