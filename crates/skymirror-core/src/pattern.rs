//! Subject-style key patterns.
//!
//! Keys are dot-separated tokens (`users.42.flights.owned.NZ500`). A pattern
//! is a key whose tokens may be wildcards:
//!
//! - `*` matches exactly one token
//! - `>` as the final token matches one or more trailing tokens
//!
//! A pattern without wildcards matches only the identical key.

/// Wildcard matching exactly one token.
pub const SINGLE_WILDCARD: &str = "*";

/// Wildcard matching one or more trailing tokens.
pub const FULL_WILDCARD: &str = ">";

/// Token separator.
pub const TOKEN_SEPARATOR: char = '.';

/// Check whether `key` is selected by `pattern`.
///
/// Both arguments are assumed to be validated; malformed input simply fails
/// to match.
pub fn matches(pattern: &str, key: &str) -> bool {
    let mut key_tokens = key.split(TOKEN_SEPARATOR);
    for pattern_token in pattern.split(TOKEN_SEPARATOR) {
        if pattern_token == FULL_WILDCARD {
            return key_tokens.next().is_some();
        }
        match key_tokens.next() {
            Some(token) if pattern_token == SINGLE_WILDCARD || pattern_token == token => {}
            _ => return false,
        }
    }
    key_tokens.next().is_none()
}

/// Whether the pattern contains no wildcard tokens.
pub fn is_literal(pattern: &str) -> bool {
    pattern.split(TOKEN_SEPARATOR).all(|token| token != SINGLE_WILDCARD && token != FULL_WILDCARD)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn literal_pattern_matches_only_itself() {
        assert!(matches("flights.NZ500", "flights.NZ500"));
        assert!(!matches("flights.NZ500", "flights.NZ5000"));
        assert!(!matches("flights.NZ500", "flights.NZ500.extra"));
        assert!(!matches("flights.NZ500.extra", "flights.NZ500"));
    }

    #[test]
    fn single_wildcard_matches_one_token() {
        assert!(matches("users.*.flights.owned.NZ500", "users.42.flights.owned.NZ500"));
        assert!(!matches("users.*", "users.42.flights"));
        assert!(!matches("users.*", "users"));
    }

    #[test]
    fn full_wildcard_needs_at_least_one_token() {
        let owned = "users.42.flights.owned.>";
        assert!(matches(owned, "users.42.flights.owned.NZ500"));
        assert!(matches(owned, "users.42.flights.owned.QF144.2025"));
        assert!(!matches(owned, "users.42.flights.owned"));
        assert!(!matches(owned, "users.43.flights.owned.NZ500"));
        assert!(matches(">", "anything"));
    }

    #[test]
    fn literal_detection() {
        assert!(is_literal("flights.NZ500"));
        assert!(!is_literal("flights.*"));
        assert!(!is_literal("flights.>"));
        // Wildcards only count as whole tokens.
        assert!(is_literal("flights.NZ*500"));
    }

    fn token() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_-]{1,8}"
    }

    proptest! {
        #[test]
        fn literal_key_matches_itself(tokens in prop::collection::vec(token(), 1..8)) {
            let key = tokens.join(".");
            prop_assert!(matches(&key, &key));
        }

        #[test]
        fn prefix_with_full_wildcard_matches_any_extension(
            prefix in prop::collection::vec(token(), 1..5),
            tail in prop::collection::vec(token(), 1..5),
        ) {
            let pattern = format!("{}.>", prefix.join("."));
            let key = format!("{}.{}", prefix.join("."), tail.join("."));
            prop_assert!(matches(&pattern, &key));
            prop_assert!(!matches(&pattern, &prefix.join(".")));
        }

        #[test]
        fn all_single_wildcards_match_same_token_count(tokens in prop::collection::vec(token(), 1..8)) {
            let key = tokens.join(".");
            let pattern = vec![SINGLE_WILDCARD; tokens.len()].join(".");
            prop_assert!(matches(&pattern, &key));
            let longer = format!("{pattern}.*");
            prop_assert!(!matches(&longer, &key));
        }
    }
}
