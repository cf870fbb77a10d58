//! Validation functions for keys, patterns and values.

use crate::constants::MAX_KEY_SIZE;
use crate::constants::MAX_KEY_TOKENS;
use crate::constants::MAX_VALUE_SIZE;
use crate::error::KvError;
use crate::pattern::FULL_WILDCARD;
use crate::pattern::SINGLE_WILDCARD;
use crate::pattern::TOKEN_SEPARATOR;

/// Validate a literal key used for get, put and delete.
pub fn validate_key(key: &str) -> Result<(), KvError> {
    check_shape(key).map_err(|reason| shape_error(key, reason, false))?;
    if key.split(TOKEN_SEPARATOR).any(|token| token == SINGLE_WILDCARD || token == FULL_WILDCARD) {
        return Err(KvError::InvalidKey {
            key: key.to_string(),
            reason: "wildcards are only allowed in patterns".to_string(),
        });
    }
    Ok(())
}

/// Validate a watch or listing pattern.
pub fn validate_pattern(pattern: &str) -> Result<(), KvError> {
    check_shape(pattern).map_err(|reason| shape_error(pattern, reason, true))?;
    let tokens: Vec<&str> = pattern.split(TOKEN_SEPARATOR).collect();
    let last = tokens.len() - 1;
    if tokens[..last].contains(&FULL_WILDCARD) {
        return Err(KvError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: "'>' must be the final token".to_string(),
        });
    }
    Ok(())
}

/// Validate a single key token, such as a flight identifier spliced into a subject.
pub fn validate_token(token: &str) -> Result<(), KvError> {
    if token.is_empty() {
        return Err(KvError::EmptyKey);
    }
    if token.contains(TOKEN_SEPARATOR) || token == SINGLE_WILDCARD || token == FULL_WILDCARD {
        return Err(KvError::InvalidKey {
            key: token.to_string(),
            reason: "must be a single literal token".to_string(),
        });
    }
    if token.chars().any(char::is_whitespace) {
        return Err(KvError::InvalidKey {
            key: token.to_string(),
            reason: "whitespace is not allowed".to_string(),
        });
    }
    Ok(())
}

/// Validate a value against the size bound.
pub fn validate_value(value: &[u8]) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE as usize {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

enum ShapeError {
    Empty,
    TooLarge(usize),
    TooManyTokens(usize),
    EmptyToken,
    Whitespace,
}

fn check_shape(key: &str) -> Result<(), ShapeError> {
    if key.is_empty() {
        return Err(ShapeError::Empty);
    }
    if key.len() > MAX_KEY_SIZE as usize {
        return Err(ShapeError::TooLarge(key.len()));
    }
    let token_count = key.split(TOKEN_SEPARATOR).count();
    if token_count > MAX_KEY_TOKENS {
        return Err(ShapeError::TooManyTokens(token_count));
    }
    if key.split(TOKEN_SEPARATOR).any(str::is_empty) {
        return Err(ShapeError::EmptyToken);
    }
    if key.chars().any(char::is_whitespace) {
        return Err(ShapeError::Whitespace);
    }
    Ok(())
}

fn shape_error(input: &str, error: ShapeError, is_pattern: bool) -> KvError {
    let reason = match error {
        ShapeError::Empty => return KvError::EmptyKey,
        ShapeError::TooLarge(size) => {
            return KvError::KeyTooLarge {
                size,
                max: MAX_KEY_SIZE,
            };
        }
        ShapeError::TooManyTokens(count) => format!("{count} tokens exceeds maximum of {MAX_KEY_TOKENS}"),
        ShapeError::EmptyToken => "empty token".to_string(),
        ShapeError::Whitespace => "whitespace is not allowed".to_string(),
    };
    if is_pattern {
        KvError::InvalidPattern {
            pattern: input.to_string(),
            reason,
        }
    } else {
        KvError::InvalidKey {
            key: input.to_string(),
            reason,
        }
    }
}
