//! Payload validation, applied before any network round trip.

use thiserror::Error;

/// Upper bound on message length, in characters.
pub const MAX_PAYLOAD_CHARS: usize = 4000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message is empty")]
    Empty,
    #[error("Message is {len} characters long (limit {max})")]
    TooLong { len: usize, max: usize },
}

/// Trim `raw` and check it is a sendable payload.
///
/// Returns the trimmed text; whitespace-only input is rejected.
pub fn validate_payload(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }
    let len = trimmed.chars().count();
    if len > MAX_PAYLOAD_CHARS {
        return Err(ValidationError::TooLong {
            len,
            max: MAX_PAYLOAD_CHARS,
        });
    }
    Ok(trimmed.to_string())
}
