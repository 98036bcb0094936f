//! Canonical identifiers
//!
//! Module identities supplied by callers must be canonical UUID text:
//! 36 hex characters and hyphens with hyphens at 8/13/18/23, a version
//! nibble between 0 and 5 and a variant nibble of `0`, `8`, `9`, `a` or `b`.
//! The nil uuid is accepted.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("identifier `{0}` is not in canonical 8-4-4-4-12 form")]
    NotCanonical(String),
    #[error("identifier `{0}` has an unsupported version or variant")]
    UnsupportedLayout(String),
}

/// Parse a caller-supplied identifier that must be a canonical uuid.
pub fn parse_canonical_uuid(text: &str) -> Result<Uuid, IdentityError> {
    let bytes = text.as_bytes();
    let hyphens_ok = bytes.len() == 36
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| matches!(i, 8 | 13 | 18 | 23) == (*b == b'-'));
    if !hyphens_ok {
        return Err(IdentityError::NotCanonical(text.to_string()));
    }

    let uuid = Uuid::try_parse(text).map_err(|_| IdentityError::NotCanonical(text.to_string()))?;
    let version_ok = matches!(bytes[14], b'0'..=b'5');
    let variant_ok = matches!(bytes[19].to_ascii_lowercase(), b'0' | b'8' | b'9' | b'a' | b'b');
    if !version_ok || !variant_ok {
        return Err(IdentityError::UnsupportedLayout(text.to_string()));
    }
    Ok(uuid)
}
