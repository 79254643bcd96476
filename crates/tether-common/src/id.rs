//! Network and endpoint ID generation and name validation.

use crate::error::{TetherError, TetherResult};

/// Length of a generated ID in hex characters.
pub const ID_LENGTH: usize = 64;

/// Length of the abbreviated form returned by [`short_id`].
pub const SHORT_ID_LENGTH: usize = 12;

/// Generate a new random object ID.
///
/// The ID is a 64-character hex string built from two UUID v4 values.
#[must_use]
pub fn generate_id() -> String {
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    bytes[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    hex::encode(bytes)
}

/// Returns the first 12 characters of an ID.
#[must_use]
pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LENGTH).unwrap_or(id)
}

/// Validate a user-chosen network or endpoint name.
///
/// A name must not be blank and must not contain `.`, which separates the
/// endpoint name from the network name in qualified service records.
///
/// # Errors
///
/// Returns [`TetherError::InvalidName`] if the name is rejected.
pub fn validate_name(name: &str) -> TetherResult<()> {
    if name.trim().is_empty() || name.contains('.') {
        return Err(TetherError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}
