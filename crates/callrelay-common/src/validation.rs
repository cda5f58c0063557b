//! Input validation utilities.
//!
//! Device identifiers end up as registry keys and in log fields, so they are
//! checked on registration and whitelist entries are checked the same way at
//! startup.

use validator::Validate;

use crate::error::{RelayError, RelayResult};

#[derive(Debug, Validate)]
struct DeviceIdentity {
    #[validate(length(
        min = 1,
        max = 128,
        message = "Device ID must be between 1 and 128 characters"
    ))]
    device_id: String,
}

/// Validate a request body, returning a RelayError::InvalidDeviceId on failure.
fn validate_request<T: Validate>(body: &T) -> RelayResult<()> {
    body.validate().map_err(|e| RelayError::InvalidDeviceId {
        message: format_validation_errors(e),
    })
}

/// Format validation errors into a human-readable string.
fn format_validation_errors(errors: validator::ValidationErrors) -> String {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| {
                e.message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("Invalid value for '{field}'"))
            })
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validate a device identifier as supplied by `register_device`.
///
/// A missing or whitespace-only id is [`RelayError::MissingDeviceId`]; anything
/// else that fails is [`RelayError::InvalidDeviceId`]. The id is never trimmed;
/// surrounding whitespace is an illegal character like any other.
pub fn validate_device_id(raw: Option<&str>) -> RelayResult<String> {
    let device_id = match raw {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => return Err(RelayError::MissingDeviceId),
    };

    let identity = DeviceIdentity { device_id };
    validate_request(&identity)?;

    // Letters, digits and a few separators commonly used in hardware ids
    let valid = identity
        .device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));

    if !valid {
        return Err(RelayError::InvalidDeviceId {
            message: "Device ID can only contain letters, numbers, '-', '_', '.' and ':'".into(),
        });
    }

    Ok(identity.device_id)
}
