//! Input validation helpers for RPC parameters.

use super::errors::RpcError;

/// Maximum length of keys and IDs (session keys, dedupe keys, labels).
pub const MAX_KEY_LENGTH: usize = 512;

/// Maximum general string parameter length (8 KB).
pub const MAX_PARAM_LENGTH: usize = 8_192;

/// Validate that a string parameter does not exceed `max_len` bytes.
pub fn validate_string_param(value: &str, name: &str, max_len: usize) -> Result<(), RpcError> {
    if value.len() > max_len {
        return Err(RpcError::InvalidParams {
            message: format!(
                "Parameter '{name}' exceeds maximum length ({} > {max_len})",
                value.len()
            ),
        });
    }
    Ok(())
}

/// Validate a key-like parameter: non-empty and at most [`MAX_KEY_LENGTH`].
pub fn validate_key(value: &str, name: &str) -> Result<(), RpcError> {
    if value.trim().is_empty() {
        return Err(RpcError::invalid_params(format!(
            "Parameter '{name}' must not be empty"
        )));
    }
    validate_string_param(value, name, MAX_KEY_LENGTH)
}

/// Sanitize an error message for client consumption.
///
/// Internal errors are reduced to a generic message; everything else is
/// user-facing already.
pub fn sanitize_error_message(err: &RpcError) -> String {
    match err {
        RpcError::InvalidParams { message }
        | RpcError::NotFound { message, .. }
        | RpcError::Custom { message, .. } => message.clone(),
        RpcError::Internal { .. } => "Internal error".to_string(),
    }
}
