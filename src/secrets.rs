//! Secret loading.
//!
//! Secrets are returned as `Zeroizing<String>` so they are wiped from memory
//! on drop. A 1Password reference (`op://vault/item/field`) is preferred;
//! the plain environment variable is the fallback.

use std::env;
use tracing::{info, warn};
use zeroize::Zeroizing;

pub const FEED_API_KEY_VAR: &str = "HOLDFAST_FEED_API_KEY";
pub const FEED_API_KEY_OP_REF_VAR: &str = "HOLDFAST_FEED_API_KEY_OP_REF";

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("1Password CLI error: {0}")]
    OnePasswordError(String),

    #[error("Secret validation failed: {0}")]
    ValidationFailed(String),
}

/// Loads the live feed API key, if one is configured.
pub fn load_feed_api_key() -> Result<Option<Zeroizing<String>>, SecretError> {
    load_optional_secret(
        env::var(FEED_API_KEY_OP_REF_VAR).ok().as_deref(),
        FEED_API_KEY_VAR,
    )
}

fn load_optional_secret(
    op_reference: Option<&str>,
    env_var_name: &str,
) -> Result<Option<Zeroizing<String>>, SecretError> {
    if let Some(reference) = op_reference.map(str::trim).filter(|r| !r.is_empty()) {
        let secret = load_from_op_cli(reference)?;
        info!("Loaded {} from 1Password", env_var_name);
        validate_secret(&secret)?;
        return Ok(Some(secret));
    }

    match env::var(env_var_name) {
        Ok(value) if !value.trim().is_empty() => {
            warn!("Loading {} from the environment", env_var_name);
            let secret = Zeroizing::new(value.trim().to_string());
            validate_secret(&secret)?;
            Ok(Some(secret))
        }
        _ => Ok(None),
    }
}

fn load_from_op_cli(reference: &str) -> Result<Zeroizing<String>, SecretError> {
    use std::process::Command;

    let output = Command::new("op")
        .arg("read")
        .arg(reference)
        .output()
        .map_err(|e| SecretError::OnePasswordError(format!("Failed to execute 'op': {}", e)))?;

    if !output.status.success() {
        let error_msg = String::from_utf8_lossy(&output.stderr);
        return Err(SecretError::OnePasswordError(format!(
            "1Password CLI failed: {}",
            error_msg.trim()
        )));
    }

    let secret = String::from_utf8(output.stdout)
        .map_err(|e| SecretError::OnePasswordError(format!("Invalid UTF-8 from 1Password: {}", e)))?;
    let secret = Zeroizing::new(secret.trim().to_string());
    if secret.is_empty() {
        return Err(SecretError::OnePasswordError(
            "1Password returned empty secret".to_string(),
        ));
    }
    Ok(secret)
}

/// Keys go into a URL query string, so they must be URL-safe tokens.
fn validate_secret(secret: &str) -> Result<(), SecretError> {
    if secret.len() < 8 {
        return Err(SecretError::ValidationFailed(format!(
            "Secret too short: {} characters (minimum: 8)",
            secret.len()
        )));
    }
    if secret.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(SecretError::ValidationFailed(
            "Secret contains whitespace or control characters".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_secret() {
        assert!(validate_secret("short").is_err());
        assert!(validate_secret("has a space in it").is_err());
        assert!(validate_secret("a1b2c3d4e5f6").is_ok());
    }

    #[test]
    fn test_env_fallback_and_absence() {
        env::set_var("HOLDFAST_TEST_SECRET_PRESENT", "  k3y-value-123  ");
        let secret = load_optional_secret(None, "HOLDFAST_TEST_SECRET_PRESENT").unwrap();
        assert_eq!(secret.as_deref().map(|s| s.as_str()), Some("k3y-value-123"));
        env::remove_var("HOLDFAST_TEST_SECRET_PRESENT");

        assert!(load_optional_secret(None, "HOLDFAST_TEST_SECRET_ABSENT")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_invalid_env_secret_is_rejected() {
        env::set_var("HOLDFAST_TEST_SECRET_WEAK", "abc");
        assert!(matches!(
            load_optional_secret(None, "HOLDFAST_TEST_SECRET_WEAK"),
            Err(SecretError::ValidationFailed(_))
        ));
        env::remove_var("HOLDFAST_TEST_SECRET_WEAK");
    }
}
