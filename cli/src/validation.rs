//! Validation utilities for topology configuration and credentials

use anyhow::Result;

/// Maximum length for service names (DNS label limit)
pub const SERVICE_NAME_MAX_LENGTH: usize = 63;

/// Characters allowed in service names besides lowercase alphanumerics
const SERVICE_NAME_ALLOWED_CHARS: &[char] = &['-', '_'];

/// Validate a service name so it is usable as a hostname and volume prefix
///
/// Service names must:
/// - Not be empty
/// - Not exceed 63 characters
/// - Start with a lowercase letter
/// - Contain only lowercase alphanumerics, hyphen or underscore
pub fn validate_service_name(name: &str, field_name: &str) -> Result<()> {
    let Some(first_char) = name.chars().next() else {
        anyhow::bail!("{} cannot be empty", field_name);
    };

    if name.len() > SERVICE_NAME_MAX_LENGTH {
        anyhow::bail!(
            "{} exceeds maximum length ({} > {})",
            field_name,
            name.len(),
            SERVICE_NAME_MAX_LENGTH
        );
    }

    if !first_char.is_ascii_lowercase() {
        anyhow::bail!(
            "{} must start with a lowercase letter, got: '{}'",
            field_name,
            first_char
        );
    }

    let invalid_chars: Vec<char> = name
        .chars()
        .filter(|c| {
            !(c.is_ascii_lowercase() || c.is_ascii_digit() || SERVICE_NAME_ALLOWED_CHARS.contains(c))
        })
        .collect();

    if !invalid_chars.is_empty() {
        anyhow::bail!(
            "{} contains invalid characters: {:?} (allowed: a-z, 0-9, -, _)",
            field_name,
            invalid_chars
        );
    }

    Ok(())
}

/// Validate an environment variable name (`[A-Za-z_][A-Za-z0-9_]*`)
pub fn validate_env_var_name(name: &str, field_name: &str) -> Result<()> {
    let Some(first_char) = name.chars().next() else {
        anyhow::bail!("{} cannot be empty", field_name);
    };

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        anyhow::bail!(
            "{} must start with a letter or underscore, got: '{}'",
            field_name,
            first_char
        );
    }

    if let Some(bad) = name.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        anyhow::bail!("{} contains invalid character '{}'", field_name, bad);
    }

    Ok(())
}

/// Validate that a password is not empty and contains no problematic whitespace
pub fn validate_password(password: &str, field_name: &str) -> Result<()> {
    if password.is_empty() {
        anyhow::bail!("{} cannot be empty", field_name);
    }

    if password != password.trim() {
        anyhow::bail!(
            "{} contains leading or trailing whitespace (this is likely unintentional)",
            field_name
        );
    }

    Ok(())
}

/// Validate configuration numeric values are within reasonable bounds
pub fn validate_numeric_range(value: u64, field_name: &str, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        anyhow::bail!(
            "{} must be between {} and {}, got: {}",
            field_name,
            min,
            max,
            value
        );
    }
    Ok(())
}
