//! Admin account validation, run before any store access

use anyhow::{Context, Result};
use stackgate::validation::validate_password;

use crate::config::AdminAccount;

/// Username and name field limit
pub const NAME_MAX_LENGTH: usize = 150;

/// RFC 5321 path limit
pub const EMAIL_MAX_LENGTH: usize = 254;

pub const PASSWORD_MIN_LENGTH: usize = 8;

/// Characters allowed in usernames besides ASCII alphanumerics
const USERNAME_ALLOWED_CHARS: &[char] = &['@', '.', '+', '-', '_'];

pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        anyhow::bail!("admin username cannot be empty");
    }

    if username.chars().count() > NAME_MAX_LENGTH {
        anyhow::bail!(
            "admin username exceeds maximum length ({} > {})",
            username.chars().count(),
            NAME_MAX_LENGTH
        );
    }

    let invalid_chars: Vec<char> = username
        .chars()
        .filter(|c| !c.is_ascii_alphanumeric() && !USERNAME_ALLOWED_CHARS.contains(c))
        .collect();

    if !invalid_chars.is_empty() {
        anyhow::bail!(
            "admin username contains invalid characters: {:?} (allowed: a-z, A-Z, 0-9, @, ., +, -, _)",
            invalid_chars
        );
    }

    Ok(())
}

/// Shape check only: one '@', a non-empty local part and a dotted domain
pub fn validate_email(email: &str) -> Result<()> {
    if email.is_empty() {
        anyhow::bail!("admin email cannot be empty");
    }

    if email.len() > EMAIL_MAX_LENGTH {
        anyhow::bail!(
            "admin email exceeds maximum length ({} > {})",
            email.len(),
            EMAIL_MAX_LENGTH
        );
    }

    if email.chars().any(char::is_whitespace) {
        anyhow::bail!("admin email cannot contain whitespace");
    }

    let Some((local, domain)) = email.split_once('@') else {
        anyhow::bail!("admin email must contain '@', got: '{}'", email);
    };

    if local.is_empty() || domain.contains('@') {
        anyhow::bail!("admin email is malformed: '{}'", email);
    }

    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        anyhow::bail!("admin email has an invalid domain: '{}'", domain);
    }

    Ok(())
}

pub fn validate_admin_password(password: &str) -> Result<()> {
    validate_password(password, "admin password")?;

    if password.chars().count() < PASSWORD_MIN_LENGTH {
        anyhow::bail!(
            "admin password must be at least {} characters",
            PASSWORD_MIN_LENGTH
        );
    }

    Ok(())
}

fn validate_display_name(name: &str, field_name: &str) -> Result<()> {
    if name.chars().count() > NAME_MAX_LENGTH {
        anyhow::bail!(
            "{} exceeds maximum length ({} > {})",
            field_name,
            name.chars().count(),
            NAME_MAX_LENGTH
        );
    }
    if name.chars().any(char::is_control) {
        anyhow::bail!("{} contains control characters", field_name);
    }
    Ok(())
}

pub fn validate_admin(admin: &AdminAccount) -> Result<()> {
    validate_username(&admin.username).context("Invalid DD_ADMIN_USER")?;
    validate_email(&admin.email).context("Invalid DD_ADMIN_MAIL")?;
    validate_display_name(&admin.first_name, "admin first name")
        .context("Invalid DD_ADMIN_FIRST_NAME")?;
    validate_display_name(&admin.last_name, "admin last name")
        .context("Invalid DD_ADMIN_LAST_NAME")?;

    if let Some(password) = &admin.password {
        validate_admin_password(password).context("Invalid DD_ADMIN_PASSWORD")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_username() {
        assert!(validate_username("admin").is_ok());
        assert!(validate_username("first.last+dojo@corp").is_ok());

        assert!(validate_username("").is_err());
        assert!(validate_username("ad min").is_err());
        assert!(validate_username("admin;drop").is_err());
        assert!(validate_username(&"a".repeat(151)).is_err());
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("admin@defectdojo.local").is_ok());

        assert!(validate_email("").is_err());
        assert!(validate_email("admin").is_err());
        assert!(validate_email("@defectdojo.local").is_err());
        assert!(validate_email("admin@localhost").is_err());
        assert!(validate_email("admin@a@b.com").is_err());
        assert!(validate_email("ad min@defectdojo.local").is_err());
    }

    #[test]
    fn test_validate_admin_password() {
        assert!(validate_admin_password("correct-horse").is_ok());

        assert!(validate_admin_password("").is_err());
        assert!(validate_admin_password("short").is_err());
        assert!(validate_admin_password(" padded-password ").is_err());
    }

    #[test]
    fn test_validate_admin_reports_field() {
        let admin = AdminAccount {
            username: "admin".to_string(),
            email: "not-an-email".to_string(),
            first_name: String::new(),
            last_name: String::new(),
            password: None,
        };
        let err = validate_admin(&admin).unwrap_err();
        assert!(format!("{:#}", err).contains("DD_ADMIN_MAIL"));
    }
}
