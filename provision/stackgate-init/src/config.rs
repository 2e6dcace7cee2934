//! Initializer configuration
//!
//! Everything arrives through `DD_*` environment variables (see `main.rs`);
//! this module holds the parsed values and the connection settings derived
//! from them.

use sqlx::postgres::PgConnectOptions;
use std::fmt;
use std::time::Duration;

/// Admin account seeded on first run
#[derive(Clone)]
pub struct AdminAccount {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    /// Generated when absent
    pub password: Option<String>,
}

// Hand-written so the password never reaches a log line
impl fmt::Debug for AdminAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminAccount")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// PostgreSQL connection settings
#[derive(Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: Option<String>,
    /// Connection attempts once the gate has passed
    pub connection_timeout: Duration,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("connection_timeout", &self.connection_timeout)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user);

        match &self.password {
            Some(password) => options.password(password),
            None => options,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitializerConfig {
    /// When false the run is a no-op
    pub initialize: bool,
    pub admin: AdminAccount,
    pub database: DatabaseConfig,
    /// Budget for the store readiness gate
    pub readiness_timeout: Duration,
}

#[cfg(test)]
pub(crate) fn sample_config() -> InitializerConfig {
    InitializerConfig {
        initialize: true,
        admin: AdminAccount {
            username: "admin".to_string(),
            email: "admin@defectdojo.local".to_string(),
            first_name: "Admin".to_string(),
            last_name: "User".to_string(),
            password: None,
        },
        database: DatabaseConfig {
            host: "postgres".to_string(),
            port: 5432,
            name: "defectdojo".to_string(),
            user: "defectdojo".to_string(),
            password: Some("s3cret".to_string()),
            connection_timeout: Duration::from_secs(10),
        },
        readiness_timeout: Duration::from_secs(30),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_passwords() {
        let mut config = sample_config();
        config.admin.password = Some("hunter2".to_string());

        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("postgres"));
    }
}
