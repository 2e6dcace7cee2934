//! Central secret registry.
//!
//! Secrets are declared once and referenced by identity from each service,
//! so every service bound to a secret receives the same value. Values are
//! never logged; `fingerprint` gives a short digest for comparison.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

use crate::error::SecretError;

/// Deployment profile controlling whether insecure defaults are acceptable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Local evaluation: insecure defaults allowed
    #[default]
    Evaluation,
    /// Every secret must come from the environment
    Production,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::Evaluation => f.write_str("evaluation"),
            Profile::Production => f.write_str("production"),
        }
    }
}

/// Declaration of one secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSpec {
    /// Identity services reference
    pub name: String,
    /// Environment variable that supplies the value
    pub env: String,
    /// Value used only in the evaluation profile
    pub insecure_default: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretSource {
    Environment,
    InsecureDefault,
}

/// A resolved secret value. Debug output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue {
    value: String,
    source: SecretSource,
}

impl SecretValue {
    pub fn expose(&self) -> &str {
        &self.value
    }

    pub fn source(&self) -> SecretSource {
        self.source
    }

    /// First 12 hex characters of the SHA-256 digest
    pub fn fingerprint(&self) -> String {
        let digest = format!("{:x}", Sha256::digest(self.value.as_bytes()));
        digest[..12].to_string()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretValue")
            .field("value", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretRegistry {
    specs: BTreeMap<String, SecretSpec>,
}

impl SecretRegistry {
    pub fn new(specs: impl IntoIterator<Item = SecretSpec>) -> Self {
        Self {
            specs: specs.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&SecretSpec> {
        self.specs.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SecretSpec> {
        self.specs.values()
    }

    /// Resolve every declared secret from the process environment
    pub fn resolve_from_env(&self, profile: Profile) -> Result<ResolvedSecrets, SecretError> {
        self.resolve(profile, |name| std::env::var(name).ok())
    }

    /// Resolve every declared secret using `lookup` for environment values
    pub fn resolve<F>(&self, profile: Profile, lookup: F) -> Result<ResolvedSecrets, SecretError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut values = BTreeMap::new();

        for spec in self.specs.values() {
            let from_env = lookup(&spec.env).filter(|v| !v.is_empty());

            let value = match (from_env, profile) {
                (Some(v), Profile::Production)
                    if spec.insecure_default.as_deref() == Some(v.as_str()) =>
                {
                    return Err(SecretError::InsecureDefault {
                        secret: spec.name.clone(),
                        env: spec.env.clone(),
                    });
                }
                (Some(v), _) => SecretValue {
                    value: v,
                    source: SecretSource::Environment,
                },
                (None, Profile::Evaluation) => match &spec.insecure_default {
                    Some(default) => {
                        warn!(
                            "Secret '{}' uses its insecure default ({} not set); do not use this outside evaluation",
                            spec.name, spec.env
                        );
                        SecretValue {
                            value: default.clone(),
                            source: SecretSource::InsecureDefault,
                        }
                    }
                    None => {
                        return Err(SecretError::Missing {
                            secret: spec.name.clone(),
                            env: spec.env.clone(),
                        })
                    }
                },
                (None, Profile::Production) => {
                    return Err(SecretError::Missing {
                        secret: spec.name.clone(),
                        env: spec.env.clone(),
                    })
                }
            };

            values.insert(spec.name.clone(), value);
        }

        Ok(ResolvedSecrets { values })
    }
}

/// Secret values resolved once per deployment
#[derive(Debug, Clone, Default)]
pub struct ResolvedSecrets {
    values: BTreeMap<String, SecretValue>,
}

impl ResolvedSecrets {
    pub fn get(&self, name: &str) -> Option<&SecretValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SecretValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Build env var bindings from `env var -> secret identity` references
    pub fn bind(
        &self,
        references: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, SecretError> {
        references
            .iter()
            .map(|(env_var, secret)| {
                self.values
                    .get(secret)
                    .map(|v| (env_var.clone(), v.expose().to_string()))
                    .ok_or_else(|| SecretError::Unresolved {
                        secret: secret.clone(),
                    })
            })
            .collect()
    }
}
