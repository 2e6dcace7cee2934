//! Secret and volume declarations.

use serde::{Deserialize, Serialize};

use crate::domain::{SecretSpec, Volume};

/// One secret: the env var that supplies it and an evaluation-only fallback
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretConfig {
    pub env: String,

    #[serde(default)]
    pub insecure_default: Option<String>,
}

impl SecretConfig {
    pub fn to_spec(&self, name: &str) -> SecretSpec {
        SecretSpec {
            name: name.to_string(),
            env: self.env.clone(),
            insecure_default: self.insecure_default.clone(),
        }
    }
}

/// Named volume bound to one logical dataset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeConfig {
    pub dataset: String,
}

impl VolumeConfig {
    pub fn to_volume(&self, name: &str) -> Volume {
        Volume {
            name: name.to_string(),
            dataset: self.dataset.clone(),
        }
    }
}
