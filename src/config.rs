use std::fmt;

use anyhow::{Context, Error};
use config::{Config, Environment, File};

use crate::domain::{model::EncryptionKey, reconciler::IngressSettings, Settings};

#[derive(serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub listen_address: String,
    /// 64 hex characters.
    pub encryption_key: String,
    pub revision_retention: usize,
    pub max_concurrent_deploys: usize,
    pub ingress: IngressConfig,
}

#[derive(Debug, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngressConfig {
    pub class_name: String,
    pub cluster_issuer: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            listen_address: "0.0.0.0:3000".to_string(),
            encryption_key: String::new(),
            revision_retention: settings.revision_retention,
            max_concurrent_deploys: settings.max_concurrent_deploys,
            ingress: IngressConfig::default(),
        }
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        let settings = IngressSettings::default();
        Self {
            class_name: settings.class_name,
            cluster_issuer: settings.cluster_issuer,
        }
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("listen_address", &self.listen_address)
            .field("encryption_key", &"<redacted>")
            .field("revision_retention", &self.revision_retention)
            .field("max_concurrent_deploys", &self.max_concurrent_deploys)
            .field("ingress", &self.ingress)
            .finish()
    }
}

impl AppConfig {
    pub fn encryption_key(&self) -> Result<EncryptionKey, Error> {
        if self.encryption_key.is_empty() {
            anyhow::bail!("ROKKU_ENCRYPTION_KEY is required");
        }
        EncryptionKey::from_hex(&self.encryption_key).context("Invalid ROKKU_ENCRYPTION_KEY")
    }

    pub fn settings(&self) -> Settings {
        Settings {
            revision_retention: self.revision_retention,
            max_concurrent_deploys: self.max_concurrent_deploys,
            ingress: IngressSettings {
                class_name: self.ingress.class_name.clone(),
                cluster_issuer: self.ingress.cluster_issuer.clone(),
            },
        }
    }
}

/// `rokku.toml` if present, overridden by `ROKKU_*` variables (`ROKKU_INGRESS__CLASS_NAME` for nested keys).
pub fn load_config() -> Result<AppConfig, Error> {
    let config = Config::builder()
        .add_source(File::with_name("rokku").required(false))
        .add_source(
            Environment::with_prefix("rokku")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .context("Can't load configuration")?;

    config
        .try_deserialize()
        .context("Can't deserialize AppConfig from loaded configuration")
}
