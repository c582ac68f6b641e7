use std::{collections::BTreeMap, sync::Arc};

use log::info;
use uuid::Uuid;

use super::{
    error::{DeployError, Result},
    model::{EncryptedSecret, EncryptionKey, SecretSummary},
    port::{Cipher, Repository},
    validation,
};

/// Encrypted key/value material scoped to an application.
pub struct SecretManager {
    repository: Arc<dyn Repository>,
    cipher: Arc<dyn Cipher>,
    key: Arc<EncryptionKey>,
}

impl SecretManager {
    pub fn new(repository: Arc<dyn Repository>, cipher: Arc<dyn Cipher>, key: Arc<EncryptionKey>) -> Self {
        Self {
            repository,
            cipher,
            key,
        }
    }

    pub async fn set(&self, app_id: Uuid, key: &str, plaintext: &str) -> Result<EncryptedSecret> {
        validation::secret_key(key)?;
        if plaintext.is_empty() {
            return Err(DeployError::validation("secret value must not be empty"));
        }
        let sealed = self
            .cipher
            .encrypt(plaintext.as_bytes(), &self.key)
            .map_err(|source| DeployError::Encryption {
                what: "secret",
                source,
            })?;
        let secret = self.repository.upsert_secret(app_id, key, sealed).await?;
        info!("Secret {} of application {} stored", key, app_id);
        Ok(secret)
    }

    pub async fn delete(&self, app_id: Uuid, key: &str) -> Result<()> {
        if self.repository.delete_secret(app_id, key).await? {
            info!("Secret {} of application {} deleted", key, app_id);
            Ok(())
        } else {
            Err(DeployError::not_found("secret", key))
        }
    }

    /// Keys and timestamps only.
    pub async fn list(&self, app_id: Uuid) -> Result<Vec<SecretSummary>> {
        Ok(self
            .repository
            .list_secrets(app_id)
            .await?
            .iter()
            .map(SecretSummary::from)
            .collect())
    }

    /// Decrypts every secret of the application. Only meant to feed one cluster injection.
    pub async fn bundle(&self, app_id: Uuid) -> Result<BTreeMap<String, String>> {
        let mut bundle = BTreeMap::new();
        for secret in self.repository.list_secrets(app_id).await? {
            let plaintext = self
                .cipher
                .decrypt(&secret.value_encrypted, &self.key)
                .map_err(|source| DeployError::Decryption {
                    what: "secret",
                    source,
                })?;
            let value = String::from_utf8(plaintext)
                .map_err(|_| DeployError::validation(format!("secret {} is not valid UTF-8", secret.key)))?;
            bundle.insert(secret.key, value);
        }
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::{crypto::AesGcmCipher, memory::MemoryRepository};

    fn manager(repository: Arc<MemoryRepository>, key: u8) -> SecretManager {
        SecretManager::new(
            repository,
            Arc::new(AesGcmCipher),
            Arc::new(EncryptionKey::from([key; 32])),
        )
    }

    #[tokio::test]
    async fn values_are_stored_encrypted_and_bundled_in_clear() {
        let repository = Arc::new(MemoryRepository::new());
        let secrets = manager(repository.clone(), 1);
        let app = Uuid::new_v4();

        let stored = secrets.set(app, "DB_PASSWORD", "hunter2").await.unwrap();
        assert_ne!(stored.value_encrypted, b"hunter2".to_vec());
        secrets.set(app, "API_KEY", "abc").await.unwrap();
        secrets.set(app, "API_KEY", "def").await.unwrap();

        let bundle = secrets.bundle(app).await.unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle["DB_PASSWORD"], "hunter2");
        assert_eq!(bundle["API_KEY"], "def");
    }

    #[tokio::test]
    async fn listing_never_exposes_values() {
        let repository = Arc::new(MemoryRepository::new());
        let secrets = manager(repository, 1);
        let app = Uuid::new_v4();
        secrets.set(app, "TOKEN", "very-secret-value").await.unwrap();

        let listed = secrets.list(app).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "TOKEN");
        let json = serde_json::to_value(&listed).unwrap();
        assert_eq!(
            json[0].as_object().unwrap().keys().cloned().collect::<Vec<_>>(),
            vec!["created_at", "key", "updated_at"]
        );
        assert!(!json.to_string().contains("very-secret-value"));
    }

    #[tokio::test]
    async fn bundle_with_rotated_key_fails() {
        let repository = Arc::new(MemoryRepository::new());
        let app = Uuid::new_v4();
        manager(repository.clone(), 1).set(app, "TOKEN", "x").await.unwrap();

        let result = manager(repository, 2).bundle(app).await;
        assert!(matches!(result, Err(DeployError::Decryption { what: "secret", .. })));
    }

    #[tokio::test]
    async fn invalid_input_and_missing_keys() {
        let secrets = manager(Arc::new(MemoryRepository::new()), 1);
        let app = Uuid::new_v4();
        assert!(matches!(secrets.set(app, "", "x").await, Err(DeployError::Validation(_))));
        assert!(matches!(secrets.set(app, "KEY", "").await, Err(DeployError::Validation(_))));
        assert!(matches!(secrets.delete(app, "KEY").await, Err(DeployError::NotFound { .. })));
    }
}
