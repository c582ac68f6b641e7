use std::sync::Arc;

use log::{info, warn};

use super::{
    error::{DeployError, Result},
    model::{Cluster, ClusterCredential, ClusterStatus, EncryptionKey},
    port::{Cipher, ClusterApi, ClusterConnector, Repository},
};

const DEFAULT_EKS_REGION: &str = "us-west-2";

/// Turns stored cluster credentials into short-lived cluster clients.
/// Nothing is cached: every call decrypts and connects again.
pub struct CredentialManager {
    cipher: Arc<dyn Cipher>,
    key: Arc<EncryptionKey>,
    connector: Arc<dyn ClusterConnector>,
}

impl CredentialManager {
    pub fn new(
        cipher: Arc<dyn Cipher>,
        key: Arc<EncryptionKey>,
        connector: Arc<dyn ClusterConnector>,
    ) -> Self {
        Self {
            cipher,
            key,
            connector,
        }
    }

    /// Renders the credential to kubeconfig bytes and encrypts them for storage.
    pub fn seal(&self, credential: &ClusterCredential) -> Result<Vec<u8>> {
        let kubeconfig = render_kubeconfig(credential)?;
        self.cipher
            .encrypt(kubeconfig.as_bytes(), &self.key)
            .map_err(|source| DeployError::Encryption {
                what: "cluster credential",
                source,
            })
    }

    pub fn open(&self, cluster: &Cluster) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(&cluster.credential_encrypted, &self.key)
            .map_err(|source| DeployError::Decryption {
                what: "cluster credential",
                source,
            })
    }

    pub async fn connect(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterApi>> {
        let credential = self.open(cluster)?;
        self.connect_with(&credential).await
    }

    async fn connect_with(&self, credential: &[u8]) -> Result<Arc<dyn ClusterApi>> {
        self.connector
            .connect(credential)
            .await
            .map_err(|e| DeployError::Connection(e.to_string()))
    }

    /// Fire-and-forget connectivity check run once after registration.
    /// Records `connected` plus the discovered endpoint, or `error` plus the reason.
    pub fn probe(self: &Arc<Self>, repository: Arc<dyn Repository>, cluster: Cluster) {
        let manager = self.clone();
        tokio::spawn(async move {
            let outcome = match manager.connect(&cluster).await {
                Ok(client) => client
                    .server_info()
                    .await
                    .map_err(|e| DeployError::from(e).to_string()),
                Err(e) => Err(e.to_string()),
            };
            let update = match outcome {
                Ok(info) => {
                    info!(
                        "Cluster {} reachable, version {} at {}",
                        cluster.name, info.version, info.endpoint
                    );
                    repository
                        .update_cluster_status(cluster.id, ClusterStatus::Connected, None, Some(info.endpoint))
                        .await
                }
                Err(message) => {
                    warn!("Cluster {} probe failed: {}", cluster.name, message);
                    repository
                        .update_cluster_status(cluster.id, ClusterStatus::Error, Some(message), None)
                        .await
                }
            };
            if let Err(e) = update {
                warn!("Can't record probe result for cluster {}: {}", cluster.id, e);
            }
        });
    }
}

pub fn render_kubeconfig(credential: &ClusterCredential) -> Result<String> {
    match credential {
        ClusterCredential::Kubeconfig(kubeconfig) => {
            if kubeconfig.trim().is_empty() {
                return Err(DeployError::validation("kubeconfig must not be empty"));
            }
            Ok(kubeconfig.clone())
        }
        ClusterCredential::Eks {
            cluster_name,
            endpoint,
            ca_data,
            region,
        } => {
            if cluster_name.is_empty() || endpoint.is_empty() || ca_data.is_empty() {
                return Err(DeployError::validation(
                    "cluster_name, endpoint and ca_data are required for an EKS cluster",
                ));
            }
            let region = region.as_deref().unwrap_or(DEFAULT_EKS_REGION);
            Ok(format!(
                r#"apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority-data: {ca_data}
    server: {endpoint}
  name: {cluster_name}
contexts:
- context:
    cluster: {cluster_name}
    user: rokku
  name: {cluster_name}
current-context: {cluster_name}
users:
- name: rokku
  user:
    exec:
      apiVersion: client.authentication.k8s.io/v1beta1
      command: aws
      args:
        - --region
        - {region}
        - eks
        - get-token
        - --cluster-name
        - {cluster_name}
        - --output
        - json
"#
            ))
        }
    }
}
