use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::CipherError;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_CPU_REQUEST: &str = "100m";
pub const DEFAULT_CPU_LIMIT: &str = "500m";
pub const DEFAULT_MEMORY_REQUEST: &str = "128Mi";
pub const DEFAULT_MEMORY_LIMIT: &str = "256Mi";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Created,
    Pending,
    Deploying,
    Running,
    Failed,
    RollingBack,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Created => "created",
            ApplicationStatus::Pending => "pending",
            ApplicationStatus::Deploying => "deploying",
            ApplicationStatus::Running => "running",
            ApplicationStatus::Failed => "failed",
            ApplicationStatus::RollingBack => "rolling_back",
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStatus {
    Provisioning,
    Active,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Pending,
    Connected,
    Error,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
}

impl ResourceRequirements {
    pub fn with_defaults(self) -> Self {
        Self {
            cpu_request: self.cpu_request.or_else(|| Some(DEFAULT_CPU_REQUEST.to_string())),
            cpu_limit: self.cpu_limit.or_else(|| Some(DEFAULT_CPU_LIMIT.to_string())),
            memory_request: self
                .memory_request
                .or_else(|| Some(DEFAULT_MEMORY_REQUEST.to_string())),
            memory_limit: self
                .memory_limit
                .or_else(|| Some(DEFAULT_MEMORY_LIMIT.to_string())),
        }
    }

    /// Field-wise overlay: a present value replaces, an absent one preserves.
    pub fn merge(&mut self, patch: ResourceRequirements) {
        if patch.cpu_request.is_some() {
            self.cpu_request = patch.cpu_request;
        }
        if patch.cpu_limit.is_some() {
            self.cpu_limit = patch.cpu_limit;
        }
        if patch.memory_request.is_some() {
            self.memory_request = patch.memory_request;
        }
        if patch.memory_limit.is_some() {
            self.memory_limit = patch.memory_limit;
        }
    }

    pub fn is_empty(&self) -> bool {
        [
            &self.cpu_request,
            &self.cpu_limit,
            &self.memory_request,
            &self.memory_limit,
        ]
        .iter()
        .all(|value| value.as_deref().map_or(true, str::is_empty))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub path: String,
    pub port: Option<u16>,
    pub initial_delay_seconds: Option<i32>,
    pub period_seconds: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Autoscaling {
    pub enabled: bool,
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub target_cpu_percent: Option<i32>,
    pub target_memory_percent: Option<i32>,
}

/// Everything about an application that a revision snapshots and a rollback restores.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub image: String,
    pub replicas: i32,
    pub port: Option<u16>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    pub health_check: Option<HealthCheck>,
    pub autoscaling: Option<Autoscaling>,
    pub domain: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub name: String,
    pub namespace: String,
    #[serde(flatten)]
    pub spec: ApplicationSpec,
    pub current_revision: u32,
    pub status: ApplicationStatus,
    pub status_message: Option<String>,
    pub domain_status: Option<DomainStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request shape of `create_app`. Unset fields fall back to platform defaults.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewApplication {
    pub name: String,
    pub namespace: Option<String>,
    pub image: String,
    pub replicas: Option<i32>,
    pub port: Option<u16>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    pub health_check: Option<HealthCheck>,
}

/// Partial update of an application. Every field is optional:
/// present replaces the stored value, absent (or null) preserves it.
/// `resources` is merged field by field, `env_vars` replaces the whole map.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ApplicationPatch {
    pub image: Option<String>,
    pub replicas: Option<i32>,
    pub port: Option<u16>,
    pub env_vars: Option<BTreeMap<String, String>>,
    pub resources: Option<ResourceRequirements>,
    pub health_check: Option<HealthCheck>,
}

impl ApplicationPatch {
    pub fn apply_to(self, spec: &mut ApplicationSpec) {
        if let Some(image) = self.image {
            spec.image = image;
        }
        if let Some(replicas) = self.replicas {
            spec.replicas = replicas;
        }
        if self.port.is_some() {
            spec.port = self.port;
        }
        if let Some(env_vars) = self.env_vars {
            spec.env_vars = env_vars;
        }
        if let Some(resources) = self.resources {
            spec.resources.merge(resources);
        }
        if self.health_check.is_some() {
            spec.health_check = self.health_check;
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AutoscalingRequest {
    pub enabled: bool,
    pub min_replicas: Option<i32>,
    pub max_replicas: Option<i32>,
    pub target_cpu_percent: Option<i32>,
    pub target_memory_percent: Option<i32>,
}

/// Immutable snapshot of an application's spec taken when a deploy begins.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub id: Uuid,
    pub app_id: Uuid,
    pub revision_number: u32,
    #[serde(flatten)]
    pub spec: ApplicationSpec,
    pub created_at: DateTime<Utc>,
}

/// Stored form of a secret. The value never leaves this struct in clear.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedSecret {
    pub id: Uuid,
    pub app_id: Uuid,
    pub key: String,
    pub value_encrypted: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What read APIs are allowed to see of a secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SecretSummary {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&EncryptedSecret> for SecretSummary {
    fn from(secret: &EncryptedSecret) -> Self {
        SecretSummary {
            key: secret.key.clone(),
            created_at: secret.created_at,
            updated_at: secret.updated_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Cluster {
    pub id: Uuid,
    pub name: String,
    pub endpoint: Option<String>,
    #[serde(skip)]
    pub credential_encrypted: Vec<u8>,
    pub status: ClusterStatus,
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Connection material supplied when registering a cluster.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterCredential {
    Kubeconfig(String),
    /// EKS cluster reached through the ambient IAM identity (`aws eks get-token`).
    Eks {
        cluster_name: String,
        endpoint: String,
        ca_data: String,
        region: Option<String>,
    },
}

#[derive(Clone, Deserialize)]
pub struct NewCluster {
    pub name: String,
    pub credential: ClusterCredential,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterInfo {
    pub endpoint: String,
    pub version: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeploymentStatus {
    pub name: String,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub desired_replicas: i32,
    pub status: String,
    pub pods: Vec<PodStatus>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PodStatus {
    pub name: String,
    pub phase: String,
    pub ready: bool,
    pub restarts: i32,
    pub age: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AutoscalerStatus {
    pub enabled: bool,
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub current_replicas: i32,
    pub desired_replicas: i32,
    pub current_cpu_percent: Option<i32>,
    pub current_memory_percent: Option<i32>,
    pub target_cpu_percent: Option<i32>,
    pub target_memory_percent: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngressStatus {
    pub domain: String,
    pub tls_enabled: bool,
    pub ready: bool,
    pub load_balancer: Option<String>,
    pub hosts: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DomainInfo {
    pub domain: Option<String>,
    pub domain_status: Option<DomainStatus>,
    pub ingress: Option<IngressStatus>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct LogOptions {
    #[serde(default)]
    pub follow: bool,
    pub tail_lines: Option<i64>,
}

/// Process-wide key for credential and secret encryption.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn from_hex(value: &str) -> Result<Self, CipherError> {
        let bytes = hex::decode(value.trim()).map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| CipherError::InvalidKey(format!("got {} bytes", bytes.len())))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for EncryptionKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ApplicationSpec {
        ApplicationSpec {
            image: "nginx:latest".to_string(),
            replicas: 2,
            port: Some(80),
            env_vars: BTreeMap::from([("MODE".to_string(), "prod".to_string())]),
            resources: ResourceRequirements::default().with_defaults(),
            health_check: None,
            autoscaling: None,
            domain: None,
        }
    }

    #[test]
    fn patch_replaces_present_fields_and_preserves_absent_ones() {
        let mut spec = spec();
        let patch: ApplicationPatch = serde_json::from_value(serde_json::json!({
            "replicas": 3,
            "image": null,
            "resources": { "cpu_limit": "1" }
        }))
        .unwrap();
        patch.apply_to(&mut spec);

        assert_eq!(spec.replicas, 3);
        assert_eq!(spec.image, "nginx:latest");
        assert_eq!(spec.port, Some(80));
        assert_eq!(spec.env_vars.get("MODE").map(String::as_str), Some("prod"));
        assert_eq!(spec.resources.cpu_limit.as_deref(), Some("1"));
        assert_eq!(spec.resources.cpu_request.as_deref(), Some(DEFAULT_CPU_REQUEST));
    }

    #[test]
    fn env_vars_patch_replaces_whole_map() {
        let mut spec = spec();
        ApplicationPatch {
            env_vars: Some(BTreeMap::from([("OTHER".to_string(), "1".to_string())])),
            ..Default::default()
        }
        .apply_to(&mut spec);
        assert_eq!(spec.env_vars.len(), 1);
        assert!(spec.env_vars.contains_key("OTHER"));
    }

    #[test]
    fn encryption_key_requires_32_bytes() {
        assert!(EncryptionKey::from_hex(&"ab".repeat(32)).is_ok());
        assert!(matches!(
            EncryptionKey::from_hex(&"ab".repeat(16)),
            Err(CipherError::InvalidKey(_))
        ));
        assert!(matches!(EncryptionKey::from_hex("not-hex"), Err(CipherError::InvalidKey(_))));
        assert_eq!(
            format!("{:?}", EncryptionKey::from([7u8; 32])),
            "EncryptionKey(<redacted>)"
        );
    }

    #[test]
    fn application_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(ApplicationStatus::RollingBack).unwrap(),
            serde_json::json!("rolling_back")
        );
    }
}
