use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use k8s_openapi::api::{
    apps::v1::Deployment,
    autoscaling::v2::HorizontalPodAutoscaler,
    core::v1::{Namespace, Pod, Secret, Service},
    networking::v1::Ingress,
};
use uuid::Uuid;

use super::{
    error::{CipherError, ClusterApiError, RepositoryError},
    model::{
        Application, ApplicationSpec, ApplicationStatus, Cluster, ClusterInfo, ClusterStatus,
        DomainStatus, EncryptedSecret, EncryptionKey, LogOptions, Revision,
    },
};

pub type LogStream = BoxStream<'static, Result<Bytes, ClusterApiError>>;

/// Persistent store for applications, revisions, secrets and clusters.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn insert_application(&self, application: &Application) -> Result<(), RepositoryError>;

    async fn get_application(&self, id: Uuid) -> Result<Option<Application>, RepositoryError>;

    async fn list_applications(&self, cluster_id: Uuid) -> Result<Vec<Application>, RepositoryError>;

    async fn find_application_by_domain(
        &self,
        domain: &str,
    ) -> Result<Option<Application>, RepositoryError>;

    async fn save_spec(&self, id: Uuid, spec: &ApplicationSpec) -> Result<(), RepositoryError>;

    async fn set_status(
        &self,
        id: Uuid,
        status: ApplicationStatus,
        message: Option<String>,
    ) -> Result<(), RepositoryError>;

    async fn set_current_revision(&self, id: Uuid, revision: u32) -> Result<(), RepositoryError>;

    async fn set_domain(
        &self,
        id: Uuid,
        domain: Option<String>,
        status: Option<DomainStatus>,
    ) -> Result<(), RepositoryError>;

    /// Removes the application together with its revisions and secrets.
    async fn delete_application(&self, id: Uuid) -> Result<(), RepositoryError>;

    /// Fails with `RepositoryError::Duplicate` when `(app_id, revision_number)` already exists.
    async fn insert_revision(&self, revision: &Revision) -> Result<(), RepositoryError>;

    /// Newest first.
    async fn list_revisions(&self, app_id: Uuid, limit: usize) -> Result<Vec<Revision>, RepositoryError>;

    async fn get_revision(&self, app_id: Uuid, number: u32) -> Result<Option<Revision>, RepositoryError>;

    async fn latest_revision(&self, app_id: Uuid) -> Result<Option<Revision>, RepositoryError>;

    async fn delete_revision(&self, app_id: Uuid, number: u32) -> Result<bool, RepositoryError>;

    /// Keeps the `keep` highest-numbered revisions and returns how many were deleted.
    async fn delete_old_revisions(&self, app_id: Uuid, keep: usize) -> Result<usize, RepositoryError>;

    async fn upsert_secret(
        &self,
        app_id: Uuid,
        key: &str,
        value_encrypted: Vec<u8>,
    ) -> Result<EncryptedSecret, RepositoryError>;

    /// Ordered by key.
    async fn list_secrets(&self, app_id: Uuid) -> Result<Vec<EncryptedSecret>, RepositoryError>;

    async fn delete_secret(&self, app_id: Uuid, key: &str) -> Result<bool, RepositoryError>;

    async fn insert_cluster(&self, cluster: &Cluster) -> Result<(), RepositoryError>;

    async fn get_cluster(&self, id: Uuid) -> Result<Option<Cluster>, RepositoryError>;

    async fn list_clusters(&self) -> Result<Vec<Cluster>, RepositoryError>;

    async fn update_cluster_status(
        &self,
        id: Uuid,
        status: ClusterStatus,
        message: Option<String>,
        endpoint: Option<String>,
    ) -> Result<(), RepositoryError>;

    async fn delete_cluster(&self, id: Uuid) -> Result<(), RepositoryError>;
}

/// Get/create/replace/delete of one resource kind inside one namespace.
#[async_trait]
pub trait ResourceApi<K>: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<K>, ClusterApiError>;

    async fn create(&self, resource: &K) -> Result<K, ClusterApiError>;

    /// Full replacement guarded by the resource version carried in `resource`.
    async fn replace(&self, name: &str, resource: &K) -> Result<K, ClusterApiError>;

    /// Returns `false` when there was nothing to delete.
    async fn delete(&self, name: &str) -> Result<bool, ClusterApiError>;
}

/// A connected cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    fn namespaces(&self) -> Box<dyn ResourceApi<Namespace>>;

    fn workloads(&self, namespace: &str) -> Box<dyn ResourceApi<Deployment>>;

    fn endpoints(&self, namespace: &str) -> Box<dyn ResourceApi<Service>>;

    fn autoscalers(&self, namespace: &str) -> Box<dyn ResourceApi<HorizontalPodAutoscaler>>;

    fn ingresses(&self, namespace: &str) -> Box<dyn ResourceApi<Ingress>>;

    fn secrets(&self, namespace: &str) -> Box<dyn ResourceApi<Secret>>;

    async fn server_info(&self) -> Result<ClusterInfo, ClusterApiError>;

    /// Pods carrying the `app=<app>` label.
    async fn list_pods(&self, namespace: &str, app: &str) -> Result<Vec<Pod>, ClusterApiError>;

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        options: LogOptions,
    ) -> Result<LogStream, ClusterApiError>;
}

/// Builds a cluster client out of decrypted credential material.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, credential: &[u8]) -> Result<Arc<dyn ClusterApi>, ClusterApiError>;
}

/// Authenticated encryption.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CipherError>;

    fn decrypt(&self, ciphertext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CipherError>;
}
