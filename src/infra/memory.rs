use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::domain::{
    error::RepositoryError,
    model::{
        Application, ApplicationSpec, ApplicationStatus, Cluster, ClusterStatus, DomainStatus,
        EncryptedSecret, Revision,
    },
    port::Repository,
};

#[derive(Default)]
struct State {
    applications: HashMap<Uuid, Application>,
    revisions: BTreeMap<(Uuid, u32), Revision>,
    secrets: BTreeMap<(Uuid, String), EncryptedSecret>,
    clusters: HashMap<Uuid, Cluster>,
}

/// Process-local `Repository`. Data lives as long as the process.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, RepositoryError> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Backend(anyhow!("memory repository lock poisoned")))
    }

    fn application<'a>(
        state: &'a mut State,
        id: Uuid,
    ) -> Result<&'a mut Application, RepositoryError> {
        state
            .applications
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::Backend(anyhow!("application {id} does not exist")))
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn insert_application(&self, application: &Application) -> Result<(), RepositoryError> {
        let mut state = self.state()?;
        if state.applications.contains_key(&application.id) {
            return Err(RepositoryError::Duplicate(format!("application {}", application.id)));
        }
        state.applications.insert(application.id, application.clone());
        Ok(())
    }

    async fn get_application(&self, id: Uuid) -> Result<Option<Application>, RepositoryError> {
        Ok(self.state()?.applications.get(&id).cloned())
    }

    async fn list_applications(&self, cluster_id: Uuid) -> Result<Vec<Application>, RepositoryError> {
        let mut applications: Vec<Application> = self
            .state()?
            .applications
            .values()
            .filter(|app| app.cluster_id == cluster_id)
            .cloned()
            .collect();
        applications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(applications)
    }

    async fn find_application_by_domain(
        &self,
        domain: &str,
    ) -> Result<Option<Application>, RepositoryError> {
        Ok(self
            .state()?
            .applications
            .values()
            .find(|app| app.spec.domain.as_deref() == Some(domain))
            .cloned())
    }

    async fn save_spec(&self, id: Uuid, spec: &ApplicationSpec) -> Result<(), RepositoryError> {
        let mut state = self.state()?;
        let app = Self::application(&mut state, id)?;
        app.spec = spec.clone();
        app.updated_at = Utc::now();
        Ok(())
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: ApplicationStatus,
        message: Option<String>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state()?;
        let app = Self::application(&mut state, id)?;
        app.status = status;
        app.status_message = message;
        app.updated_at = Utc::now();
        Ok(())
    }

    async fn set_current_revision(&self, id: Uuid, revision: u32) -> Result<(), RepositoryError> {
        let mut state = self.state()?;
        let app = Self::application(&mut state, id)?;
        app.current_revision = revision;
        app.updated_at = Utc::now();
        Ok(())
    }

    async fn set_domain(
        &self,
        id: Uuid,
        domain: Option<String>,
        status: Option<DomainStatus>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state()?;
        let app = Self::application(&mut state, id)?;
        app.spec.domain = domain;
        app.domain_status = status;
        app.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_application(&self, id: Uuid) -> Result<(), RepositoryError> {
        let mut state = self.state()?;
        state.applications.remove(&id);
        state.revisions.retain(|(app_id, _), _| *app_id != id);
        state.secrets.retain(|(app_id, _), _| *app_id != id);
        Ok(())
    }

    async fn insert_revision(&self, revision: &Revision) -> Result<(), RepositoryError> {
        let mut state = self.state()?;
        let key = (revision.app_id, revision.revision_number);
        if state.revisions.contains_key(&key) {
            return Err(RepositoryError::Duplicate(format!(
                "revision {} of application {}",
                revision.revision_number, revision.app_id
            )));
        }
        state.revisions.insert(key, revision.clone());
        Ok(())
    }

    async fn list_revisions(&self, app_id: Uuid, limit: usize) -> Result<Vec<Revision>, RepositoryError> {
        Ok(self
            .state()?
            .revisions
            .range((app_id, 0)..=(app_id, u32::MAX))
            .rev()
            .take(limit)
            .map(|(_, revision)| revision.clone())
            .collect())
    }

    async fn get_revision(&self, app_id: Uuid, number: u32) -> Result<Option<Revision>, RepositoryError> {
        Ok(self.state()?.revisions.get(&(app_id, number)).cloned())
    }

    async fn latest_revision(&self, app_id: Uuid) -> Result<Option<Revision>, RepositoryError> {
        Ok(self
            .state()?
            .revisions
            .range((app_id, 0)..=(app_id, u32::MAX))
            .next_back()
            .map(|(_, revision)| revision.clone()))
    }

    async fn delete_revision(&self, app_id: Uuid, number: u32) -> Result<bool, RepositoryError> {
        Ok(self.state()?.revisions.remove(&(app_id, number)).is_some())
    }

    async fn delete_old_revisions(&self, app_id: Uuid, keep: usize) -> Result<usize, RepositoryError> {
        let mut state = self.state()?;
        let stale: Vec<(Uuid, u32)> = state
            .revisions
            .range((app_id, 0)..=(app_id, u32::MAX))
            .rev()
            .skip(keep)
            .map(|(key, _)| *key)
            .collect();
        for key in &stale {
            state.revisions.remove(key);
        }
        Ok(stale.len())
    }

    async fn upsert_secret(
        &self,
        app_id: Uuid,
        key: &str,
        value_encrypted: Vec<u8>,
    ) -> Result<EncryptedSecret, RepositoryError> {
        let mut state = self.state()?;
        let now = Utc::now();
        let secret = state
            .secrets
            .entry((app_id, key.to_string()))
            .and_modify(|secret| {
                secret.value_encrypted = value_encrypted.clone();
                secret.updated_at = now;
            })
            .or_insert_with(|| EncryptedSecret {
                id: Uuid::new_v4(),
                app_id,
                key: key.to_string(),
                value_encrypted: value_encrypted.clone(),
                created_at: now,
                updated_at: now,
            });
        Ok(secret.clone())
    }

    async fn list_secrets(&self, app_id: Uuid) -> Result<Vec<EncryptedSecret>, RepositoryError> {
        Ok(self
            .state()?
            .secrets
            .iter()
            .filter(|((owner, _), _)| *owner == app_id)
            .map(|(_, secret)| secret.clone())
            .collect())
    }

    async fn delete_secret(&self, app_id: Uuid, key: &str) -> Result<bool, RepositoryError> {
        Ok(self
            .state()?
            .secrets
            .remove(&(app_id, key.to_string()))
            .is_some())
    }

    async fn insert_cluster(&self, cluster: &Cluster) -> Result<(), RepositoryError> {
        let mut state = self.state()?;
        if state.clusters.contains_key(&cluster.id) {
            return Err(RepositoryError::Duplicate(format!("cluster {}", cluster.id)));
        }
        state.clusters.insert(cluster.id, cluster.clone());
        Ok(())
    }

    async fn get_cluster(&self, id: Uuid) -> Result<Option<Cluster>, RepositoryError> {
        Ok(self.state()?.clusters.get(&id).cloned())
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>, RepositoryError> {
        let mut clusters: Vec<Cluster> = self.state()?.clusters.values().cloned().collect();
        clusters.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(clusters)
    }

    async fn update_cluster_status(
        &self,
        id: Uuid,
        status: ClusterStatus,
        message: Option<String>,
        endpoint: Option<String>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state()?;
        let cluster = state
            .clusters
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::Backend(anyhow!("cluster {id} does not exist")))?;
        cluster.status = status;
        cluster.status_message = message;
        if endpoint.is_some() {
            cluster.endpoint = endpoint;
        }
        Ok(())
    }

    async fn delete_cluster(&self, id: Uuid) -> Result<(), RepositoryError> {
        self.state()?.clusters.remove(&id);
        Ok(())
    }
}
