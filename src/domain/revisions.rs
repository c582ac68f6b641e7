use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use uuid::Uuid;

use super::{
    error::{DeployError, RepositoryError, Result},
    model::{Application, Revision},
    port::Repository,
};

pub const DEFAULT_RETENTION: usize = 10;
pub const DEFAULT_LIST_LIMIT: usize = 10;

/// Immutable per-deploy snapshots of an application's spec.
#[derive(Clone)]
pub struct RevisionManager {
    repository: Arc<dyn Repository>,
    retention: usize,
}

impl RevisionManager {
    pub fn new(repository: Arc<dyn Repository>, retention: usize) -> Self {
        Self {
            repository,
            retention,
        }
    }

    /// Records the application's current spec as revision `current_revision + 1`.
    pub async fn snapshot(&self, app: &Application) -> Result<Revision> {
        let revision = Revision {
            id: Uuid::new_v4(),
            app_id: app.id,
            revision_number: app.current_revision + 1,
            spec: app.spec.clone(),
            created_at: Utc::now(),
        };
        self.repository
            .insert_revision(&revision)
            .await
            .map_err(|e| match e {
                RepositoryError::Duplicate(_) => DeployError::Conflict(format!(
                    "revision {} already exists for application {}",
                    revision.revision_number, app.name
                )),
                other => other.into(),
            })?;
        info!("Revision {} of {} recorded", revision.revision_number, app.name);
        Ok(revision)
    }

    pub async fn list(&self, app_id: Uuid, limit: Option<usize>) -> Result<Vec<Revision>> {
        let limit = limit.filter(|l| *l > 0).unwrap_or(DEFAULT_LIST_LIMIT);
        Ok(self.repository.list_revisions(app_id, limit).await?)
    }

    pub async fn get(&self, app_id: Uuid, number: u32) -> Result<Revision> {
        self.repository
            .get_revision(app_id, number)
            .await?
            .ok_or_else(|| DeployError::not_found("revision", number))
    }

    pub async fn latest(&self, app_id: Uuid) -> Result<Revision> {
        self.repository
            .latest_revision(app_id)
            .await?
            .ok_or_else(|| DeployError::not_found("revision", format!("latest of {app_id}")))
    }

    /// Drops the snapshot of a deploy that never reached the cluster so a retry can reuse its number.
    pub async fn discard(&self, revision: &Revision) {
        match self
            .repository
            .delete_revision(revision.app_id, revision.revision_number)
            .await
        {
            Ok(_) => debug!(
                "Discarded revision {} of application {}",
                revision.revision_number, revision.app_id
            ),
            Err(e) => warn!(
                "Can't discard revision {} of application {}: {}",
                revision.revision_number, revision.app_id, e
            ),
        }
    }

    /// Drops the newest revision when the application never advanced to it,
    /// which is what an interrupted deploy leaves behind.
    pub async fn discard_unreleased(&self, app_id: Uuid) {
        let current = match self.repository.get_application(app_id).await {
            Ok(Some(app)) => app.current_revision,
            Ok(None) => return,
            Err(e) => {
                warn!("Can't load application {} to clean its revisions: {}", app_id, e);
                return;
            }
        };
        match self.latest(app_id).await {
            Ok(revision) if revision.revision_number > current => self.discard(&revision).await,
            Ok(_) | Err(DeployError::NotFound { .. }) => {}
            Err(e) => warn!("Can't read latest revision of application {}: {}", app_id, e),
        }
    }

    /// Keeps the `retention` newest revisions. Failures are only logged.
    pub async fn prune(&self, app_id: Uuid) {
        self.prune_keeping(app_id, self.retention).await
    }

    pub async fn prune_keeping(&self, app_id: Uuid, keep: usize) {
        match self.repository.delete_old_revisions(app_id, keep).await {
            Ok(0) => {}
            Ok(removed) => info!("Pruned {} old revisions of application {}", removed, app_id),
            Err(e) => warn!("Can't prune revisions of application {}: {}", app_id, e),
        }
    }

    /// The revision a rollback should restore: the requested one, or the one before current.
    pub async fn rollback_target(&self, app: &Application, requested: Option<u32>) -> Result<Revision> {
        match requested {
            Some(number) => self.get(app.id, number).await,
            None if app.current_revision <= 1 => Err(DeployError::InvalidState(format!(
                "application {} has no previous revision to roll back to",
                app.name
            ))),
            None => self.get(app.id, app.current_revision - 1).await,
        }
    }
}
