use std::{fmt, sync::Arc};

use chrono::Utc;
use log::{error, info, warn};
use uuid::Uuid;

use super::{
    credentials::CredentialManager,
    error::{DeployError, RepositoryError, Result},
    model::{
        Application, ApplicationPatch, ApplicationSpec, ApplicationStatus, AutoscalerStatus,
        AutoscalingRequest, Cluster, ClusterStatus, DeploymentStatus, DomainInfo, DomainStatus,
        EncryptionKey, LogOptions, NewApplication, NewCluster, Revision, SecretSummary,
        DEFAULT_NAMESPACE,
    },
    port::{Cipher, ClusterApi, ClusterConnector, LogStream, Repository},
    readout,
    reconciler::{secret_bundle_name, IngressSettings, ResourceReconciler},
    revisions::{RevisionManager, DEFAULT_RETENTION},
    runner::TaskRunner,
    secrets::SecretManager,
    validation,
};

const DEFAULT_MAX_CONCURRENT_DEPLOYS: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub revision_retention: usize,
    pub max_concurrent_deploys: usize,
    pub ingress: IngressSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            revision_retention: DEFAULT_RETENTION,
            max_concurrent_deploys: DEFAULT_MAX_CONCURRENT_DEPLOYS,
            ingress: IngressSettings::default(),
        }
    }
}

/// What started a background reconciliation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    Deploy,
    Rollback(u32),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Deploy => f.write_str("deploy"),
            Trigger::Rollback(number) => write!(f, "rollback to revision {number}"),
        }
    }
}

/// Entry point of the core. Synchronous checks happen in the caller's task,
/// cluster work for deploy and rollback runs on the background pool.
pub struct DeploymentService {
    repository: Arc<dyn Repository>,
    credentials: Arc<CredentialManager>,
    secrets: SecretManager,
    revisions: RevisionManager,
    reconciler: ResourceReconciler,
    runner: TaskRunner,
}

impl DeploymentService {
    pub fn new(
        repository: Arc<dyn Repository>,
        cipher: Arc<dyn Cipher>,
        connector: Arc<dyn ClusterConnector>,
        key: Arc<EncryptionKey>,
        settings: Settings,
    ) -> Self {
        let revisions = RevisionManager::new(repository.clone(), settings.revision_retention);
        Self {
            credentials: Arc::new(CredentialManager::new(cipher.clone(), key.clone(), connector)),
            secrets: SecretManager::new(repository.clone(), cipher, key),
            runner: TaskRunner::new(settings.max_concurrent_deploys, repository.clone(), revisions.clone()),
            revisions,
            reconciler: ResourceReconciler::new(settings.ingress),
            repository,
        }
    }

    /// Deploys and rollbacks still queued or running.
    pub fn background_tasks(&self) -> usize {
        self.runner.in_flight()
    }

    // Clusters

    pub async fn register_cluster(&self, request: NewCluster) -> Result<Cluster> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(DeployError::validation("cluster name is required"));
        }
        let cluster = Cluster {
            id: Uuid::new_v4(),
            name: name.to_string(),
            endpoint: None,
            credential_encrypted: self.credentials.seal(&request.credential)?,
            status: ClusterStatus::Pending,
            status_message: None,
            created_at: Utc::now(),
        };
        self.repository.insert_cluster(&cluster).await?;
        info!("Cluster {} registered as {}", cluster.name, cluster.id);
        self.credentials.probe(self.repository.clone(), cluster.clone());
        Ok(cluster)
    }

    pub async fn get_cluster(&self, id: Uuid) -> Result<Cluster> {
        self.repository
            .get_cluster(id)
            .await?
            .ok_or_else(|| DeployError::not_found("cluster", id))
    }

    pub async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        Ok(self.repository.list_clusters().await?)
    }

    /// Refused while applications still target the cluster.
    pub async fn delete_cluster(&self, id: Uuid) -> Result<Cluster> {
        let cluster = self.get_cluster(id).await?;
        let applications = self.repository.list_applications(id).await?;
        if !applications.is_empty() {
            return Err(DeployError::Conflict(format!(
                "cluster {} still hosts {} application(s)",
                cluster.name,
                applications.len()
            )));
        }
        self.repository.delete_cluster(id).await?;
        info!("Cluster {} deleted", cluster.name);
        Ok(cluster)
    }

    // Applications

    pub async fn create_app(&self, cluster_id: Uuid, request: NewApplication) -> Result<Application> {
        validation::dns_label("name", &request.name)?;
        let namespace = request
            .namespace
            .filter(|namespace| !namespace.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        validation::dns_label("namespace", &namespace)?;
        let spec = ApplicationSpec {
            image: request.image.trim().to_string(),
            replicas: request.replicas.unwrap_or(1),
            port: request.port,
            env_vars: request.env_vars,
            resources: request.resources.with_defaults(),
            health_check: request.health_check,
            autoscaling: None,
            domain: None,
        };
        validation::spec(&spec)?;

        self.get_cluster(cluster_id).await?;
        let taken = self
            .repository
            .list_applications(cluster_id)
            .await?
            .iter()
            .any(|app| app.name == request.name && app.namespace == namespace);
        if taken {
            return Err(DeployError::Conflict(format!(
                "application {} already exists in namespace {}",
                request.name, namespace
            )));
        }

        let now = Utc::now();
        let app = Application {
            id: Uuid::new_v4(),
            cluster_id,
            name: request.name,
            namespace,
            spec,
            current_revision: 0,
            status: ApplicationStatus::Created,
            status_message: None,
            domain_status: None,
            created_at: now,
            updated_at: now,
        };
        self.repository.insert_application(&app).await?;
        info!("Application {} created in {}/{}", app.id, app.namespace, app.name);
        Ok(app)
    }

    pub async fn get_app(&self, id: Uuid) -> Result<Application> {
        self.repository
            .get_application(id)
            .await?
            .ok_or_else(|| DeployError::not_found("application", id))
    }

    pub async fn list_apps(&self, cluster_id: Uuid) -> Result<Vec<Application>> {
        Ok(self.repository.list_applications(cluster_id).await?)
    }

    /// Stores the patched spec. Nothing reaches the cluster until the next deploy.
    pub async fn update_app(&self, id: Uuid, patch: ApplicationPatch) -> Result<Application> {
        let mut app = self.get_app(id).await?;
        patch.apply_to(&mut app.spec);
        validation::spec(&app.spec)?;
        self.repository.save_spec(id, &app.spec).await?;
        self.get_app(id).await
    }

    /// Marks the application `deploying` and hands the reconciliation to the background pool.
    pub async fn deploy(self: &Arc<Self>, id: Uuid) -> Result<Application> {
        let app = self.get_app(id).await?;
        let cluster = self.get_cluster(app.cluster_id).await?;
        let client = self.connect_or_fail(&app, &cluster).await?;
        self.start(&app, client, ApplicationStatus::Deploying, None, Trigger::Deploy)
            .await
    }

    /// Copies the target revision onto the application, then deploys it as a new revision.
    pub async fn rollback(self: &Arc<Self>, id: Uuid, revision: Option<u32>) -> Result<Application> {
        let app = self.get_app(id).await?;
        let cluster = self.get_cluster(app.cluster_id).await?;
        let target = self.revisions.rollback_target(&app, revision).await?;
        if let Some(domain) = &target.spec.domain {
            self.ensure_domain_free(app.id, domain).await?;
        }
        let client = self.connect_or_fail(&app, &cluster).await?;
        self.repository.save_spec(app.id, &target.spec).await?;
        info!(
            "Application {} restored to the spec of revision {}",
            app.name, target.revision_number
        );
        self.start(
            &app,
            client,
            ApplicationStatus::RollingBack,
            Some(format!("rolling back to revision {}", target.revision_number)),
            Trigger::Rollback(target.revision_number),
        )
        .await
    }

    /// Best-effort cluster cleanup, then removal of the record with its revisions and secrets.
    pub async fn delete_app(&self, id: Uuid) -> Result<Application> {
        let app = self.get_app(id).await?;
        match self.cluster_client(&app).await {
            Ok(cluster) => self.reconciler.remove_application(cluster.as_ref(), &app).await,
            Err(e) => warn!("Skipping cluster cleanup of {}: {}", app.name, e),
        }
        self.repository.delete_application(id).await?;
        info!("Application {} deleted", app.name);
        Ok(app)
    }

    // Secrets

    pub async fn set_secret(&self, app_id: Uuid, key: &str, value: &str) -> Result<SecretSummary> {
        self.get_app(app_id).await?;
        let secret = self.secrets.set(app_id, key, value).await?;
        Ok(SecretSummary::from(&secret))
    }

    pub async fn delete_secret(&self, app_id: Uuid, key: &str) -> Result<()> {
        self.get_app(app_id).await?;
        self.secrets.delete(app_id, key).await
    }

    pub async fn list_secrets(&self, app_id: Uuid) -> Result<Vec<SecretSummary>> {
        self.get_app(app_id).await?;
        self.secrets.list(app_id).await
    }

    // Revisions

    pub async fn list_revisions(&self, app_id: Uuid, limit: Option<usize>) -> Result<Vec<Revision>> {
        self.get_app(app_id).await?;
        self.revisions.list(app_id, limit).await
    }

    pub async fn get_revision(&self, app_id: Uuid, number: u32) -> Result<Revision> {
        self.get_app(app_id).await?;
        self.revisions.get(app_id, number).await
    }

    // Autoscaling

    /// Applied to the cluster right away, then stored.
    pub async fn set_autoscaling(&self, app_id: Uuid, request: AutoscalingRequest) -> Result<Application> {
        let autoscaling = validation::autoscaling(&request)?;
        let mut app = self.get_app(app_id).await?;
        let cluster = self.cluster_client(&app).await?;
        app.spec.autoscaling = Some(autoscaling);
        self.reconciler.ensure_autoscaler(cluster.as_ref(), &app).await?;
        self.repository.save_spec(app.id, &app.spec).await?;
        self.get_app(app.id).await
    }

    pub async fn get_autoscaling(&self, app_id: Uuid) -> Result<AutoscalerStatus> {
        let app = self.get_app(app_id).await?;
        let cluster = self.cluster_client(&app).await?;
        let hpa = cluster.autoscalers(&app.namespace).get(&app.name).await?;
        Ok(readout::autoscaler_status(hpa.as_ref()))
    }

    // Domains

    /// `None` or an empty domain removes the ingress and clears the domain.
    pub async fn set_domain(&self, app_id: Uuid, domain: Option<String>) -> Result<Application> {
        let domain = domain
            .map(|domain| domain.trim().to_ascii_lowercase())
            .filter(|domain| !domain.is_empty());
        if let Some(domain) = &domain {
            validation::hostname(domain)?;
        }
        let mut app = self.get_app(app_id).await?;
        if let Some(domain) = &domain {
            self.ensure_domain_free(app.id, domain).await?;
        }
        let cluster = self.cluster_client(&app).await?;
        app.spec.domain = domain.clone();
        self.reconciler.ensure_ingress(cluster.as_ref(), &app).await?;
        let status = domain.as_ref().map(|_| DomainStatus::Provisioning);
        self.repository.set_domain(app.id, domain, status).await?;
        self.get_app(app.id).await
    }

    pub async fn get_domain(&self, app_id: Uuid) -> Result<DomainInfo> {
        let app = self.get_app(app_id).await?;
        let ingress = match &app.spec.domain {
            Some(_) => {
                let cluster = self.cluster_client(&app).await?;
                let ingress = cluster.ingresses(&app.namespace).get(&app.name).await?;
                ingress.as_ref().map(readout::ingress_status)
            }
            None => None,
        };
        Ok(DomainInfo {
            domain: app.spec.domain,
            domain_status: app.domain_status,
            ingress,
        })
    }

    // Live readouts

    pub async fn get_status(&self, app_id: Uuid) -> Result<DeploymentStatus> {
        let app = self.get_app(app_id).await?;
        let cluster = self.cluster_client(&app).await?;
        let deployment = cluster
            .workloads(&app.namespace)
            .get(&app.name)
            .await?
            .ok_or_else(|| DeployError::not_found("deployment", &app.name))?;
        let pods = cluster.list_pods(&app.namespace, &app.name).await?;
        Ok(readout::deployment_status(&app.name, &deployment, &pods, Utc::now()))
    }

    /// Logs of the first pod of the application.
    pub async fn stream_logs(&self, app_id: Uuid, options: LogOptions) -> Result<LogStream> {
        let app = self.get_app(app_id).await?;
        let cluster = self.cluster_client(&app).await?;
        let pod = cluster
            .list_pods(&app.namespace, &app.name)
            .await?
            .into_iter()
            .find_map(|pod| pod.metadata.name)
            .ok_or_else(|| DeployError::not_found("pod", format!("app={}", app.name)))?;
        Ok(cluster.pod_logs(&app.namespace, &pod, options).await?)
    }

    async fn cluster_client(&self, app: &Application) -> Result<Arc<dyn ClusterApi>> {
        let cluster = self.get_cluster(app.cluster_id).await?;
        self.credentials.connect(&cluster).await
    }

    /// A credential that can't be opened fails the application before anything is queued.
    async fn connect_or_fail(&self, app: &Application, cluster: &Cluster) -> Result<Arc<dyn ClusterApi>> {
        match self.credentials.connect(cluster).await {
            Ok(client) => Ok(client),
            Err(e) => {
                self.fail(app, e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn ensure_domain_free(&self, app_id: Uuid, domain: &str) -> Result<()> {
        match self.repository.find_application_by_domain(domain).await? {
            Some(owner) if owner.id != app_id => Err(DeployError::Conflict(format!(
                "domain {} is already used by application {}",
                domain, owner.name
            ))),
            _ => Ok(()),
        }
    }

    async fn start(
        self: &Arc<Self>,
        app: &Application,
        cluster: Arc<dyn ClusterApi>,
        status: ApplicationStatus,
        message: Option<String>,
        trigger: Trigger,
    ) -> Result<Application> {
        self.repository.set_status(app.id, status, message).await?;
        let app = self.get_app(app.id).await?;
        let service = self.clone();
        let snapshot = app.clone();
        self.runner.submit(app.id, async move {
            service.reconcile(snapshot, cluster, trigger).await
        });
        Ok(app)
    }

    /// The background half of deploy and rollback. Every outcome lands on the application record.
    async fn reconcile(&self, app: Application, cluster: Arc<dyn ClusterApi>, trigger: Trigger) {
        info!("Starting {} of {} in {}", trigger, app.name, app.namespace);
        let revision = match self.revisions.snapshot(&app).await {
            Ok(revision) => revision,
            Err(e) => {
                self.fail(&app, format!("failed to create revision: {e}")).await;
                return;
            }
        };
        if let Err(e) = self.apply(&app, cluster.as_ref()).await {
            self.revisions.discard(&revision).await;
            self.fail(&app, e.to_string()).await;
            return;
        }
        if let Err(e) = self.mark_running(app.id, revision.revision_number).await {
            error!("Can't record successful {} of {}: {}", trigger, app.name, e);
            self.revisions.discard_unreleased(app.id).await;
            self.fail(&app, format!("failed to record revision {}: {e}", revision.revision_number))
                .await;
            return;
        }
        info!("{} of {} done, now at revision {}", trigger, app.name, revision.revision_number);

        if let Err(e) = self.sync_ingress(&app, cluster.as_ref()).await {
            warn!("Can't record ingress state of {}: {}", app.name, e);
        }
        self.revisions.prune(app.id).await;
    }

    async fn apply(&self, app: &Application, cluster: &dyn ClusterApi) -> Result<()> {
        if let Err(e) = self.reconciler.ensure_namespace(cluster, &app.namespace).await {
            warn!("Can't provision namespace {}: {}", app.namespace, e);
        }
        let secret_bundle = {
            let bundle = self.secrets.bundle(app.id).await?;
            if bundle.is_empty() {
                None
            } else {
                self.reconciler.ensure_secret_bundle(cluster, app, &bundle).await?;
                Some(secret_bundle_name(app))
            }
        };
        self.reconciler
            .ensure_workload(cluster, app, secret_bundle.as_deref())
            .await?;
        self.reconciler.ensure_endpoint(cluster, app).await?;
        self.reconciler.ensure_autoscaler(cluster, app).await?;
        Ok(())
    }

    async fn mark_running(&self, id: Uuid, revision: u32) -> Result<(), RepositoryError> {
        self.repository.set_current_revision(id, revision).await?;
        self.repository
            .set_status(id, ApplicationStatus::Running, None)
            .await
    }

    /// A failing ingress only leaves a warning on an otherwise running application.
    async fn sync_ingress(&self, app: &Application, cluster: &dyn ClusterApi) -> Result<(), RepositoryError> {
        match app.spec.domain.as_deref() {
            Some(domain) => match self.reconciler.ensure_ingress(cluster, app).await {
                Ok(_) => {
                    self.repository
                        .set_domain(app.id, Some(domain.to_string()), Some(DomainStatus::Active))
                        .await
                }
                Err(e) => {
                    warn!("Ingress of {} not synced: {}", app.name, e);
                    self.repository
                        .set_status(
                            app.id,
                            ApplicationStatus::Running,
                            Some(format!("warning: failed to sync ingress: {e}")),
                        )
                        .await
                }
            },
            None if app.domain_status.is_some() => {
                if let Err(e) = self.reconciler.ensure_ingress(cluster, app).await {
                    warn!("Can't remove ingress of {}: {}", app.name, e);
                }
                self.repository.set_domain(app.id, None, None).await
            }
            None => Ok(()),
        }
    }

    async fn fail(&self, app: &Application, message: String) {
        error!("Application {} failed: {}", app.name, message);
        if let Err(e) = self
            .repository
            .set_status(app.id, ApplicationStatus::Failed, Some(message))
            .await
        {
            warn!("Can't record failure of {}: {}", app.name, e);
        }
    }
}
