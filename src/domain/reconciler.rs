use std::{collections::BTreeMap, fmt};

use k8s_openapi::api::{
    apps::v1::Deployment,
    autoscaling::v2::HorizontalPodAutoscaler,
    core::v1::{Namespace, Secret, Service},
    networking::v1::Ingress,
};
use kube::Resource;
use log::{debug, info, warn};
use map_macro::btree_map;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::{
    error::ClusterApiError,
    model::{Application, Autoscaling},
    port::{ClusterApi, ResourceApi},
};

pub const MANAGED_BY: &str = "rokku";
pub const RESERVED_NAMESPACES: [&str; 3] = ["default", "kube-system", "kube-public"];

const DEFAULT_PROBE_INITIAL_DELAY: i32 = 10;
const DEFAULT_PROBE_PERIOD: i32 = 30;
const DEFAULT_CPU_TARGET_PERCENT: i32 = 80;
const DEFAULT_INGRESS_PORT: u16 = 80;

/// What an ensure call did to the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Deleted,
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Deleted => "deleted",
            Outcome::Skipped => "skipped",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressSettings {
    pub class_name: String,
    pub cluster_issuer: String,
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            class_name: "nginx".to_string(),
            cluster_issuer: "letsencrypt-prod".to_string(),
        }
    }
}

pub fn secret_bundle_name(app: &Application) -> String {
    format!("{}-secrets", app.name)
}

pub fn tls_secret_name(app: &Application) -> String {
    format!("{}-tls", app.name)
}

fn labels(app: &Application) -> BTreeMap<&'static str, String> {
    btree_map! {
        "app" => app.name.clone(),
        "managed-by" => MANAGED_BY.to_string(),
    }
}

fn from_manifest<K: DeserializeOwned>(manifest: Value) -> Result<K, ClusterApiError> {
    serde_json::from_value(manifest)
        .map_err(|e| ClusterApiError::Request(format!("invalid manifest: {e}")))
}

/// Liveness and readiness share this probe. None when there is no path or no port to probe.
fn probe(app: &Application) -> Option<Value> {
    let health = app.spec.health_check.as_ref().filter(|h| !h.path.is_empty())?;
    let port = health.port.or(app.spec.port)?;
    Some(json!({
        "httpGet": {
            "path": health.path,
            "port": port,
        },
        "initialDelaySeconds": health.initial_delay_seconds.unwrap_or(DEFAULT_PROBE_INITIAL_DELAY),
        "periodSeconds": health.period_seconds.unwrap_or(DEFAULT_PROBE_PERIOD),
    }))
}

pub fn workload_manifest(
    app: &Application,
    secret_bundle: Option<&str>,
) -> Result<Deployment, ClusterApiError> {
    let env: Vec<Value> = app
        .spec
        .env_vars
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    let mut container = json!({
        "name": app.name,
        "image": app.spec.image,
        "env": env,
    });
    if let Some(secret) = secret_bundle {
        container["envFrom"] = json!([{ "secretRef": { "name": secret } }]);
    }
    if let Some(port) = app.spec.port {
        container["ports"] = json!([{ "containerPort": port }]);
    }
    let resources = &app.spec.resources;
    if !resources.is_empty() {
        let pick = |entries: [(&str, &Option<String>); 2]| -> BTreeMap<String, String> {
            entries
                .into_iter()
                .filter_map(|(name, value)| {
                    value
                        .as_ref()
                        .filter(|v| !v.is_empty())
                        .map(|v| (name.to_string(), v.clone()))
                })
                .collect()
        };
        container["resources"] = json!({
            "requests": pick([("cpu", &resources.cpu_request), ("memory", &resources.memory_request)]),
            "limits": pick([("cpu", &resources.cpu_limit), ("memory", &resources.memory_limit)]),
        });
    }
    if let Some(probe) = probe(app) {
        container["livenessProbe"] = probe.clone();
        container["readinessProbe"] = probe;
    }

    from_manifest(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": app.name,
            "namespace": app.namespace,
            "labels": labels(app),
        },
        "spec": {
            "replicas": app.spec.replicas,
            "selector": {
                "matchLabels": { "app": app.name },
            },
            "template": {
                "metadata": {
                    "labels": { "app": app.name },
                },
                "spec": {
                    "containers": [container],
                },
            },
        },
    }))
}

pub fn endpoint_manifest(app: &Application, port: u16) -> Result<Service, ClusterApiError> {
    from_manifest(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": app.name,
            "namespace": app.namespace,
            "labels": labels(app),
        },
        "spec": {
            "type": "ClusterIP",
            "selector": { "app": app.name },
            "ports": [{
                "name": "http",
                "port": port,
                "targetPort": port,
            }],
        },
    }))
}

pub fn autoscaler_manifest(
    app: &Application,
    hpa: &Autoscaling,
) -> Result<HorizontalPodAutoscaler, ClusterApiError> {
    let utilization = |resource: &str, percent: i32| {
        json!({
            "type": "Resource",
            "resource": {
                "name": resource,
                "target": {
                    "type": "Utilization",
                    "averageUtilization": percent,
                },
            },
        })
    };
    let mut metrics: Vec<Value> = [
        ("cpu", hpa.target_cpu_percent),
        ("memory", hpa.target_memory_percent),
    ]
    .into_iter()
    .filter_map(|(resource, target)| target.filter(|t| *t > 0).map(|t| utilization(resource, t)))
    .collect();
    if metrics.is_empty() {
        metrics.push(utilization("cpu", DEFAULT_CPU_TARGET_PERCENT));
    }

    from_manifest(json!({
        "apiVersion": "autoscaling/v2",
        "kind": "HorizontalPodAutoscaler",
        "metadata": {
            "name": app.name,
            "namespace": app.namespace,
            "labels": labels(app),
        },
        "spec": {
            "scaleTargetRef": {
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "name": app.name,
            },
            "minReplicas": hpa.min_replicas,
            "maxReplicas": hpa.max_replicas,
            "metrics": metrics,
        },
    }))
}

pub fn ingress_manifest(
    app: &Application,
    domain: &str,
    settings: &IngressSettings,
) -> Result<Ingress, ClusterApiError> {
    from_manifest(json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": app.name,
            "namespace": app.namespace,
            "labels": labels(app),
            "annotations": {
                "cert-manager.io/cluster-issuer": settings.cluster_issuer,
                "nginx.ingress.kubernetes.io/ssl-redirect": "true",
            },
        },
        "spec": {
            "ingressClassName": settings.class_name,
            "tls": [{
                "hosts": [domain],
                "secretName": tls_secret_name(app),
            }],
            "rules": [{
                "host": domain,
                "http": {
                    "paths": [{
                        "path": "/",
                        "pathType": "Prefix",
                        "backend": {
                            "service": {
                                "name": app.name,
                                "port": { "number": app.spec.port.unwrap_or(DEFAULT_INGRESS_PORT) },
                            },
                        },
                    }],
                },
            }],
        },
    }))
}

pub fn secret_bundle_manifest(
    app: &Application,
    data: &BTreeMap<String, String>,
) -> Result<Secret, ClusterApiError> {
    from_manifest(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": secret_bundle_name(app),
            "namespace": app.namespace,
            "labels": labels(app),
        },
        "type": "Opaque",
        "stringData": data,
    }))
}

/// Get, then create when absent or replace carrying over the resource version.
/// Losing a create race ("already exists") counts as success.
async fn upsert<K>(
    api: &dyn ResourceApi<K>,
    name: &str,
    mut desired: K,
    carry_over: impl FnOnce(&K, &mut K) + Send,
) -> Result<Outcome, ClusterApiError>
where
    K: Resource + Send + Sync,
{
    match api.get(name).await? {
        None => match api.create(&desired).await {
            Ok(_) => Ok(Outcome::Created),
            Err(e) if e.is_already_exists() => {
                debug!("{} was created concurrently, keeping it", name);
                Ok(Outcome::Created)
            }
            Err(e) => Err(e),
        },
        Some(existing) => {
            desired.meta_mut().resource_version = existing.meta().resource_version.clone();
            carry_over(&existing, &mut desired);
            api.replace(name, &desired).await?;
            Ok(Outcome::Updated)
        }
    }
}

async fn remove<K>(api: &dyn ResourceApi<K>, name: &str) -> Result<Outcome, ClusterApiError> {
    if api.delete(name).await? {
        Ok(Outcome::Deleted)
    } else {
        Ok(Outcome::Skipped)
    }
}

/// Idempotent ensure operations, one per managed resource kind.
pub struct ResourceReconciler {
    ingress: IngressSettings,
}

impl ResourceReconciler {
    pub fn new(ingress: IngressSettings) -> Self {
        Self { ingress }
    }

    pub async fn ensure_namespace(
        &self,
        cluster: &dyn ClusterApi,
        namespace: &str,
    ) -> Result<Outcome, ClusterApiError> {
        if RESERVED_NAMESPACES.contains(&namespace) {
            return Ok(Outcome::Skipped);
        }
        let namespaces = cluster.namespaces();
        if namespaces.get(namespace).await?.is_some() {
            return Ok(Outcome::Skipped);
        }
        let manifest: Namespace = from_manifest(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": namespace,
                "labels": { "managed-by": MANAGED_BY },
            },
        }))?;
        match namespaces.create(&manifest).await {
            Ok(_) => Ok(Outcome::Created),
            Err(e) if e.is_already_exists() => Ok(Outcome::Skipped),
            Err(e) => Err(e),
        }
    }

    pub async fn ensure_secret_bundle(
        &self,
        cluster: &dyn ClusterApi,
        app: &Application,
        data: &BTreeMap<String, String>,
    ) -> Result<Outcome, ClusterApiError> {
        let name = secret_bundle_name(app);
        let desired = secret_bundle_manifest(app, data)?;
        let outcome = upsert(cluster.secrets(&app.namespace).as_ref(), &name, desired, |_, _| {}).await?;
        info!("Secret bundle {} ({} keys) {}", name, data.len(), outcome);
        Ok(outcome)
    }

    pub async fn ensure_workload(
        &self,
        cluster: &dyn ClusterApi,
        app: &Application,
        secret_bundle: Option<&str>,
    ) -> Result<Outcome, ClusterApiError> {
        let desired = workload_manifest(app, secret_bundle)?;
        let outcome = upsert(cluster.workloads(&app.namespace).as_ref(), &app.name, desired, |_, _| {}).await?;
        info!(
            "Workload {}/{} {} ({} replicas of {})",
            app.namespace, app.name, outcome, app.spec.replicas, app.spec.image
        );
        Ok(outcome)
    }

    /// Only when a port is declared. An update keeps the cluster IP the endpoint already has.
    pub async fn ensure_endpoint(
        &self,
        cluster: &dyn ClusterApi,
        app: &Application,
    ) -> Result<Outcome, ClusterApiError> {
        let Some(port) = app.spec.port else {
            return Ok(Outcome::Skipped);
        };
        let desired = endpoint_manifest(app, port)?;
        let outcome = upsert(
            cluster.endpoints(&app.namespace).as_ref(),
            &app.name,
            desired,
            |existing: &Service, desired: &mut Service| {
                if let (Some(current), Some(spec)) = (existing.spec.as_ref(), desired.spec.as_mut()) {
                    spec.cluster_ip = current.cluster_ip.clone();
                    spec.cluster_ips = current.cluster_ips.clone();
                }
            },
        )
        .await?;
        info!("Endpoint {}/{} {} on port {}", app.namespace, app.name, outcome, port);
        Ok(outcome)
    }

    /// Deletes the autoscaler when autoscaling is off, otherwise creates or updates it.
    pub async fn ensure_autoscaler(
        &self,
        cluster: &dyn ClusterApi,
        app: &Application,
    ) -> Result<Outcome, ClusterApiError> {
        let api = cluster.autoscalers(&app.namespace);
        let outcome = match app.spec.autoscaling.as_ref().filter(|hpa| hpa.enabled) {
            Some(hpa) => {
                let desired = autoscaler_manifest(app, hpa)?;
                upsert(api.as_ref(), &app.name, desired, |_, _| {}).await?
            }
            None => remove(api.as_ref(), &app.name).await?,
        };
        if outcome != Outcome::Skipped {
            info!("Autoscaler {}/{} {}", app.namespace, app.name, outcome);
        }
        Ok(outcome)
    }

    /// Ingress bound to the application's domain; removed when there is no domain.
    pub async fn ensure_ingress(
        &self,
        cluster: &dyn ClusterApi,
        app: &Application,
    ) -> Result<Outcome, ClusterApiError> {
        let api = cluster.ingresses(&app.namespace);
        let outcome = match app.spec.domain.as_deref().filter(|d| !d.is_empty()) {
            Some(domain) => {
                let desired = ingress_manifest(app, domain, &self.ingress)?;
                upsert(api.as_ref(), &app.name, desired, |_, _| {}).await?
            }
            None => remove(api.as_ref(), &app.name).await?,
        };
        info!("Ingress {}/{} {}", app.namespace, app.name, outcome);
        Ok(outcome)
    }

    /// Best-effort teardown of everything an application owns on the cluster.
    /// Each failure is logged and otherwise ignored.
    pub async fn remove_application(&self, cluster: &dyn ClusterApi, app: &Application) {
        let namespace = app.namespace.as_str();
        let mut results = vec![
            ("workload", remove(cluster.workloads(namespace).as_ref(), &app.name).await),
            ("endpoint", remove(cluster.endpoints(namespace).as_ref(), &app.name).await),
            (
                "secret bundle",
                remove(cluster.secrets(namespace).as_ref(), &secret_bundle_name(app)).await,
            ),
        ];
        if app.spec.autoscaling.is_some() {
            results.push((
                "autoscaler",
                remove(cluster.autoscalers(namespace).as_ref(), &app.name).await,
            ));
        }
        if app.spec.domain.is_some() {
            results.push(("ingress", remove(cluster.ingresses(namespace).as_ref(), &app.name).await));
        }
        for (kind, result) in results {
            match result {
                Ok(outcome) => debug!("Removal of {} {} for {}: {}", kind, app.name, namespace, outcome),
                Err(e) => warn!("Ignoring failure to remove {} of {}: {}", kind, app.name, e),
            }
        }
    }
}
