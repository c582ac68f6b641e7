//! In-process cluster used by the tests: keeps manifests as JSON keyed by kind, namespace and name.

use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use k8s_openapi::api::{
    apps::v1::Deployment,
    autoscaling::v2::HorizontalPodAutoscaler,
    core::v1::{Namespace, Pod, Secret, Service},
    networking::v1::Ingress,
};
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};

use crate::domain::{
    error::ClusterApiError,
    model::{ClusterInfo, LogOptions},
    port::{ClusterApi, ClusterConnector, LogStream, ResourceApi},
};

const SERVER_INFO: &str = "ServerInfo";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    /// Every call on the kind fails with a request error.
    Error,
    /// `create` reports that somebody else created the object first.
    AlreadyExistsOnCreate,
    Panic,
}

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: HashMap<Key, Value>,
    failures: HashMap<String, Failure>,
    pods: Vec<Pod>,
    logs: HashMap<String, Vec<String>>,
    version: u64,
    next_ip: u32,
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, kind: &str, failure: Failure) {
        self.state.lock().unwrap().failures.insert(kind.to_string(), failure);
    }

    pub fn heal(&self, kind: &str) {
        self.state.lock().unwrap().failures.remove(kind);
    }

    pub fn unreachable(&self) {
        self.fail(SERVER_INFO, Failure::Error);
    }

    fn failure(&self, kind: &str) -> Option<Failure> {
        let failure = self.state.lock().unwrap().failures.get(kind).copied();
        if failure == Some(Failure::Panic) {
            panic!("injected panic on {kind}");
        }
        failure
    }

    pub fn object<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let key = (K::kind(&()).to_string(), namespace.to_string(), name.to_string());
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&key)
            .map(|value| serde_json::from_value(value.clone()).unwrap())
    }

    pub fn count(&self, kind: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.objects.keys().filter(|(k, _, _)| k == kind).count()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.object(namespace, name)
    }

    pub fn get_service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.object(namespace, name)
    }

    pub fn service_ip(&self, namespace: &str, name: &str) -> Option<String> {
        self.get_service(namespace, name)
            .and_then(|service| service.spec)
            .and_then(|spec| spec.cluster_ip)
    }

    pub fn autoscaler(&self, namespace: &str, name: &str) -> Option<HorizontalPodAutoscaler> {
        self.object(namespace, name)
    }

    pub fn ingress(&self, namespace: &str, name: &str) -> Option<Ingress> {
        self.object(namespace, name)
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.object(namespace, name)
    }

    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        self.object("", name)
    }

    /// Marks every replica of a workload ready, the way a healthy rollout would.
    pub fn mark_ready(&self, namespace: &str, name: &str) {
        let key = ("Deployment".to_string(), namespace.to_string(), name.to_string());
        let mut state = self.state.lock().unwrap();
        if let Some(value) = state.objects.get_mut(&key) {
            let replicas = value["spec"]["replicas"].clone();
            value["status"] = json!({ "replicas": replicas, "readyReplicas": replicas });
        }
    }

    pub fn add_pod(&self, namespace: &str, app: &str, name: &str, logs: &[&str]) {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": { "app": app },
                "creationTimestamp": chrono::Utc::now(),
            },
            "status": {
                "phase": "Running",
                "conditions": [{ "type": "Ready", "status": "True" }],
            },
        }))
        .unwrap();
        let mut state = self.state.lock().unwrap();
        state.pods.push(pod);
        state
            .logs
            .insert(name.to_string(), logs.iter().map(|line| line.to_string()).collect());
    }

    fn resources<K>(&self, namespace: &str) -> Box<dyn ResourceApi<K>>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Box::new(FakeResources::<K> {
            cluster: self.clone(),
            namespace: namespace.to_string(),
            kind: PhantomData,
        })
    }
}

struct FakeResources<K> {
    cluster: FakeCluster,
    namespace: String,
    kind: PhantomData<fn() -> K>,
}

impl<K> FakeResources<K>
where
    K: Resource<DynamicType = ()>,
{
    fn key(&self, name: &str) -> Key {
        (K::kind(&()).to_string(), self.namespace.clone(), name.to_string())
    }

    fn guard(&self) -> Result<Option<Failure>, ClusterApiError> {
        let kind = K::kind(&());
        match self.cluster.failure(&kind) {
            Some(Failure::Error) => Err(ClusterApiError::Request(format!("injected failure on {kind}"))),
            other => Ok(other),
        }
    }
}

fn decode<K: DeserializeOwned>(value: Value) -> Result<K, ClusterApiError> {
    serde_json::from_value(value).map_err(|e| ClusterApiError::Request(e.to_string()))
}

#[async_trait]
impl<K> ResourceApi<K> for FakeResources<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>, ClusterApiError> {
        self.guard()?;
        let value = self.cluster.state.lock().unwrap().objects.get(&self.key(name)).cloned();
        value.map(decode).transpose()
    }

    async fn create(&self, resource: &K) -> Result<K, ClusterApiError> {
        if self.guard()? == Some(Failure::AlreadyExistsOnCreate) {
            return Err(ClusterApiError::AlreadyExists("created concurrently".to_string()));
        }
        let name = resource.meta().name.clone().unwrap_or_default();
        let key = self.key(&name);
        let mut value = serde_json::to_value(resource).map_err(|e| ClusterApiError::Request(e.to_string()))?;
        let mut state = self.cluster.state.lock().unwrap();
        if state.objects.contains_key(&key) {
            return Err(ClusterApiError::AlreadyExists(name));
        }
        state.version += 1;
        value["metadata"]["resourceVersion"] = json!(state.version.to_string());
        if key.0 == "Service" {
            state.next_ip += 1;
            value["spec"]["clusterIP"] = json!(format!("10.96.0.{}", state.next_ip));
        }
        state.objects.insert(key, value.clone());
        decode(value)
    }

    async fn replace(&self, name: &str, resource: &K) -> Result<K, ClusterApiError> {
        self.guard()?;
        let key = self.key(name);
        let mut value = serde_json::to_value(resource).map_err(|e| ClusterApiError::Request(e.to_string()))?;
        let mut state = self.cluster.state.lock().unwrap();
        let existing = state
            .objects
            .get(&key)
            .ok_or_else(|| ClusterApiError::NotFound(name.to_string()))?;
        if value["metadata"]["resourceVersion"] != existing["metadata"]["resourceVersion"] {
            return Err(ClusterApiError::Conflict(format!("{name}: stale resource version")));
        }
        if key.0 == "Service" && value["spec"]["clusterIP"] != existing["spec"]["clusterIP"] {
            return Err(ClusterApiError::Request(format!(
                "Service {name}: spec.clusterIP is immutable"
            )));
        }
        if existing.get("status").is_some() && value.get("status").is_none() {
            value["status"] = existing["status"].clone();
        }
        state.version += 1;
        value["metadata"]["resourceVersion"] = json!(state.version.to_string());
        state.objects.insert(key, value.clone());
        decode(value)
    }

    async fn delete(&self, name: &str) -> Result<bool, ClusterApiError> {
        self.guard()?;
        let key = self.key(name);
        Ok(self.cluster.state.lock().unwrap().objects.remove(&key).is_some())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    fn namespaces(&self) -> Box<dyn ResourceApi<Namespace>> {
        self.resources("")
    }

    fn workloads(&self, namespace: &str) -> Box<dyn ResourceApi<Deployment>> {
        self.resources(namespace)
    }

    fn endpoints(&self, namespace: &str) -> Box<dyn ResourceApi<Service>> {
        self.resources(namespace)
    }

    fn autoscalers(&self, namespace: &str) -> Box<dyn ResourceApi<HorizontalPodAutoscaler>> {
        self.resources(namespace)
    }

    fn ingresses(&self, namespace: &str) -> Box<dyn ResourceApi<Ingress>> {
        self.resources(namespace)
    }

    fn secrets(&self, namespace: &str) -> Box<dyn ResourceApi<Secret>> {
        self.resources(namespace)
    }

    async fn server_info(&self) -> Result<ClusterInfo, ClusterApiError> {
        if self.failure(SERVER_INFO).is_some() {
            return Err(ClusterApiError::Request("connection refused".to_string()));
        }
        Ok(ClusterInfo {
            endpoint: "203.0.113.10".to_string(),
            version: "v1.30.2".to_string(),
        })
    }

    async fn list_pods(&self, namespace: &str, app: &str) -> Result<Vec<Pod>, ClusterApiError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .iter()
            .filter(|pod| pod.metadata.namespace.as_deref() == Some(namespace))
            .filter(|pod| {
                pod.metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get("app"))
                    .map(String::as_str)
                    == Some(app)
            })
            .cloned()
            .collect())
    }

    async fn pod_logs(
        &self,
        _namespace: &str,
        pod: &str,
        options: LogOptions,
    ) -> Result<LogStream, ClusterApiError> {
        let lines = self
            .state
            .lock()
            .unwrap()
            .logs
            .get(pod)
            .cloned()
            .ok_or_else(|| ClusterApiError::NotFound(pod.to_string()))?;
        let skip = match options.tail_lines {
            Some(tail) => lines.len().saturating_sub(tail.max(0) as usize),
            None => 0,
        };
        let chunks: Vec<Result<Bytes, ClusterApiError>> = lines
            .into_iter()
            .skip(skip)
            .map(|line| Ok(Bytes::from(format!("{line}\n"))))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}

/// Hands out one shared `FakeCluster` to whoever presents `FakeConnector::CREDENTIAL`.
#[derive(Clone, Default)]
pub struct FakeConnector {
    pub cluster: FakeCluster,
}

impl FakeConnector {
    pub const CREDENTIAL: &'static str = "fake-kubeconfig";
}

#[async_trait]
impl ClusterConnector for FakeConnector {
    async fn connect(&self, credential: &[u8]) -> Result<Arc<dyn ClusterApi>, ClusterApiError> {
        if credential == Self::CREDENTIAL.as_bytes() {
            Ok(Arc::new(self.cluster.clone()))
        } else {
            Err(ClusterApiError::Request("unable to parse kubeconfig".to_string()))
        }
    }
}
