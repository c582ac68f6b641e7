use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{AsyncBufReadExt, Stream, StreamExt};
use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        autoscaling::v2::HorizontalPodAutoscaler,
        core::v1::{Namespace, Node, Pod, Secret, Service},
        networking::v1::Ingress,
    },
    NamespaceResourceScope,
};
use kube::{
    api::{DeleteParams, ListParams, LogParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    Api, Client, Config, Resource,
};
use log::{debug, warn};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::domain::{
    error::ClusterApiError,
    model::{ClusterInfo, LogOptions},
    port::{ClusterApi, ClusterConnector, LogStream, ResourceApi},
};

const LOG_BUFFER: usize = 64;

impl From<kube::Error> for ClusterApiError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
                ClusterApiError::AlreadyExists(response.message)
            }
            kube::Error::Api(response) if response.code == 409 => ClusterApiError::Conflict(response.message),
            kube::Error::Api(response) if response.code == 404 => ClusterApiError::NotFound(response.message),
            other => ClusterApiError::Request(other.to_string()),
        }
    }
}

/// Builds kube clients out of kubeconfig documents.
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, credential: &[u8]) -> Result<Arc<dyn ClusterApi>, ClusterApiError> {
        let yaml = std::str::from_utf8(credential)
            .map_err(|e| ClusterApiError::Request(format!("kubeconfig is not valid UTF-8: {e}")))?;
        let kubeconfig = Kubeconfig::from_yaml(yaml)
            .map_err(|e| ClusterApiError::Request(format!("invalid kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ClusterApiError::Request(format!("unusable kubeconfig: {e}")))?;
        let cluster_url = config.cluster_url.to_string();
        let client = Client::try_from(config)?;
        debug!("Kubernetes client built for {}", cluster_url);
        Ok(Arc::new(KubeCluster { client, cluster_url }))
    }
}

pub struct KubeCluster {
    client: Client,
    cluster_url: String,
}

impl KubeCluster {
    fn namespaced<K>(&self, namespace: &str) -> Box<dyn ResourceApi<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned
            + Send
            + Sync
            + 'static,
    {
        Box::new(KubeResources {
            api: Api::<K>::namespaced(self.client.clone(), namespace),
        })
    }

    /// First node external address, the API server URL otherwise.
    async fn public_endpoint(&self) -> String {
        let nodes: Api<Node> = Api::all(self.client.clone());
        match nodes.list(&ListParams::default().limit(10)).await {
            Ok(nodes) => nodes
                .items
                .iter()
                .filter_map(|node| node.status.as_ref()?.addresses.as_ref())
                .flatten()
                .find(|address| address.type_ == "ExternalIP")
                .map(|address| address.address.clone())
                .unwrap_or_else(|| self.cluster_url.clone()),
            Err(e) => {
                warn!("Can't list nodes of {}: {}", self.cluster_url, e);
                self.cluster_url.clone()
            }
        }
    }
}

struct KubeResources<K> {
    api: Api<K>,
}

#[async_trait]
impl<K> ResourceApi<K> for KubeResources<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>, ClusterApiError> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, resource: &K) -> Result<K, ClusterApiError> {
        Ok(self.api.create(&PostParams::default(), resource).await?)
    }

    async fn replace(&self, name: &str, resource: &K) -> Result<K, ClusterApiError> {
        Ok(self.api.replace(name, &PostParams::default(), resource).await?)
    }

    async fn delete(&self, name: &str) -> Result<bool, ClusterApiError> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) => match ClusterApiError::from(e) {
                err if err.is_not_found() => Ok(false),
                err => Err(err),
            },
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    fn namespaces(&self) -> Box<dyn ResourceApi<Namespace>> {
        Box::new(KubeResources {
            api: Api::<Namespace>::all(self.client.clone()),
        })
    }

    fn workloads(&self, namespace: &str) -> Box<dyn ResourceApi<Deployment>> {
        self.namespaced(namespace)
    }

    fn endpoints(&self, namespace: &str) -> Box<dyn ResourceApi<Service>> {
        self.namespaced(namespace)
    }

    fn autoscalers(&self, namespace: &str) -> Box<dyn ResourceApi<HorizontalPodAutoscaler>> {
        self.namespaced(namespace)
    }

    fn ingresses(&self, namespace: &str) -> Box<dyn ResourceApi<Ingress>> {
        self.namespaced(namespace)
    }

    fn secrets(&self, namespace: &str) -> Box<dyn ResourceApi<Secret>> {
        self.namespaced(namespace)
    }

    async fn server_info(&self) -> Result<ClusterInfo, ClusterApiError> {
        let version = self.client.apiserver_version().await?;
        Ok(ClusterInfo {
            endpoint: self.public_endpoint().await,
            version: version.git_version,
        })
    }

    async fn list_pods(&self, namespace: &str, app: &str) -> Result<Vec<Pod>, ClusterApiError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("app={app}"));
        Ok(pods.list(&params).await?.items)
    }

    /// Lines are forwarded from a task owning the log connection; dropping the stream ends it.
    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        options: LogOptions,
    ) -> Result<LogStream, ClusterApiError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = pod.to_string();
        let params = LogParams {
            follow: options.follow,
            tail_lines: options.tail_lines,
            ..Default::default()
        };
        let (tx, rx) = mpsc::channel::<Result<Bytes, ClusterApiError>>(LOG_BUFFER);
        tokio::spawn(async move {
            match pods.log_stream(&pod, &params).await {
                Ok(reader) => forward_lines(Box::pin(reader.lines()), tx).await,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                }
            }
            debug!("Log stream of {} closed", pod);
        });
        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Pushes lines until the upstream ends or the consumer drops its receiver, even while no line is coming.
async fn forward_lines<S>(mut lines: S, tx: mpsc::Sender<Result<Bytes, ClusterApiError>>)
where
    S: Stream<Item = std::io::Result<String>> + Unpin,
{
    loop {
        let line = tokio::select! {
            line = lines.next() => line,
            _ = tx.closed() => break,
        };
        let Some(line) = line else {
            break;
        };
        let chunk = line
            .map(|line| Bytes::from(format!("{line}\n")))
            .map_err(|e| ClusterApiError::Request(e.to_string()));
        if tx.send(chunk).await.is_err() {
            break;
        }
    }
}
