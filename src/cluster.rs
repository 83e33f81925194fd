use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{
    Client,
    api::{Api, ListParams},
};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};

/// Identity of the pod backing a tunnel.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
}

impl PodRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Builds a reference from a listed pod, falling back to the namespace
    /// that was listed when the object carries none.
    pub fn from_pod(pod: &Pod, namespace: &str) -> Option<Self> {
        let name = pod.metadata.name.clone()?;
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| namespace.to_string());
        Some(Self { name, namespace })
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub trait PortStreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PortStreamIo for T {}

/// One bidirectional byte stream to a pod port.
pub type PortStream = Box<dyn PortStreamIo>;

/// The Kubernetes operations the broker relies on.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_pods(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<Pod>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service>;

    /// Opens a port-forward stream to `port` on `pod`.
    async fn open_stream(&self, pod: &PodRef, port: u16) -> Result<PortStream>;
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_pods(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let pod_list = pods.list(&params).await?;
        Ok(pod_list.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.get(name).await?)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(services.get(name).await?)
    }

    async fn open_stream(&self, pod: &PodRef, port: u16) -> Result<PortStream> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);

        let mut pf = pods.portforward(&pod.name, &[port]).await?;
        let stream = pf.take_stream(port).ok_or_else(|| {
            TunnelError::ConnectionError(format!(
                "Failed to get port forward stream for {} port {}",
                pod, port
            ))
        })?;
        debug!("Port forward stream established for {} port {}", pod, port);

        // The forwarder finishes once its only stream is closed.
        let target = pod.to_string();
        tokio::spawn(async move {
            if let Err(e) = pf.join().await {
                warn!("Port forwarder join error for {} port {}: {}", target, port, e);
            }
        });

        Ok(Box::new(stream))
    }
}
