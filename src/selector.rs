use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use tracing::debug;

use crate::{
    cluster::{ClusterApi, PodRef},
    error::{Result, TunnelError},
};

#[derive(Clone)]
pub struct PodSelector {
    api: Arc<dyn ClusterApi>,
}

impl PodSelector {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    /// Picks the first pod, in API list order, whose name starts with
    /// `name_prefix` and which runs on `host_ip` when one is given.
    pub async fn select_pod(
        &self,
        namespace: &str,
        name_prefix: &str,
        host_ip: Option<&str>,
    ) -> Result<PodRef> {
        let pods = self.api.list_pods(namespace, None).await?;
        let host_ip = host_ip.filter(|ip| !ip.is_empty());

        pods.iter()
            .find(|pod| matches_pod(pod, name_prefix, host_ip))
            .and_then(|pod| PodRef::from_pod(pod, namespace))
            .inspect(|pod| debug!("Selected pod {} for prefix {}", pod, name_prefix))
            .ok_or_else(|| {
                TunnelError::NotFound(match host_ip {
                    Some(ip) => format!(
                        "no pod named {}* on host {} in namespace {}",
                        name_prefix, ip, namespace
                    ),
                    None => format!("no pod named {}* in namespace {}", name_prefix, namespace),
                })
            })
    }
}

pub fn matches_pod(pod: &Pod, name_prefix: &str, host_ip: Option<&str>) -> bool {
    let name_matches = pod
        .metadata
        .name
        .as_deref()
        .is_some_and(|name| name.starts_with(name_prefix));
    if !name_matches {
        return false;
    }

    match host_ip {
        Some(wanted) => pod
            .status
            .as_ref()
            .and_then(|status| status.host_ip.as_deref())
            .is_some_and(|ip| ip == wanted),
        None => true,
    }
}
