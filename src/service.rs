use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    cluster::{ClusterApi, PodRef},
    error::{Result, TunnelError},
    liveness::LivenessChecker,
    registry::ConnectionRegistry,
    tunnel::{Tunnel, TunnelEstablisher},
    util,
};

/// Forwards to a Service by tunnelling to one of the pods it selects.
#[derive(Clone)]
pub struct ServiceResolver {
    api: Arc<dyn ClusterApi>,
    registry: Arc<ConnectionRegistry>,
    establisher: TunnelEstablisher,
    liveness: LivenessChecker,
}

impl ServiceResolver {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        registry: Arc<ConnectionRegistry>,
        establisher: TunnelEstablisher,
        liveness: LivenessChecker,
    ) -> Self {
        Self {
            api,
            registry,
            establisher,
            liveness,
        }
    }

    pub async fn forward_to_service(
        &self,
        name: &str,
        namespace: &str,
        remote_port: u16,
    ) -> Result<String> {
        let key = util::service_key(name, namespace);
        let tunnel = self
            .registry
            .lookup_or_create(&key, &self.liveness, || {
                self.connect_any(&key, name, namespace, remote_port)
            })
            .await?;
        Ok(tunnel.local_address())
    }

    async fn connect_any(
        &self,
        key: &str,
        name: &str,
        namespace: &str,
        remote_port: u16,
    ) -> Result<Tunnel> {
        let candidates = self.candidate_pods(name, namespace).await?;

        let mut errors = Vec::new();
        for pod in candidates {
            match self.establisher.establish(key, &pod, remote_port).await {
                Ok(tunnel) => return Ok(tunnel),
                Err(e) => {
                    warn!("Service {}/{}: cannot forward to {}: {}", namespace, name, pod, e);
                    errors.push(format!("{}: {}", pod, e));
                }
            }
        }

        Err(TunnelError::AllCandidatesFailed {
            service: format!("{}/{}", namespace, name),
            errors,
        })
    }

    /// Pods matched by the service's selector, in API list order.
    pub async fn candidate_pods(&self, name: &str, namespace: &str) -> Result<Vec<PodRef>> {
        let service = self.api.get_service(namespace, name).await?;
        let selector = service
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.as_ref())
            .filter(|selector| !selector.is_empty())
            .map(|selector| {
                selector
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .ok_or_else(|| {
                TunnelError::NotFound(format!("service {}/{} has no selector", namespace, name))
            })?;
        debug!("Service {}/{} selects {}", namespace, name, selector);

        let pods: Vec<PodRef> = self
            .api
            .list_pods(namespace, Some(&selector))
            .await?
            .iter()
            .filter_map(|pod| PodRef::from_pod(pod, namespace))
            .collect();

        if pods.is_empty() {
            return Err(TunnelError::NotFound(format!(
                "no pods match service {}/{} ({})",
                namespace, name, selector
            )));
        }
        Ok(pods)
    }
}
