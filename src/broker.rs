use kube::Client;
use std::sync::Arc;

use crate::{
    cluster::{ClusterApi, KubeCluster},
    config::BrokerConfig,
    error::Result,
    liveness::LivenessChecker,
    proxy::ProxyHopController,
    registry::ConnectionRegistry,
    selector::PodSelector,
    service::ServiceResolver,
    tunnel::TunnelEstablisher,
};

/// Hands out local addresses for pods, services and node endpoints, reusing
/// live tunnels across calls.
///
/// Each broker owns its registry. Nothing is torn down on process signals by
/// the broker itself; the host calls [`shutdown_all`](Self::shutdown_all).
#[derive(Clone)]
pub struct TunnelBroker {
    registry: Arc<ConnectionRegistry>,
    proxy: ProxyHopController,
    services: ServiceResolver,
}

impl TunnelBroker {
    pub fn new(api: Arc<dyn ClusterApi>, config: BrokerConfig) -> Result<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let establisher = TunnelEstablisher::new(api.clone(), config.tunnel.clone());
        let liveness = LivenessChecker::new(api.clone());

        let proxy = ProxyHopController::new(
            config.agent_namespace.clone(),
            config.proxy.clone(),
            registry.clone(),
            PodSelector::new(api.clone()),
            establisher.clone(),
            liveness.clone(),
        )?;
        let services = ServiceResolver::new(api, registry.clone(), establisher, liveness);

        Ok(Self {
            registry,
            proxy,
            services,
        })
    }

    pub fn with_client(client: Client, config: BrokerConfig) -> Result<Self> {
        Self::new(Arc::new(KubeCluster::new(client)), config)
    }

    pub async fn forward_to_node(&self, address: &str, port: u16) -> Result<String> {
        self.proxy.forward(address, port).await
    }

    /// Never fails: falls back to `address:port` when forwarding does.
    pub async fn try_forward_to_node(&self, address: &str, port: u16) -> String {
        self.proxy.try_forward(address, port).await
    }

    pub async fn forward_to_service(
        &self,
        name: &str,
        namespace: &str,
        port: u16,
    ) -> Result<String> {
        self.services.forward_to_service(name, namespace, port).await
    }

    /// Stops every tunnel this broker holds. Returns how many were stopped.
    pub async fn shutdown_all(&self) -> usize {
        self.registry.shutdown_all().await
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}
