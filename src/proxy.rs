//! Two-hop forwarding to node `address:port` targets.
//!
//! The API server only forwards to pod ports, so node endpoints are reached
//! through the in-cluster proxy pod. Hop 1 is a tunnel to the proxy's control
//! port. Over it the proxy is asked (`POST /forward`) to open a TCP relay from
//! one of its own ports to the node target, and `GET /listforwarding` reports
//! which proxy port relays to which target. Hop 2 mirrors each relay port with
//! its own tunnel to the proxy pod.

use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info, warn};

use crate::{
    cluster::PodRef,
    config::ProxyConfig,
    error::{Result, TunnelError},
    liveness::{LivenessChecker, MirrorProbe},
    registry::ConnectionRegistry,
    selector::PodSelector,
    tunnel::{Tunnel, TunnelEstablisher},
    util::{self, PROXY_KEY},
};

/// Body of `POST /forward`: one single-entry object per target.
pub fn forward_request(address: &str, port: u16) -> Vec<HashMap<String, u16>> {
    vec![HashMap::from([(address.to_string(), port)])]
}

/// Body of `GET /listforwarding`: `"address:port"` to proxy-local port.
pub type RelayTable = HashMap<String, u16>;

#[derive(Clone)]
pub struct ProxyHopController {
    namespace: String,
    config: ProxyConfig,
    registry: Arc<ConnectionRegistry>,
    selector: PodSelector,
    establisher: TunnelEstablisher,
    liveness: LivenessChecker,
    http: reqwest::Client,
}

impl ProxyHopController {
    pub fn new(
        namespace: impl Into<String>,
        config: ProxyConfig,
        registry: Arc<ConnectionRegistry>,
        selector: PodSelector,
        establisher: TunnelEstablisher,
        liveness: LivenessChecker,
    ) -> Result<Self> {
        // The control address is always a loopback tunnel.
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            namespace: namespace.into(),
            config,
            registry,
            selector,
            establisher,
            liveness,
            http,
        })
    }

    /// Returns a local address relaying to `address:port` through the proxy.
    pub async fn forward(&self, address: &str, port: u16) -> Result<String> {
        let control = self.control_tunnel().await?;
        let base = format!("http://{}", control.local_address());

        self.request_relay(&base, address, port).await?;
        let relays = self.list_relays(&base).await?;

        let key = util::node_key(address, port);
        let mut requested = None;
        for (relay_key, proxy_port) in &relays {
            match self.mirror(&control.pod, relay_key, *proxy_port).await {
                Ok(tunnel) if *relay_key == key => requested = Some(tunnel),
                Ok(_) => {}
                Err(e) if *relay_key == key => return Err(e),
                Err(e) => warn!("Cannot mirror proxy relay {}: {}", relay_key, e),
            }
        }

        requested
            .map(|tunnel| tunnel.local_address())
            .ok_or_else(|| TunnelError::NotFound(format!("proxy has no relay for {}", key)))
    }

    /// Like [`forward`](Self::forward), but falls back to the literal
    /// `address:port` when forwarding fails.
    pub async fn try_forward(&self, address: &str, port: u16) -> String {
        match self.forward(address, port).await {
            Ok(local) => local,
            Err(e) => {
                let direct = util::node_key(address, port);
                warn!("Forwarding to {} failed, connecting directly: {}", direct, e);
                direct
            }
        }
    }

    /// Hop 1. A dead or missing control tunnel takes every relay mirror
    /// with it.
    pub async fn control_tunnel(&self) -> Result<Arc<Tunnel>> {
        self.registry
            .lookup_or_create_cascading(PROXY_KEY, &self.liveness, || async move {
                let orphans = self
                    .registry
                    .evict_where(|tunnel| self.is_relay_mirror(tunnel))
                    .await;
                if orphans > 0 {
                    info!("Evicted {} relay mirrors left without a control tunnel", orphans);
                }

                let pod = self
                    .selector
                    .select_pod(
                        &self.namespace,
                        &self.config.pod_prefix,
                        self.config.host_ip.as_deref(),
                    )
                    .await?;
                self.establisher
                    .establish(PROXY_KEY, &pod, self.config.control_port)
                    .await
            })
            .await
    }

    fn is_relay_mirror(&self, tunnel: &Tunnel) -> bool {
        tunnel.key != PROXY_KEY
            && tunnel.pod.namespace == self.namespace
            && tunnel.pod.name.starts_with(&self.config.pod_prefix)
    }

    async fn request_relay(&self, base: &str, address: &str, port: u16) -> Result<()> {
        debug!("Asking proxy to relay {}:{}", address, port);
        self.http
            .post(format!("{}/forward", base))
            .json(&forward_request(address, port))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn list_relays(&self, base: &str) -> Result<RelayTable> {
        let body = self
            .http
            .get(format!("{}/listforwarding", base))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let relays: RelayTable = serde_json::from_slice(&body)?;
        debug!("Proxy relays: {:?}", relays);
        Ok(relays)
    }

    /// Hop 2 for one relay entry.
    async fn mirror(&self, proxy: &PodRef, key: &str, proxy_port: u16) -> Result<Arc<Tunnel>> {
        let probe = MirrorProbe {
            pod: proxy.clone(),
            remote_port: proxy_port,
        };
        self.registry
            .lookup_or_create(key, &probe, || self.establisher.establish(key, proxy, proxy_port))
            .await
    }
}
