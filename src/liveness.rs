use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::{
    cluster::{ClusterApi, PodRef},
    tunnel::Tunnel,
};

/// Decides whether a registered tunnel may be reused.
#[async_trait]
pub trait TunnelProbe: Send + Sync {
    async fn is_alive(&self, tunnel: &Tunnel) -> bool;
}

/// Alive while the worker runs and the backing pod reports `Running`.
///
/// Lookup errors count as dead: re-establishing is cheaper than trusting a
/// tunnel whose pod may be gone.
#[derive(Clone)]
pub struct LivenessChecker {
    api: Arc<dyn ClusterApi>,
}

impl LivenessChecker {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl TunnelProbe for LivenessChecker {
    async fn is_alive(&self, tunnel: &Tunnel) -> bool {
        if tunnel.is_done() {
            return false;
        }

        match self.api.get_pod(&tunnel.pod.namespace, &tunnel.pod.name).await {
            Ok(pod) => {
                let phase = pod.status.as_ref().and_then(|status| status.phase.as_deref());
                if phase == Some("Running") {
                    true
                } else {
                    debug!("Pod {} backing {} is {:?}", tunnel.pod, tunnel.key, phase);
                    false
                }
            }
            Err(e) => {
                debug!("Pod {} backing {} not found: {}", tunnel.pod, tunnel.key, e);
                false
            }
        }
    }
}

/// Alive while the worker runs; never touches the API server.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerProbe;

#[async_trait]
impl TunnelProbe for WorkerProbe {
    async fn is_alive(&self, tunnel: &Tunnel) -> bool {
        !tunnel.is_done()
    }
}

/// Alive while the worker runs and the tunnel still mirrors `remote_port`
/// on `pod`.
#[derive(Clone, Debug)]
pub struct MirrorProbe {
    pub pod: PodRef,
    pub remote_port: u16,
}

#[async_trait]
impl TunnelProbe for MirrorProbe {
    async fn is_alive(&self, tunnel: &Tunnel) -> bool {
        !tunnel.is_done() && tunnel.pod == self.pod && tunnel.remote_port == self.remote_port
    }
}
