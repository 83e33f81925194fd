use serde::{Deserialize, Serialize};
use std::{net::IpAddr, path::Path, time::Duration};

use crate::error::{Result, TunnelError};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    #[serde(default = "default_agent_namespace")]
    pub agent_namespace: String,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub tunnel: TunnelOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_pod_prefix")]
    pub pod_prefix: String,
    #[serde(default = "default_proxy_control_port")]
    pub control_port: u16,
    /// Only pick a proxy pod scheduled on this node IP.
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TunnelOptions {
    #[serde(with = "humantime_serde", default = "default_ready_timeout")]
    pub ready_timeout: Duration,
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(with = "humantime_serde", default = "default_keepalive")]
    pub keepalive: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            agent_namespace: default_agent_namespace(),
            proxy: ProxyConfig::default(),
            tunnel: TunnelOptions::default(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            pod_prefix: default_proxy_pod_prefix(),
            control_port: default_proxy_control_port(),
            host_ip: None,
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            ready_timeout: default_ready_timeout(),
            bind_address: default_bind_address(),
            keepalive: default_keepalive(),
        }
    }
}

impl BrokerConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty document means "all defaults".
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| TunnelError::ConfigError(e.to_string()))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            TunnelError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }
}

pub fn default_agent_namespace() -> String {
    "e2e-agent".to_string()
}

pub fn default_proxy_pod_prefix() -> String {
    "e2e-proxy".to_string()
}

pub fn default_proxy_control_port() -> u16 {
    30000
}

pub fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

pub fn default_ready_timeout() -> Duration {
    Duration::from_secs(30)
}

pub fn default_bind_address() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

pub fn default_keepalive() -> Duration {
    Duration::from_secs(30)
}
