use crate::error::{Result, TunnelError};
use std::net::{IpAddr, SocketAddr};

/// Registry key of the hop-1 tunnel to the in-cluster proxy pod.
pub const PROXY_KEY: &str = "e2e-proxy-control";

/// Key of a node relay, matching the keys reported by `/listforwarding`.
pub fn node_key(address: &str, port: u16) -> String {
    format!("{}:{}", address, port)
}

pub fn service_key(name: &str, namespace: &str) -> String {
    format!("service-{}-{}", name, namespace)
}

pub fn local_address(ip: IpAddr, port: u16) -> String {
    SocketAddr::new(ip, port).to_string()
}

/// Splits `name`, `name.namespace` or `name.namespace.svc.cluster.local`
/// into a service name and namespace.
pub fn parse_service_target<'a>(
    target: &'a str,
    default_namespace: &'a str,
) -> Result<(&'a str, &'a str)> {
    let parts: Vec<&str> = target.split('.').collect();
    match parts.as_slice() {
        [""] => Err(TunnelError::ConfigError("empty service target".to_string())),
        [name] => Ok((*name, default_namespace)),
        _ => parse_full_dns_name(&parts),
    }
}

pub fn parse_full_dns_name<'a>(parts: &[&'a str]) -> Result<(&'a str, &'a str)> {
    match parts {
        [name, namespace, ..] if !name.is_empty() && !namespace.is_empty() => {
            Ok((*name, *namespace))
        }
        _ => Err(TunnelError::ConfigError(
            "Invalid DNS name format".to_string(),
        )),
    }
}
