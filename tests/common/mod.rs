#![allow(dead_code)]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodStatus, Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube_tunnel::{
    cluster::{ClusterApi, PodRef, PortStream},
    config::{BrokerConfig, TunnelOptions},
    error::{Result, TunnelError},
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub fn init_test_env() {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-memory cluster whose port-forward streams are plain TCP connections to
/// local servers.
#[derive(Default)]
pub struct FakeCluster {
    pods: Mutex<Vec<Pod>>,
    services: Mutex<HashMap<(String, String), Service>>,
    routes: Mutex<HashMap<(String, u16), SocketAddr>>,
    stalled: Mutex<HashSet<(String, u16)>>,
    broken: Mutex<HashSet<String>>,
    opened: Mutex<Vec<(String, u16)>>,
    pub pending_opens: Arc<AtomicUsize>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().push(pod);
    }

    pub fn remove_pod(&self, name: &str) {
        self.pods
            .lock()
            .unwrap()
            .retain(|pod| pod.metadata.name.as_deref() != Some(name));
    }

    pub fn set_phase(&self, name: &str, phase: &str) {
        for pod in self.pods.lock().unwrap().iter_mut() {
            if pod.metadata.name.as_deref() == Some(name) {
                pod.status.get_or_insert_with(Default::default).phase = Some(phase.to_string());
            }
        }
    }

    pub fn add_service(&self, namespace: &str, service: Service) {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.services
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name), service);
    }

    /// Streams opened to `port` on `pod` connect to `addr`.
    pub fn route(&self, pod: &str, port: u16, addr: SocketAddr) {
        self.routes
            .lock()
            .unwrap()
            .insert((pod.to_string(), port), addr);
    }

    /// Streams opened to `port` on `pod` never complete.
    pub fn stall(&self, pod: &str, port: u16) {
        self.stalled
            .lock()
            .unwrap()
            .insert((pod.to_string(), port));
    }

    /// Every stream opened to `pod` fails.
    pub fn break_pod(&self, pod: &str) {
        self.broken.lock().unwrap().insert(pod.to_string());
    }

    pub fn opened(&self) -> Vec<(String, u16)> {
        self.opened.lock().unwrap().clone()
    }
}

struct PendingOpen(Arc<AtomicUsize>);

impl PendingOpen {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for PendingOpen {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_pods(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<Pod>> {
        let wanted: Vec<(String, String)> = label_selector
            .map(|selector| {
                selector
                    .split(',')
                    .filter_map(|pair| pair.split_once('='))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|pod| pod.metadata.namespace.as_deref() == Some(namespace))
            .filter(|pod| {
                wanted.iter().all(|(k, v)| {
                    pod.metadata
                        .labels
                        .as_ref()
                        .and_then(|labels| labels.get(k))
                        .is_some_and(|value| value == v)
                })
            })
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.pods
            .lock()
            .unwrap()
            .iter()
            .find(|pod| {
                pod.metadata.namespace.as_deref() == Some(namespace)
                    && pod.metadata.name.as_deref() == Some(name)
            })
            .cloned()
            .ok_or_else(|| TunnelError::NotFound(format!("pod {}/{}", namespace, name)))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        self.services
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| TunnelError::NotFound(format!("service {}/{}", namespace, name)))
    }

    async fn open_stream(&self, pod: &PodRef, port: u16) -> Result<PortStream> {
        let target = (pod.name.clone(), port);
        self.opened.lock().unwrap().push(target.clone());

        let broken = self.broken.lock().unwrap().contains(&pod.name);
        if broken {
            return Err(TunnelError::ConnectionError(format!(
                "pod {} refused the port-forward",
                pod
            )));
        }

        let stalled = self.stalled.lock().unwrap().contains(&target);
        if stalled {
            let _pending = PendingOpen::new(&self.pending_opens);
            std::future::pending::<()>().await;
        }

        let addr = self.routes.lock().unwrap().get(&target).copied();
        let addr = addr.ok_or_else(|| {
            TunnelError::ConnectionError(format!("nothing listens on {} port {}", pod, port))
        })?;
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(stream))
    }
}

pub fn pod(name: &str, namespace: &str, phase: &str, host_ip: Option<&str>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            host_ip: host_ip.map(str::to_string),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn labelled_pod(name: &str, namespace: &str, labels: &[(&str, &str)]) -> Pod {
    let mut pod = pod(name, namespace, "Running", None);
    pod.metadata.labels = Some(
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    );
    pod
}

pub fn service(name: &str, selector: Option<&[(&str, &str)]>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: selector.map(|pairs| {
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// TCP server that echoes every byte back.
pub async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = conn.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Sends `payload` through `local` and returns what comes back.
pub async fn roundtrip(local: &str, payload: &[u8]) -> Vec<u8> {
    let mut conn = TcpStream::connect(local).await.unwrap();
    conn.write_all(payload).await.unwrap();
    let mut received = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut received))
        .await
        .expect("echo timed out")
        .unwrap();
    received
}

pub fn fast_options() -> TunnelOptions {
    TunnelOptions {
        ready_timeout: Duration::from_secs(2),
        ..TunnelOptions::default()
    }
}

pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        tunnel: fast_options(),
        ..BrokerConfig::default()
    }
}

pub async fn wait_until_done(tunnel: &kube_tunnel::tunnel::Tunnel) {
    tokio::time::timeout(Duration::from_secs(5), tunnel.wait_done())
        .await
        .expect("tunnel worker did not exit");
}
