use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use socket2::{SockRef, TcpKeepalive};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::{mpsc, oneshot, watch},
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cluster::{ClusterApi, PodRef},
    config::TunnelOptions,
    error::{Result, TunnelError},
    metrics::TunnelMetrics,
    util,
};

/// A live forwarding session from a local listener to one pod port.
#[derive(Debug)]
pub struct Tunnel {
    pub key: String,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_port: u16,
    pub pod: PodRef,
    pub established_at: DateTime<Utc>,
    stop: CancellationToken,
    done: watch::Receiver<bool>,
}

impl Tunnel {
    pub fn local_address(&self) -> String {
        util::local_address(self.local_ip, self.local_port)
    }

    /// True once the background worker has left its forwarding loop.
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves when the background worker has exited.
    pub async fn wait_done(&self) {
        let mut done = self.done.clone();
        // An error means the worker dropped its sender, which only happens on exit.
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Asks the background worker to stop. Safe to call any number of times.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            debug!("Stopping tunnel {} on {}", self.key, self.local_address());
        }
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Opens tunnels to pod ports through the API server.
#[derive(Clone)]
pub struct TunnelEstablisher {
    api: Arc<dyn ClusterApi>,
    options: TunnelOptions,
}

impl TunnelEstablisher {
    pub fn new(api: Arc<dyn ClusterApi>, options: TunnelOptions) -> Self {
        Self { api, options }
    }

    /// Establishes a tunnel to `remote_port` on `pod`, listening on a local
    /// port picked by the OS, and waits for it to become ready.
    pub async fn establish(&self, key: &str, pod: &PodRef, remote_port: u16) -> Result<Tunnel> {
        let metrics = TunnelMetrics::new(key);
        metrics.record_establish_attempt();

        let listener = match TcpListener::bind(SocketAddr::new(self.options.bind_address, 0)).await
        {
            Ok(listener) => listener,
            Err(e) => {
                metrics.record_establish_failure();
                return Err(TunnelError::Io(e));
            }
        };
        let local_port = listener.local_addr()?.port();
        debug!(
            "Listening on {}:{} for tunnel {} to {} port {}",
            self.options.bind_address, local_port, key, pod, remote_port
        );

        let stop = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);

        let worker = TunnelWorker {
            api: self.api.clone(),
            key: key.to_string(),
            pod: pod.clone(),
            remote_port,
            keepalive: self.options.keepalive,
            stop: stop.clone(),
            metrics: metrics.clone(),
        };
        tokio::spawn(async move {
            worker.run(listener, ready_tx).await;
            done_tx.send_replace(true);
        });

        let ready = tokio::time::timeout(self.options.ready_timeout, ready_rx).await;
        let outcome = match ready {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(TunnelError::ConnectionError(format!(
                "tunnel worker for {} exited before becoming ready",
                key
            ))),
            Err(_) => {
                warn!(
                    "Tunnel {} to {} port {} not ready within {:?}, aborting",
                    key, pod, remote_port, self.options.ready_timeout
                );
                Err(TunnelError::ReadyTimeout {
                    target: format!("{} port {}", pod, remote_port),
                    timeout: self.options.ready_timeout,
                })
            }
        };

        if let Err(e) = outcome {
            stop.cancel();
            metrics.record_establish_failure();
            return Err(e);
        }

        metrics.record_establish_success();
        metrics.set_active(true);
        info!(
            "Tunnel {} established: {}:{} -> {} port {}",
            key, self.options.bind_address, local_port, pod, remote_port
        );

        Ok(Tunnel {
            key: key.to_string(),
            local_ip: self.options.bind_address,
            local_port,
            remote_port,
            pod: pod.clone(),
            established_at: Utc::now(),
            stop,
            done: done_rx,
        })
    }
}

struct TunnelWorker {
    api: Arc<dyn ClusterApi>,
    key: String,
    pod: PodRef,
    remote_port: u16,
    keepalive: Duration,
    stop: CancellationToken,
    metrics: TunnelMetrics,
}

impl TunnelWorker {
    async fn run(self, listener: TcpListener, ready: oneshot::Sender<Result<()>>) {
        // Probe the port-forward before reporting ready.
        let probe = tokio::select! {
            _ = self.stop.cancelled() => {
                debug!("Tunnel {} stopped before becoming ready", self.key);
                return;
            }
            probe = self.api.open_stream(&self.pod, self.remote_port) => probe,
        };
        match probe {
            Ok(stream) => drop(stream),
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        }
        if ready.send(Ok(())).is_err() {
            // Nobody is waiting any more; the establish call gave up.
            return;
        }

        self.forward_loop(listener).await;
        self.stop.cancel();
        self.metrics.set_active(false);
    }

    async fn forward_loop(&self, listener: TcpListener) {
        let mut incoming = TcpListenerStream::new(listener);
        let (failure_tx, mut failure_rx) = mpsc::channel::<String>(1);
        let keepalive = TcpKeepalive::new().with_time(self.keepalive);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    info!("Received shutdown signal for tunnel {}", self.key);
                    break;
                }

                Some(reason) = failure_rx.recv() => {
                    warn!("Tunnel {} to {} lost its upstream: {}", self.key, self.pod, reason);
                    break;
                }

                accepted = incoming.try_next() => match accepted {
                    Ok(Some(client_conn)) => {
                        if let Ok(peer_addr) = client_conn.peer_addr() {
                            debug!(%peer_addr, "New connection for tunnel {}", self.key);
                        }
                        let _ = SockRef::from(&client_conn).set_tcp_keepalive(&keepalive);

                        let api = self.api.clone();
                        let pod = self.pod.clone();
                        let port = self.remote_port;
                        let conn_stop = self.stop.child_token();
                        let failure_tx = failure_tx.clone();
                        tokio::spawn(async move {
                            let stream = match api.open_stream(&pod, port).await {
                                Ok(stream) => stream,
                                Err(e) => {
                                    let _ = failure_tx.try_send(e.to_string());
                                    return;
                                }
                            };
                            if let Err(e) = forward_connection(client_conn, stream, conn_stop).await
                            {
                                warn!(
                                    "Failed to forward connection to {} port {}: {}",
                                    pod, port, e
                                );
                            }
                        });
                    }
                    Ok(None) => {
                        error!("Tunnel {} listener closed", self.key);
                        break;
                    }
                    Err(e) => {
                        error!("Tunnel {} listener failed: {}", self.key, e);
                        break;
                    }
                },
            }
        }
    }
}

/// Copies bytes both ways until either side closes or the tunnel stops.
pub async fn forward_connection(
    mut client_conn: impl AsyncRead + AsyncWrite + Unpin,
    mut upstream_conn: impl AsyncRead + AsyncWrite + Unpin,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    tokio::select! {
        _ = stop.cancelled() => {
            debug!("Connection closed by tunnel shutdown");
            Ok(())
        }
        copied = tokio::io::copy_bidirectional(&mut client_conn, &mut upstream_conn) => {
            let (sent, received) =
                copied.map_err(|e| anyhow::anyhow!("Data transfer error: {}", e))?;
            debug!(sent, received, "Connection closed normally");
            Ok(())
        }
    }
}
