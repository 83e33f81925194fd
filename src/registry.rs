//! Keyed cache of live tunnels.
//!
//! Lookups take a fast path without the per-key lock: the handle is cloned
//! out of the map and probed. Only a miss or a dead tunnel takes the per-key
//! lock, where the entry is probed again before it is evicted or replaced.
//! The map lock itself is only held around map reads and writes, so building
//! a tunnel for one key never blocks other keys. A key's lock is dropped from
//! the lock table once no lookup for that key holds or awaits it.

use std::{collections::HashMap, future::Future, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{
    cluster::PodRef,
    error::Result,
    liveness::TunnelProbe,
    metrics::TunnelMetrics,
    tunnel::Tunnel,
};

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<String, Arc<Tunnel>>>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live tunnel for `key`, replacing a dead one with the
    /// result of `create`.
    pub async fn lookup_or_create<P, F, Fut>(
        &self,
        key: &str,
        probe: &P,
        create: F,
    ) -> Result<Arc<Tunnel>>
    where
        P: TunnelProbe + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Tunnel>>,
    {
        self.acquire(key, probe, false, create).await
    }

    /// Like [`lookup_or_create`](Self::lookup_or_create), but evicting a dead
    /// tunnel also evicts every other tunnel backed by the same pod.
    pub async fn lookup_or_create_cascading<P, F, Fut>(
        &self,
        key: &str,
        probe: &P,
        create: F,
    ) -> Result<Arc<Tunnel>>
    where
        P: TunnelProbe + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Tunnel>>,
    {
        self.acquire(key, probe, true, create).await
    }

    async fn acquire<P, F, Fut>(
        &self,
        key: &str,
        probe: &P,
        cascade: bool,
        create: F,
    ) -> Result<Arc<Tunnel>>
    where
        P: TunnelProbe + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Tunnel>>,
    {
        if let Some(tunnel) = self.get(key).await {
            if probe.is_alive(&tunnel).await {
                debug!("Reusing tunnel {} on {}", key, tunnel.local_address());
                return Ok(tunnel);
            }
        }

        let key_lock = self.key_lock(key).await;
        let outcome = {
            let _guard = key_lock.lock().await;
            self.recheck_or_create(key, probe, cascade, create).await
        };
        self.release_key_lock(key, key_lock).await;
        outcome
    }

    async fn recheck_or_create<P, F, Fut>(
        &self,
        key: &str,
        probe: &P,
        cascade: bool,
        create: F,
    ) -> Result<Arc<Tunnel>>
    where
        P: TunnelProbe + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Tunnel>>,
    {
        // Another caller may have replaced the entry while we waited.
        if let Some(tunnel) = self.get(key).await {
            if probe.is_alive(&tunnel).await {
                debug!("Reusing tunnel {} on {}", key, tunnel.local_address());
                return Ok(tunnel);
            }
            self.evict_stale(key, &tunnel, cascade).await;
        }

        let tunnel = Arc::new(create().await?);
        self.insert(key, tunnel.clone()).await;
        Ok(tunnel)
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    async fn release_key_lock(&self, key: &str, key_lock: Arc<Mutex<()>>) {
        let mut locks = self.key_locks.lock().await;
        drop(key_lock);
        // Handles are only cloned under this lock, so a count of one means
        // nobody else holds or awaits the key.
        if locks
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(key);
        }
    }

    /// Number of keys with a lookup currently holding or awaiting their lock.
    pub async fn lookups_in_flight(&self) -> usize {
        self.key_locks.lock().await.len()
    }

    async fn evict_stale(&self, key: &str, stale: &Arc<Tunnel>, cascade: bool) {
        {
            let mut entries = self.entries.write().await;
            if entries
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, stale))
            {
                entries.remove(key);
            }
        }
        stale.stop();
        TunnelMetrics::new(key).record_eviction();
        info!("Evicted stale tunnel {} to {}", key, stale.pod);

        if cascade {
            let evicted = self.evict_backed_by(&stale.pod).await;
            if evicted > 0 {
                info!(
                    "Evicted {} tunnels routed through dead tunnel {}",
                    evicted, key
                );
            }
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Tunnel>> {
        self.entries.read().await.get(key).cloned()
    }

    /// Registers `tunnel` under `key`, stopping whatever it replaces.
    pub async fn insert(&self, key: &str, tunnel: Arc<Tunnel>) {
        let replaced = self
            .entries
            .write()
            .await
            .insert(key.to_string(), tunnel);
        if let Some(old) = replaced {
            old.stop();
        }
    }

    pub async fn remove(&self, key: &str) -> Option<Arc<Tunnel>> {
        let removed = self.entries.write().await.remove(key);
        if let Some(tunnel) = &removed {
            tunnel.stop();
        }
        removed
    }

    /// Stops and removes every tunnel whose backing pod is `pod`.
    pub async fn evict_backed_by(&self, pod: &PodRef) -> usize {
        self.evict_where(|tunnel| &tunnel.pod == pod).await
    }

    /// Stops and removes every tunnel matching `predicate`.
    pub async fn evict_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Tunnel) -> bool,
    {
        let evicted: Vec<(String, Arc<Tunnel>)> = {
            let mut entries = self.entries.write().await;
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, tunnel)| predicate(tunnel))
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key).map(|tunnel| (key, tunnel)))
                .collect()
        };

        for (key, tunnel) in &evicted {
            tunnel.stop();
            TunnelMetrics::new(key.as_str()).record_eviction();
            debug!("Evicted tunnel {} backed by {}", key, tunnel.pod);
        }
        evicted.len()
    }

    /// Stops every tunnel and empties the registry.
    pub async fn shutdown_all(&self) -> usize {
        let drained: Vec<Arc<Tunnel>> = self
            .entries
            .write()
            .await
            .drain()
            .map(|(_, tunnel)| tunnel)
            .collect();

        for tunnel in &drained {
            tunnel.stop();
        }
        if !drained.is_empty() {
            info!("Stopped {} tunnels", drained.len());
        }
        drained.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}
