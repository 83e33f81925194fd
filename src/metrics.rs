use metrics::{counter, gauge};

#[derive(Clone, Debug, PartialEq)]
pub struct TunnelMetrics {
    pub(crate) key: String,
}

impl TunnelMetrics {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn record_establish_attempt(&self) {
        counter!("tunnel_establish_attempts_total", "tunnel" => self.key.clone()).increment(1);
    }

    pub fn record_establish_success(&self) {
        counter!("tunnel_establish_successes_total", "tunnel" => self.key.clone()).increment(1);
    }

    pub fn record_establish_failure(&self) {
        counter!("tunnel_establish_failures_total", "tunnel" => self.key.clone()).increment(1);
    }

    pub fn record_eviction(&self) {
        counter!("tunnel_evictions_total", "tunnel" => self.key.clone()).increment(1);
    }

    pub fn set_active(&self, active: bool) {
        let gauge = gauge!("tunnel_active", "tunnel" => self.key.clone());
        gauge.set(if active { 1.0 } else { 0.0 });
    }
}
