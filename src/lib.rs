pub mod broker;
pub mod cluster;
pub mod config;
pub mod error;
pub mod liveness;
pub mod metrics;
pub mod proxy;
pub mod registry;
pub mod selector;
pub mod service;
pub mod tunnel;
pub mod util;

pub use broker::TunnelBroker;
pub use error::{Result, TunnelError};
