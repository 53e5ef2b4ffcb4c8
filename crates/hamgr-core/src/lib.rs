//! Leader election and request failover for replicated HTTP services
//!
//! Instances of one service compete for a lock held in Consul. The winner
//! serves requests; everyone else forwards them to it through
//! [`FailoverProxy`].

pub mod config;
pub mod error;
mod heartbeat;
pub mod manager;
pub mod model;
pub mod proxy;
pub mod state;

pub use config::{ConsulConfig, ConsulDuration, HaManagerConfig, HealthCheckConfig, HttpHeaders};
pub use error::{FailoverError, HaError};
pub use heartbeat::HeartbeatOutcome;
pub use manager::{HaManager, HighAvailability};
pub use model::ServiceIdentity;
pub use proxy::FailoverProxy;
