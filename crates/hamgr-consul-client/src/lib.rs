// hamgr-consul-client: Consul session, lock and health-check client

pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod model;

pub use client::{ConsulClient, LockClient};
pub use config::ConsulClientConfig;
pub use error::ConsulError;
pub use memory::MemoryLockClient;
pub use model::KVPair;
