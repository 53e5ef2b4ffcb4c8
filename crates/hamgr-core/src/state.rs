//! Mutable HA manager state
//!
//! Every field lives behind one mutex and is only reachable through the
//! accessors below, each of which locks for a single read or write. Callers
//! never hold the lock across provider or network I/O.

use std::time::Duration;

use parking_lot::Mutex;

use crate::{config::HealthCheckConfig, model::ServiceIdentity};

/// Registered health check and the id the provider assigned to it
#[derive(Clone, Debug)]
pub struct HealthCheck {
    pub host: String,
    pub path: String,
    pub timeout: String,
    pub interval: Duration,
    pub interval_text: String,
    /// Empty until registration succeeds, cleared on deregistration
    pub check_id: String,
}

impl From<&HealthCheckConfig> for HealthCheck {
    fn from(config: &HealthCheckConfig) -> Self {
        Self {
            host: config.host.clone(),
            path: config.path.clone(),
            timeout: config.timeout.as_str().to_string(),
            interval: config.interval.as_duration(),
            interval_text: config.interval.as_str().to_string(),
            check_id: String::new(),
        }
    }
}

#[derive(Debug)]
struct HaState {
    local: Option<ServiceIdentity>,
    leader: Option<ServiceIdentity>,
    session_id: String,
    health: HealthCheck,
}

pub struct SharedState {
    inner: Mutex<HaState>,
}

impl SharedState {
    pub fn new(health: HealthCheck) -> Self {
        Self {
            inner: Mutex::new(HaState {
                local: None,
                leader: None,
                session_id: String::new(),
                health,
            }),
        }
    }

    pub fn set_service(&self, service: ServiceIdentity) {
        self.inner.lock().local = Some(service);
    }

    pub fn service(&self) -> Option<ServiceIdentity> {
        self.inner.lock().local.clone()
    }

    pub fn set_leader(&self, leader: ServiceIdentity) {
        self.inner.lock().leader = Some(leader);
    }

    pub fn leader(&self) -> Option<ServiceIdentity> {
        self.inner.lock().leader.clone()
    }

    /// True when both identities are known and point at the same endpoint
    pub fn is_leader(&self) -> bool {
        let state = self.inner.lock();
        match (&state.local, &state.leader) {
            (Some(local), Some(leader)) => local.same_endpoint(leader),
            _ => false,
        }
    }

    pub fn set_session_id(&self, session_id: String) {
        self.inner.lock().session_id = session_id;
    }

    pub fn session_id(&self) -> String {
        self.inner.lock().session_id.clone()
    }

    pub fn health_path(&self) -> String {
        self.inner.lock().health.path.clone()
    }

    pub fn health_url(&self) -> String {
        let state = self.inner.lock();
        format!(
            "{}{}",
            state.health.host.trim_end_matches('/'),
            state.health.path
        )
    }

    pub fn health_timeout(&self) -> String {
        self.inner.lock().health.timeout.clone()
    }

    pub fn health_interval(&self) -> Duration {
        self.inner.lock().health.interval
    }

    pub fn health_interval_text(&self) -> String {
        self.inner.lock().health.interval_text.clone()
    }

    pub fn set_check_id(&self, check_id: String) {
        self.inner.lock().health.check_id = check_id;
    }

    pub fn check_id(&self) -> String {
        self.inner.lock().health.check_id.clone()
    }
}
