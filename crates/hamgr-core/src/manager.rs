//! HA manager lifecycle
//!
//! Setup registers a health check with the lock provider and opens a session
//! bound to it; start spawns the heartbeat that competes for the service lock;
//! stop joins the heartbeat, releases the lock and removes the check.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use hamgr_consul_client::{ConsulClient, LockClient};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    config::{CHECK_PROPAGATION_MARGIN, ConsulConfig, HaManagerConfig, HttpHeaders},
    error::HaError,
    heartbeat::{self, HeartbeatOutcome},
    model::ServiceIdentity,
    proxy::FailoverProxy,
    state::{HealthCheck, SharedState},
};

/// Leader election and failover capability of one service instance
#[async_trait]
pub trait HighAvailability: Send + Sync {
    /// Set this instance's identity; must happen before `setup`
    fn register(&self, service: ServiceIdentity);

    fn service(&self) -> Option<ServiceIdentity>;

    /// Best-known leader, possibly one heartbeat behind
    fn leader(&self) -> Option<ServiceIdentity>;

    fn update_leader(&self, leader: ServiceIdentity);

    fn is_leader(&self) -> bool;

    /// Register the health check, wait for it to pass, create the session
    async fn setup(&self) -> Result<(), HaError>;

    /// Spawn the heartbeat. Must be called from within a tokio runtime.
    fn start(&self);

    /// Stop the heartbeat, release the lock and deregister the check.
    ///
    /// The provider keeps the lock unavailable for its lock-delay after
    /// release; keep serving for that long before exiting.
    async fn stop(&self);

    /// Middleware serving locally or forwarding to the leader
    fn handler(&self) -> FailoverProxy;
}

pub(crate) struct Shared {
    pub(crate) client: Arc<dyn LockClient>,
    pub(crate) state: SharedState,
    pub(crate) headers: HttpHeaders,
    pub(crate) http: reqwest::Client,
    pub(crate) heartbeat_interval: Duration,
    strict_setup: bool,
    pub(crate) stop_requested: AtomicBool,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

/// The HA manager. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct HaManager {
    pub(crate) shared: Arc<Shared>,
}

impl HaManager {
    /// Create a manager talking to a Consul agent
    pub fn new(consul: &ConsulConfig, config: &HaManagerConfig) -> Result<Self, HaError> {
        let client = ConsulClient::new(consul.to_client_config())?;
        Ok(Self::with_client(Arc::new(client), config))
    }

    /// Create a manager over any lock client
    pub fn with_client(client: Arc<dyn LockClient>, config: &HaManagerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                state: SharedState::new(HealthCheck::from(&config.health_check)),
                headers: config.http_headers.clone(),
                http: reqwest::Client::new(),
                heartbeat_interval: config.heartbeat_interval.as_duration(),
                strict_setup: config.strict_setup,
                stop_requested: AtomicBool::new(false),
                heartbeat: Mutex::new(None),
            }),
        }
    }

    pub fn session_id(&self) -> String {
        self.shared.state.session_id()
    }

    pub fn check_id(&self) -> String {
        self.shared.state.check_id()
    }

    pub fn health_path(&self) -> String {
        self.shared.state.health_path()
    }

    /// Run a single heartbeat iteration outside the background loop
    pub async fn heartbeat_once(&self) -> Result<HeartbeatOutcome, HaError> {
        let local = self.shared.state.service().ok_or(HaError::NotRegistered)?;
        let value = serde_json::to_vec(&local)?;
        Ok(self.shared.tick(&local, &value).await)
    }
}

impl Shared {
    fn local(&self) -> Result<ServiceIdentity, HaError> {
        self.state.service().ok_or(HaError::NotRegistered)
    }

    pub(crate) async fn create_session(&self) -> Result<String, HaError> {
        let local = self.local()?;
        let check_id = self.state.check_id();

        let session_id = self
            .client
            .create_session(&local.name, &check_id)
            .await
            .inspect_err(|e| error!("fail to create session, err: {}", e))?;
        self.state.set_session_id(session_id.clone());
        info!("succeed to update session id [{}]", session_id);
        Ok(session_id)
    }

    async fn release_session(&self) -> Result<(), HaError> {
        let local = self.local()?;
        let session_id = self.state.session_id();
        let value = serde_json::to_vec(&local)?;

        let released = self
            .client
            .release_kv(&local.name, &value, &session_id)
            .await?;
        debug!("release kv [{}] returned {}", local.name, released);

        if released {
            Ok(())
        } else {
            Err(HaError::LockNotHeld {
                key: local.name,
                session_id,
            })
        }
    }

    async fn register_health_check(&self) -> Result<(), HaError> {
        let local = self.local()?;
        let url = self.state.health_url();
        let timeout = self.state.health_timeout();
        let interval = self.state.health_interval_text();

        let check_id = self
            .client
            .register_check(&local.name, &url, &timeout, &interval)
            .await?;
        info!("registered health check [{}] for {}", check_id, url);
        self.state.set_check_id(check_id);
        Ok(())
    }

    async fn deregister_health_check(&self) -> Result<(), HaError> {
        let check_id = self.state.check_id();
        let result = self.client.deregister_check(&check_id).await;
        self.state.set_check_id(String::new());
        result.map_err(HaError::from)
    }
}

#[async_trait]
impl HighAvailability for HaManager {
    fn register(&self, service: ServiceIdentity) {
        self.shared.state.set_service(service);
    }

    fn service(&self) -> Option<ServiceIdentity> {
        self.shared.state.service()
    }

    fn leader(&self) -> Option<ServiceIdentity> {
        self.shared.state.leader()
    }

    fn update_leader(&self, leader: ServiceIdentity) {
        self.shared.state.set_leader(leader);
    }

    fn is_leader(&self) -> bool {
        self.shared.state.is_leader()
    }

    async fn setup(&self) -> Result<(), HaError> {
        self.shared.local()?;

        if let Err(e) = self.shared.register_health_check().await {
            if self.shared.strict_setup {
                return Err(e);
            }
            error!("fail to register health check, continuing with session creation: {}", e);
        }

        // A fresh check starts critical and the provider refuses sessions bound
        // to a critical check, so give it one full interval to run.
        let wait = self.shared.state.health_interval() + CHECK_PROPAGATION_MARGIN;
        debug!("waiting {:?} for the health check to pass", wait);
        tokio::time::sleep(wait).await;

        self.shared.create_session().await?;
        Ok(())
    }

    fn start(&self) {
        if self.shared.stop_requested.load(Ordering::SeqCst) {
            warn!("HA manager is stopped, not starting heartbeat");
            return;
        }

        let mut heartbeat = self.shared.heartbeat.lock();
        if heartbeat.as_ref().is_some_and(|handle| !handle.is_finished()) {
            warn!("heartbeat is already running");
            return;
        }
        *heartbeat = Some(tokio::spawn(heartbeat::run(self.shared.clone())));
    }

    async fn stop(&self) {
        if self.shared.stop_requested.swap(true, Ordering::SeqCst) {
            warn!("HA manager is already stopped");
            return;
        }

        let handle = self.shared.heartbeat.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!("heartbeat task failed: {}", e);
        }

        match self.shared.release_session().await {
            Ok(()) => info!("release session done"),
            Err(e) => error!("fail to release session, err: {}", e),
        }

        match self.shared.deregister_health_check().await {
            Ok(()) => info!("deregister health check done"),
            Err(e) => error!("fail to deregister health check, err: {}", e),
        }

        info!("ha: gracefully shut down");
    }

    fn handler(&self) -> FailoverProxy {
        FailoverProxy::new(self.clone())
    }
}
