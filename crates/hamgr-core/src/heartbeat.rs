//! Periodic lock acquisition
//!
//! Each iteration tries to take the service lock with the current session. The
//! winner records itself as leader; everyone else reads the lock value to learn
//! who holds it. An invalidated session is replaced on the spot.

use std::sync::{Arc, atomic::Ordering};

use tracing::{debug, error, info, warn};

use crate::{manager::Shared, model::ServiceIdentity};

/// What a single heartbeat iteration did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// This instance holds the lock
    Elected,
    /// Another instance holds the lock
    Following(ServiceIdentity),
    /// The session was gone and a new one was created
    SessionRenewed,
    /// The session was gone and creating a new one failed
    SessionRenewFailed,
    /// Lock not acquired and no value stored under the key
    NoHolder,
    /// Provider or decoding error; state left unchanged
    Failed,
}

impl Shared {
    pub(crate) async fn tick(&self, local: &ServiceIdentity, value: &[u8]) -> HeartbeatOutcome {
        let session_id = self.state.session_id();
        if session_id.is_empty() {
            return self.renew_session().await;
        }

        match self.client.acquire_kv(&local.name, value, &session_id).await {
            Ok(true) => {
                if !self.state.is_leader() {
                    info!("{} is elected as leader", local);
                }
                self.state.set_leader(local.clone());
                HeartbeatOutcome::Elected
            }
            Ok(false) => self.follow(&local.name).await,
            Err(e) if e.is_session_not_found() => {
                info!("session [{}] is invalid, creating a new one", session_id);
                self.renew_session().await
            }
            Err(e) => {
                error!("fail to acquire lock [{}], err: {}", local.name, e);
                HeartbeatOutcome::Failed
            }
        }
    }

    async fn renew_session(&self) -> HeartbeatOutcome {
        match self.create_session().await {
            Ok(_) => HeartbeatOutcome::SessionRenewed,
            Err(_) => HeartbeatOutcome::SessionRenewFailed,
        }
    }

    async fn follow(&self, key: &str) -> HeartbeatOutcome {
        let pair = match self.client.get_kv(key).await {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                warn!("lock [{}] has no value, leader is unknown", key);
                return HeartbeatOutcome::NoHolder;
            }
            Err(e) => {
                error!("fail to get kv [{}], err: {}", key, e);
                return HeartbeatOutcome::Failed;
            }
        };

        let leader: ServiceIdentity = match serde_json::from_slice(&pair.value) {
            Ok(leader) => leader,
            Err(e) => {
                error!(
                    "fail to decode leader from kv [{}]: {}, value: {}",
                    key,
                    e,
                    String::from_utf8_lossy(&pair.value)
                );
                return HeartbeatOutcome::Failed;
            }
        };

        if self.state.leader().as_ref() != Some(&leader) {
            info!("leader is {}", leader);
        }
        self.state.set_leader(leader.clone());
        HeartbeatOutcome::Following(leader)
    }
}

pub(crate) async fn run(shared: Arc<Shared>) {
    let Some(local) = shared.state.service() else {
        error!("heartbeat started without a registered service");
        return;
    };
    let value = match serde_json::to_vec(&local) {
        Ok(value) => value,
        Err(e) => {
            error!("fail to encode local service {}: {}", local, e);
            return;
        }
    };

    info!(
        "heartbeat started for {} every {:?}",
        local, shared.heartbeat_interval
    );
    loop {
        tokio::time::sleep(shared.heartbeat_interval).await;
        if shared.stop_requested.load(Ordering::SeqCst) {
            break;
        }

        let outcome = shared.tick(&local, &value).await;
        debug!("heartbeat outcome: {:?}", outcome);
    }
    info!("heartbeat stopped");
}
