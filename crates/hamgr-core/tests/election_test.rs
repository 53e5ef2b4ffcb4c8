//! Leader election against an in-memory lock provider
//!
//! Time is paused, so heartbeat periods and lock-delays elapse instantly while
//! keeping their relative order.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hamgr_consul_client::{
    ConsulError, KVPair, LockClient, MemoryLockClient, memory::CheckStatus,
};
use hamgr_core::{
    ConsulDuration, HaError, HaManager, HaManagerConfig, HealthCheckConfig, HeartbeatOutcome,
    HighAvailability, HttpHeaders, ServiceIdentity,
};

const SERVICE: &str = "svc";
const PERIOD: Duration = Duration::from_secs(3);

fn config() -> HaManagerConfig {
    HaManagerConfig {
        health_check: HealthCheckConfig {
            host: "http://127.0.0.1:8080".to_string(),
            path: "/v1/health".to_string(),
            timeout: ConsulDuration::from_secs(1),
            interval: ConsulDuration::from_secs(1),
        },
        http_headers: HttpHeaders::default(),
        heartbeat_interval: ConsulDuration::from_secs(PERIOD.as_secs()),
        strict_setup: false,
    }
}

fn identity(port: u16) -> ServiceIdentity {
    ServiceIdentity::new(SERVICE, "127.0.0.1", port)
}

fn manager(client: Arc<dyn LockClient>, port: u16) -> HaManager {
    let manager = HaManager::with_client(client, &config());
    manager.register(identity(port));
    manager
}

async fn cluster(client: &Arc<MemoryLockClient>, size: u16) -> Vec<HaManager> {
    let mut managers = Vec::new();
    for i in 0..size {
        let m = manager(client.clone(), 8080 + i);
        m.setup().await.unwrap();
        managers.push(m);
    }
    for m in &managers {
        m.start();
    }
    managers
}

fn leaders(managers: &[HaManager]) -> usize {
    managers.iter().filter(|m| m.is_leader()).count()
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_leader() {
    let client = Arc::new(MemoryLockClient::new());
    let managers = cluster(&client, 3).await;

    for _ in 0..30 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(leaders(&managers) <= 1);
    }

    assert_eq!(leaders(&managers), 1);
    let leader = managers.iter().find(|m| m.is_leader()).unwrap().service();
    for m in &managers {
        assert_eq!(m.leader(), leader);
    }

    for m in &managers {
        m.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_survivors_converge_after_leader_stops() {
    let lock_delay = Duration::from_secs(10);
    let client = Arc::new(MemoryLockClient::with_lock_delay(lock_delay));
    let managers = cluster(&client, 3).await;

    tokio::time::sleep(PERIOD * 2).await;
    let index = managers.iter().position(|m| m.is_leader()).unwrap();
    let old_leader = managers[index].clone();
    let survivors: Vec<HaManager> = managers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != index)
        .map(|(_, m)| m.clone())
        .collect();

    old_leader.stop().await;
    assert!(client.holder(SERVICE).is_none());

    let bound = lock_delay.as_secs().div_ceil(PERIOD.as_secs()) + 2;
    let mut converged = false;
    for _ in 0..bound {
        tokio::time::sleep(PERIOD).await;
        let new_leader = survivors.iter().find(|m| m.is_leader()).map(|m| m.service());
        if let Some(new_leader) = new_leader
            && leaders(&survivors) == 1
            && survivors.iter().all(|m| m.leader() == new_leader)
        {
            converged = true;
            break;
        }
    }
    assert!(converged, "survivors did not elect a new leader in time");

    for m in &survivors {
        m.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_invalidated_session_is_recreated_once() {
    let client = Arc::new(MemoryLockClient::new());
    let m = manager(client.clone(), 8080);
    m.setup().await.unwrap();
    assert_eq!(client.create_session_calls(), 1);
    assert_eq!(m.heartbeat_once().await.unwrap(), HeartbeatOutcome::Elected);

    for round in 1..=3 {
        let old_session = m.session_id();
        assert!(client.invalidate_session(&old_session));

        assert_eq!(
            m.heartbeat_once().await.unwrap(),
            HeartbeatOutcome::SessionRenewed
        );
        assert_eq!(client.create_session_calls(), 1 + round);
        assert_ne!(m.session_id(), old_session);
        assert!(client.session_exists(&m.session_id()));

        // Lock-delay keeps the key free but unavailable; the stale value still
        // names this node.
        assert_eq!(
            m.heartbeat_once().await.unwrap(),
            HeartbeatOutcome::Following(identity(8080))
        );
        assert_eq!(client.create_session_calls(), 1 + round);
    }

    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(m.heartbeat_once().await.unwrap(), HeartbeatOutcome::Elected);
    assert_eq!(client.holder(SERVICE), Some(m.session_id()));
}

#[tokio::test(start_paused = true)]
async fn test_session_renewal_retries_until_check_passes() {
    let client = Arc::new(MemoryLockClient::new());
    let m = manager(client.clone(), 8080);
    m.setup().await.unwrap();

    let check_id = m.check_id();
    assert!(client.set_check_status(&check_id, CheckStatus::Critical));
    assert!(!client.session_exists(&m.session_id()));

    assert_eq!(
        m.heartbeat_once().await.unwrap(),
        HeartbeatOutcome::SessionRenewFailed
    );
    assert_eq!(
        m.heartbeat_once().await.unwrap(),
        HeartbeatOutcome::SessionRenewFailed
    );

    assert!(client.set_check_status(&check_id, CheckStatus::Passing));
    assert_eq!(
        m.heartbeat_once().await.unwrap(),
        HeartbeatOutcome::SessionRenewed
    );
    assert!(client.session_exists(&m.session_id()));
}

#[tokio::test(start_paused = true)]
async fn test_provider_outage_leaves_state_unchanged() {
    let client = Arc::new(MemoryLockClient::new());
    let m = manager(client.clone(), 8080);
    m.setup().await.unwrap();
    assert_eq!(m.heartbeat_once().await.unwrap(), HeartbeatOutcome::Elected);
    let session_id = m.session_id();

    client.set_unavailable(true);
    assert_eq!(m.heartbeat_once().await.unwrap(), HeartbeatOutcome::Failed);
    assert!(m.is_leader());
    assert_eq!(m.session_id(), session_id);

    client.set_unavailable(false);
    assert_eq!(m.heartbeat_once().await.unwrap(), HeartbeatOutcome::Elected);
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_lock_value_keeps_previous_leader() {
    let client = Arc::new(MemoryLockClient::new());
    let holder = manager(client.clone(), 8080);
    let follower = manager(client.clone(), 8081);
    holder.setup().await.unwrap();
    follower.setup().await.unwrap();

    assert_eq!(
        holder.heartbeat_once().await.unwrap(),
        HeartbeatOutcome::Elected
    );
    assert_eq!(
        follower.heartbeat_once().await.unwrap(),
        HeartbeatOutcome::Following(identity(8080))
    );

    client.put(SERVICE, b"not json");
    assert_eq!(
        follower.heartbeat_once().await.unwrap(),
        HeartbeatOutcome::Failed
    );
    assert_eq!(follower.leader(), Some(identity(8080)));
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_start_releases_once() {
    let client = Arc::new(MemoryLockClient::new());
    let m = manager(client.clone(), 8080);
    m.setup().await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), m.stop())
        .await
        .expect("stop must not wait for a heartbeat that never started");

    assert_eq!(client.release_calls(), 1);
    assert_eq!(client.deregister_calls(), 1);
    assert!(m.check_id().is_empty());
    assert!(client.check_ids().is_empty());

    // Start after stop is refused and a second stop is a no-op
    m.start();
    m.stop().await;
    tokio::time::sleep(PERIOD * 3).await;
    assert_eq!(client.acquire_calls(), 0);
    assert_eq!(client.release_calls(), 1);
    assert_eq!(client.deregister_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_joins_heartbeat_and_releases_lock() {
    let client = Arc::new(MemoryLockClient::new());
    let m = manager(client.clone(), 8080);
    m.setup().await.unwrap();
    m.start();
    m.start();

    tokio::time::sleep(PERIOD + Duration::from_secs(1)).await;
    assert!(m.is_leader());
    assert_eq!(client.holder(SERVICE), Some(m.session_id()));

    m.stop().await;
    assert!(client.holder(SERVICE).is_none());
    assert_eq!(client.release_calls(), 1);
    assert_eq!(client.deregister_calls(), 1);

    let calls = client.acquire_calls();
    tokio::time::sleep(PERIOD * 5).await;
    assert_eq!(client.acquire_calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn test_setup_requires_registered_service() {
    let client = Arc::new(MemoryLockClient::new());
    let m = HaManager::with_client(client, &config());
    assert!(matches!(m.setup().await, Err(HaError::NotRegistered)));
}

#[tokio::test(start_paused = true)]
async fn test_setup_waits_for_first_check_run() {
    let client = Arc::new(MemoryLockClient::new());
    let m = manager(client.clone(), 8080);

    let started = tokio::time::Instant::now();
    m.setup().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(2));

    let check_id = m.check_id();
    assert!(check_id.starts_with("svc:ha:"));
    assert_eq!(
        client.check_url(&check_id).as_deref(),
        Some("http://127.0.0.1:8080/v1/health")
    );
    assert_eq!(client.session_name(&m.session_id()).as_deref(), Some(SERVICE));
}

/// Provider whose check registration always fails
#[derive(Default)]
struct NoCheckClient {
    sessions: AtomicUsize,
}

#[async_trait]
impl LockClient for NoCheckClient {
    async fn create_session(&self, _: &str, _: &str) -> Result<String, ConsulError> {
        let n = self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(format!("session-{}", n))
    }

    async fn acquire_kv(&self, _: &str, _: &[u8], _: &str) -> Result<bool, ConsulError> {
        Ok(false)
    }

    async fn release_kv(&self, _: &str, _: &[u8], _: &str) -> Result<bool, ConsulError> {
        Ok(false)
    }

    async fn get_kv(&self, _: &str) -> Result<Option<KVPair>, ConsulError> {
        Ok(None)
    }

    async fn register_check(&self, _: &str, _: &str, _: &str, _: &str) -> Result<String, ConsulError> {
        Err(ConsulError::RequestFailed {
            status: 500,
            body: "agent is shutting down".to_string(),
        })
    }

    async fn deregister_check(&self, _: &str) -> Result<(), ConsulError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_setup_continues_after_check_registration_failure() {
    let client = Arc::new(NoCheckClient::default());
    let m = manager(client.clone(), 8080);

    m.setup().await.unwrap();
    assert_eq!(m.session_id(), "session-0");
    assert!(m.check_id().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_strict_setup_fails_on_check_registration_failure() {
    let client = Arc::new(NoCheckClient::default());
    let mut config = config();
    config.strict_setup = true;
    let m = HaManager::with_client(client.clone(), &config);
    m.register(identity(8080));

    assert!(matches!(m.setup().await, Err(HaError::Consul(_))));
    assert_eq!(client.sessions.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_empty_lock_leaves_leader_unknown() {
    let client = Arc::new(NoCheckClient::default());
    let m = manager(client, 8080);
    m.setup().await.unwrap();

    assert_eq!(m.heartbeat_once().await.unwrap(), HeartbeatOutcome::NoHolder);
    assert!(m.leader().is_none());
    assert!(!m.is_leader());
}
