//! In-process lock provider with Consul session semantics
//!
//! Sessions are bound to a check; a key is held by at most one session; when a
//! lock is released or its session is invalidated the key enters a lock-delay
//! window during which nobody can acquire it. Time is measured with the tokio
//! clock so paused-time tests can step through delays.
//!
//! Used by tests and for running a single node without a Consul agent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    client::LockClient,
    error::{ConsulError, Result},
    model::KVPair,
};

/// Consul's default session lock-delay
pub const DEFAULT_LOCK_DELAY: Duration = Duration::from_secs(15);

/// Health status of a registered check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Passing,
    Critical,
}

#[derive(Debug, Clone)]
struct MemoryCheck {
    url: String,
    status: CheckStatus,
}

#[derive(Debug, Clone)]
struct MemorySession {
    name: String,
    check_id: String,
}

#[derive(Debug, Clone, Default)]
struct MemoryEntry {
    value: Vec<u8>,
    session: Option<String>,
    lock_index: u64,
    modify_index: u64,
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, MemorySession>,
    checks: HashMap<String, MemoryCheck>,
    kv: HashMap<String, MemoryEntry>,
    lock_delays: HashMap<String, Instant>,
    index: u64,
}

impl MemoryState {
    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    /// Drop a session and release its locks under lock-delay
    fn invalidate(&mut self, session_id: &str, lock_delay: Duration) -> bool {
        if self.sessions.remove(session_id).is_none() {
            return false;
        }
        let until = Instant::now() + lock_delay;
        let index = self.next_index();
        for (key, entry) in self.kv.iter_mut() {
            if entry.session.as_deref() == Some(session_id) {
                entry.session = None;
                entry.modify_index = index;
                self.lock_delays.insert(key.clone(), until);
            }
        }
        true
    }

    fn invalidate_check(&mut self, check_id: &str, lock_delay: Duration) {
        let bound: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.check_id == check_id)
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in bound {
            debug!("Invalidating session {} bound to check {}", session_id, check_id);
            self.invalidate(&session_id, lock_delay);
        }
    }

    fn in_lock_delay(&self, key: &str) -> bool {
        self.lock_delays
            .get(key)
            .is_some_and(|until| Instant::now() < *until)
    }
}

/// In-memory [`LockClient`]
pub struct MemoryLockClient {
    state: Mutex<MemoryState>,
    lock_delay: Duration,
    unavailable: AtomicBool,
    acquire_calls: AtomicUsize,
    create_session_calls: AtomicUsize,
    release_calls: AtomicUsize,
    deregister_calls: AtomicUsize,
}

impl Default for MemoryLockClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLockClient {
    pub fn new() -> Self {
        Self::with_lock_delay(DEFAULT_LOCK_DELAY)
    }

    pub fn with_lock_delay(lock_delay: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            lock_delay,
            unavailable: AtomicBool::new(false),
            acquire_calls: AtomicUsize::new(0),
            create_session_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
            deregister_calls: AtomicUsize::new(0),
        }
    }

    /// Make every call fail as if the provider were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Change a check's status. Marking it critical invalidates every session
    /// bound to it, as Consul does once a check fails.
    pub fn set_check_status(&self, check_id: &str, status: CheckStatus) -> bool {
        let mut state = self.state.lock();
        let Some(check) = state.checks.get_mut(check_id) else {
            return false;
        };
        check.status = status;
        if status == CheckStatus::Critical {
            state.invalidate_check(check_id, self.lock_delay);
        }
        true
    }

    /// Invalidate a session as if it had been reaped, returns false when unknown
    pub fn invalidate_session(&self, session_id: &str) -> bool {
        self.state.lock().invalidate(session_id, self.lock_delay)
    }

    /// Write a raw value without taking the lock
    pub fn put(&self, key: &str, value: &[u8]) {
        let mut state = self.state.lock();
        let index = state.next_index();
        let entry = state.kv.entry(key.to_string()).or_default();
        entry.value = value.to_vec();
        entry.modify_index = index;
    }

    /// Session currently holding `key`
    pub fn holder(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .kv
            .get(key)
            .and_then(|entry| entry.session.clone())
    }

    pub fn session_exists(&self, session_id: &str) -> bool {
        self.state.lock().sessions.contains_key(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn session_name(&self, session_id: &str) -> Option<String> {
        self.state
            .lock()
            .sessions
            .get(session_id)
            .map(|s| s.name.clone())
    }

    pub fn check_ids(&self) -> Vec<String> {
        self.state.lock().checks.keys().cloned().collect()
    }

    pub fn check_url(&self, check_id: &str) -> Option<String> {
        self.state
            .lock()
            .checks
            .get(check_id)
            .map(|c| c.url.clone())
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    pub fn create_session_calls(&self) -> usize {
        self.create_session_calls.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    pub fn deregister_calls(&self) -> usize {
        self.deregister_calls.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ConsulError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LockClient for MemoryLockClient {
    async fn create_session(&self, service_name: &str, check_id: &str) -> Result<String> {
        self.create_session_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;

        let mut state = self.state.lock();
        match state.checks.get(check_id) {
            None => {
                return Err(ConsulError::RequestFailed {
                    status: 500,
                    body: format!("Missing check '{}' registration", check_id),
                });
            }
            Some(check) if check.status == CheckStatus::Critical => {
                return Err(ConsulError::RequestFailed {
                    status: 500,
                    body: format!("Check '{}' is in critical state", check_id),
                });
            }
            Some(_) => {}
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        state.sessions.insert(
            session_id.clone(),
            MemorySession {
                name: service_name.to_string(),
                check_id: check_id.to_string(),
            },
        );
        Ok(session_id)
    }

    async fn acquire_kv(&self, key: &str, value: &[u8], session_id: &str) -> Result<bool> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;

        let mut state = self.state.lock();
        if !state.sessions.contains_key(session_id) {
            return Err(ConsulError::SessionNotFound(session_id.to_string()));
        }

        let held_by_other = state
            .kv
            .get(key)
            .and_then(|entry| entry.session.as_deref())
            .is_some_and(|holder| holder != session_id);
        if held_by_other {
            return Ok(false);
        }

        let reacquire = state
            .kv
            .get(key)
            .is_some_and(|entry| entry.session.as_deref() == Some(session_id));
        if !reacquire && state.in_lock_delay(key) {
            return Ok(false);
        }

        let index = state.next_index();
        let entry = state.kv.entry(key.to_string()).or_default();
        entry.value = value.to_vec();
        entry.modify_index = index;
        if !reacquire {
            entry.lock_index += 1;
            entry.session = Some(session_id.to_string());
        }
        Ok(true)
    }

    async fn release_kv(&self, key: &str, value: &[u8], session_id: &str) -> Result<bool> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let index = state.next_index();
        let until = Instant::now() + self.lock_delay;
        match state.kv.get_mut(key) {
            Some(entry) if entry.session.as_deref() == Some(session_id) => {
                entry.value = value.to_vec();
                entry.session = None;
                entry.modify_index = index;
                state.lock_delays.insert(key.to_string(), until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_kv(&self, key: &str) -> Result<Option<KVPair>> {
        self.ensure_available()?;

        let state = self.state.lock();
        Ok(state.kv.get(key).map(|entry| KVPair {
            key: key.to_string(),
            value: entry.value.clone(),
            session: entry.session.clone(),
            lock_index: entry.lock_index,
            modify_index: entry.modify_index,
        }))
    }

    async fn register_check(
        &self,
        service_name: &str,
        url: &str,
        _timeout: &str,
        _interval: &str,
    ) -> Result<String> {
        self.ensure_available()?;

        let check_id = format!("{}:ha:{}", service_name, uuid::Uuid::new_v4().simple());
        self.state.lock().checks.insert(
            check_id.clone(),
            MemoryCheck {
                url: url.to_string(),
                status: CheckStatus::Passing,
            },
        );
        Ok(check_id)
    }

    async fn deregister_check(&self, check_id: &str) -> Result<()> {
        self.deregister_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;

        let mut state = self.state.lock();
        if state.checks.remove(check_id).is_none() {
            return Err(ConsulError::NotFound(format!("check '{}'", check_id)));
        }
        state.invalidate_check(check_id, self.lock_delay);
        Ok(())
    }
}
