//! Consul wire models used by the lock client
//!
//! Only the fields the election protocol needs are modelled; Consul ignores
//! absent optional fields on requests and we ignore unknown fields on replies.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Session create request (`PUT /v1/session/create`)
#[derive(Debug, Clone, Serialize, Default)]
pub struct SessionCreateRequest {
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Checks the session is bound to; `serfHealth` keeps the node-level check
    #[serde(rename = "Checks", skip_serializing_if = "Option::is_none")]
    pub checks: Option<Vec<String>>,
    #[serde(rename = "LockDelay", skip_serializing_if = "Option::is_none")]
    pub lock_delay: Option<String>,
    #[serde(rename = "Behavior", skip_serializing_if = "Option::is_none")]
    pub behavior: Option<String>,
}

impl SessionCreateRequest {
    pub fn for_check(service_name: &str, check_id: &str, lock_delay: Option<String>) -> Self {
        Self {
            name: Some(service_name.to_string()),
            checks: Some(vec![SERF_HEALTH_CHECK.to_string(), check_id.to_string()]),
            lock_delay,
            behavior: Some("release".to_string()),
        }
    }
}

pub const SERF_HEALTH_CHECK: &str = "serfHealth";

/// Session create response
#[derive(Debug, Clone, Deserialize)]
pub struct SessionCreateResponse {
    #[serde(rename = "ID")]
    pub id: String,
}

/// Agent check registration (`PUT /v1/agent/check/register`)
#[derive(Debug, Clone, Serialize)]
pub struct CheckRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "HTTP")]
    pub http: String,
    #[serde(rename = "Interval")]
    pub interval: String,
    #[serde(rename = "Timeout")]
    pub timeout: String,
}

/// KV entry as returned by `GET /v1/kv/{key}`, value still base64 encoded
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct KVEntry {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value", default)]
    pub value: Option<String>,
    #[serde(rename = "Session", default)]
    pub session: Option<String>,
    #[serde(rename = "LockIndex", default)]
    pub lock_index: u64,
    #[serde(rename = "ModifyIndex", default)]
    pub modify_index: u64,
}

/// A decoded KV pair
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KVPair {
    pub key: String,
    pub value: Vec<u8>,
    /// Session currently holding the key, if locked
    pub session: Option<String>,
    pub lock_index: u64,
    pub modify_index: u64,
}

impl KVEntry {
    pub(crate) fn decode(self) -> Result<KVPair> {
        let value = match self.value {
            Some(encoded) => base64::engine::general_purpose::STANDARD.decode(encoded)?,
            None => Vec::new(),
        };
        Ok(KVPair {
            key: self.key,
            value,
            session: self.session,
            lock_index: self.lock_index,
            modify_index: self.modify_index,
        })
    }
}
