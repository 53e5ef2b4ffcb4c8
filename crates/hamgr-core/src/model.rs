// Service identity shared between instances through the lock value

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Network identity of one service instance.
///
/// Serialized as `{"name": .., "ip": .., "port": ..}` and stored as the lock
/// value, so whoever reads the lock learns where the leader listens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub name: String,
    pub ip: String,
    pub port: u16,
}

impl ServiceIdentity {
    pub fn new(name: &str, ip: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            ip: ip.to_string(),
            port,
        }
    }

    /// Two identities denote the same node when address and port match
    pub fn same_endpoint(&self, other: &ServiceIdentity) -> bool {
        self.ip == other.ip && self.port == other.port
    }

    /// `ip:port` authority used to reach this instance
    pub fn authority(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl Display for ServiceIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{name: {}, ip: {}, port: {}}}", self.name, self.ip, self.port)
    }
}
