// Configuration for ConsulClient

/// Configuration for the Consul HTTP client
#[derive(Clone)]
pub struct ConsulClientConfig {
    /// Datacenter sent as the `dc` query parameter, empty means the agent's own
    pub region: String,
    /// Agent addresses (e.g. ["http://127.0.0.1:8500"]), tried in order on failure
    pub server_addrs: Vec<String>,
    /// ACL token sent as `X-Consul-Token`
    pub token: Option<String>,
    /// Connection timeout in milliseconds (default: 3000)
    pub connect_timeout_ms: u64,
    /// Read timeout in milliseconds (default: 10000)
    pub read_timeout_ms: u64,
    /// Lock delay requested for new sessions (e.g. "15s")
    pub lock_delay: Option<String>,
}

impl Default for ConsulClientConfig {
    fn default() -> Self {
        Self {
            region: String::new(),
            server_addrs: vec!["http://127.0.0.1:8500".to_string()],
            token: None,
            connect_timeout_ms: 3000,
            read_timeout_ms: 10000,
            lock_delay: None,
        }
    }
}

impl std::fmt::Debug for ConsulClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsulClientConfig")
            .field("region", &self.region)
            .field("server_addrs", &self.server_addrs)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("lock_delay", &self.lock_delay)
            .finish()
    }
}

impl ConsulClientConfig {
    /// Create a config for a single agent address. A bare `host:port` gets an
    /// `http://` scheme.
    pub fn new(region: &str, addr: &str) -> Self {
        Self {
            region: region.to_string(),
            server_addrs: vec![normalize_addr(addr)],
            ..Default::default()
        }
    }

    pub fn with_servers(mut self, server_addrs: Vec<String>) -> Self {
        self.server_addrs = server_addrs.iter().map(|a| normalize_addr(a)).collect();
        self
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn with_timeouts(mut self, connect_ms: u64, read_ms: u64) -> Self {
        self.connect_timeout_ms = connect_ms;
        self.read_timeout_ms = read_ms;
        self
    }

    pub fn with_lock_delay(mut self, lock_delay: &str) -> Self {
        self.lock_delay = Some(lock_delay.to_string());
        self
    }
}

fn normalize_addr(addr: &str) -> String {
    let addr = addr.trim().trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}
