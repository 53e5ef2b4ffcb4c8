//! Lock client abstraction and its Consul HTTP implementation
//!
//! [`LockClient`] is the narrow surface the HA manager consumes: sessions,
//! session-scoped key locks and agent health checks. [`ConsulClient`] talks to
//! a Consul agent over HTTP and fails over across the configured agents when a
//! connection cannot be established.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use crate::{
    config::ConsulClientConfig,
    error::{ConsulError, Result},
    model::{CheckRegistration, KVEntry, KVPair, SessionCreateRequest, SessionCreateResponse},
};

const TOKEN_HEADER: &str = "X-Consul-Token";

/// Operations of a session-based distributed lock provider
#[async_trait]
pub trait LockClient: Send + Sync {
    /// Create a session bound to the given check, returning its id
    async fn create_session(&self, service_name: &str, check_id: &str) -> Result<String>;

    /// Try to lock `key` for `session_id`, storing `value` on success.
    /// Fails with [`ConsulError::SessionNotFound`] when the session is gone.
    async fn acquire_kv(&self, key: &str, value: &[u8], session_id: &str) -> Result<bool>;

    /// Release `key` if held by `session_id`, storing `value`
    async fn release_kv(&self, key: &str, value: &[u8], session_id: &str) -> Result<bool>;

    /// Read `key`, `None` when it does not exist
    async fn get_kv(&self, key: &str) -> Result<Option<KVPair>>;

    /// Register an HTTP check against `url`, returning the assigned check id
    async fn register_check(
        &self,
        service_name: &str,
        url: &str,
        timeout: &str,
        interval: &str,
    ) -> Result<String>;

    async fn deregister_check(&self, check_id: &str) -> Result<()>;
}

/// Consul agent HTTP client
pub struct ConsulClient {
    client: Client,
    config: ConsulClientConfig,
    current_server_index: RwLock<usize>,
}

impl ConsulClient {
    pub fn new(config: ConsulClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            config,
            current_server_index: RwLock::new(0),
        })
    }

    fn current_server(&self) -> Option<String> {
        let index = *self.current_server_index.read();
        self.config.server_addrs.get(index).cloned()
    }

    fn switch_to_next_server(&self) {
        let mut index = self.current_server_index.write();
        *index = (*index + 1) % self.config.server_addrs.len().max(1);
        debug!("Switched to consul agent index: {}", *index);
    }

    fn decorate(&self, mut builder: RequestBuilder) -> RequestBuilder {
        if !self.config.region.is_empty() {
            builder = builder.query(&[("dc", self.config.region.as_str())]);
        }
        if let Some(ref token) = self.config.token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        builder
    }

    /// Send a request built against the current agent, moving on to the next
    /// agent when the connection fails. Every agent is tried at most once.
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client, &str) -> RequestBuilder,
    {
        let attempts = self.config.server_addrs.len();
        let mut last_error = None;

        for _ in 0..attempts {
            let Some(base_url) = self.current_server() else {
                break;
            };
            let request = self.decorate(build(&self.client, &base_url));
            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() || e.is_timeout() => {
                    warn!("Consul agent {} unreachable: {}", base_url, e);
                    self.switch_to_next_server();
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        match last_error {
            Some(e) if attempts == 1 => Err(e.into()),
            _ => Err(ConsulError::AllServersFailed),
        }
    }

    async fn ensure_success(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ConsulError::RequestFailed {
            status: status.as_u16(),
            body,
        })
    }

    async fn put_kv_with_session(
        &self,
        key: &str,
        value: &[u8],
        op: &'static str,
        session_id: &str,
    ) -> Result<bool> {
        let response = self
            .send(|client, base| {
                client
                    .put(format!("{}/v1/kv/{}", base, key))
                    .query(&[(op, session_id)])
                    .body(value.to_vec())
            })
            .await?;

        match Self::ensure_success(response).await {
            Ok(response) => Ok(response.json::<bool>().await?),
            Err(ConsulError::RequestFailed { body, .. }) if is_session_error(&body) => {
                Err(ConsulError::SessionNotFound(session_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

/// Consul reports a destroyed session on lock operations with a 500 whose
/// body reads "invalid session" or "missing session".
fn is_session_error(body: &str) -> bool {
    let body = body.to_ascii_lowercase();
    body.contains("invalid session")
        || body.contains("missing session")
        || (body.contains("session") && body.contains("not found"))
}

#[async_trait]
impl LockClient for ConsulClient {
    async fn create_session(&self, service_name: &str, check_id: &str) -> Result<String> {
        let request =
            SessionCreateRequest::for_check(service_name, check_id, self.config.lock_delay.clone());
        let response = self
            .send(|client, base| {
                client
                    .put(format!("{}/v1/session/create", base))
                    .json(&request)
            })
            .await?;
        let created: SessionCreateResponse = Self::ensure_success(response).await?.json().await?;
        Ok(created.id)
    }

    async fn acquire_kv(&self, key: &str, value: &[u8], session_id: &str) -> Result<bool> {
        self.put_kv_with_session(key, value, "acquire", session_id)
            .await
    }

    async fn release_kv(&self, key: &str, value: &[u8], session_id: &str) -> Result<bool> {
        self.put_kv_with_session(key, value, "release", session_id)
            .await
    }

    async fn get_kv(&self, key: &str) -> Result<Option<KVPair>> {
        let response = self
            .send(|client, base| client.get(format!("{}/v1/kv/{}", base, key)))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let entries: Vec<KVEntry> = Self::ensure_success(response).await?.json().await?;
        entries.into_iter().next().map(KVEntry::decode).transpose()
    }

    async fn register_check(
        &self,
        service_name: &str,
        url: &str,
        timeout: &str,
        interval: &str,
    ) -> Result<String> {
        let registration = CheckRegistration {
            id: format!("{}:ha:{}", service_name, uuid::Uuid::new_v4().simple()),
            name: format!("{} ha health check", service_name),
            http: url.to_string(),
            interval: interval.to_string(),
            timeout: timeout.to_string(),
        };
        let response = self
            .send(|client, base| {
                client
                    .put(format!("{}/v1/agent/check/register", base))
                    .json(&registration)
            })
            .await?;
        Self::ensure_success(response).await?;
        Ok(registration.id)
    }

    async fn deregister_check(&self, check_id: &str) -> Result<()> {
        let response = self
            .send(|client, base| {
                client.put(format!("{}/v1/agent/check/deregister/{}", base, check_id))
            })
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ConsulClient {
        ConsulClient::new(ConsulClientConfig::new("dc1", &server.uri())).unwrap()
    }

    #[tokio::test]
    async fn test_create_session_binds_check() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/create"))
            .and(query_param("dc", "dc1"))
            .and(body_json(json!({
                "Name": "svc",
                "Checks": ["serfHealth", "svc:ha:1"],
                "Behavior": "release"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ID": "sess-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let sid = client_for(&server)
            .create_session("svc", "svc:ha:1")
            .await
            .unwrap();
        assert_eq!(sid, "sess-1");
    }

    #[tokio::test]
    async fn test_create_session_rejected_on_critical_check() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/create"))
            .respond_with(
                ResponseTemplate::new(500).set_body_string("Check 'svc:ha:1' is in critical state"),
            )
            .mount(&server)
            .await;

        let err = client_for(&server)
            .create_session("svc", "svc:ha:1")
            .await
            .unwrap_err();
        match err {
            ConsulError::RequestFailed { status, body } => {
                assert_eq!(status, 500);
                assert!(body.contains("critical"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_acquire_true_and_false() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/svc"))
            .and(query_param("acquire", "s1"))
            .and(body_string(r#"{"name":"svc"}"#))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/svc"))
            .and(query_param("acquire", "s2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("false"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(client.acquire_kv("svc", br#"{"name":"svc"}"#, "s1").await.unwrap());
        assert!(!client.acquire_kv("svc", br#"{"name":"svc"}"#, "s2").await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_with_invalid_session() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/svc"))
            .respond_with(
                ResponseTemplate::new(500).set_body_string("invalid session \"gone\""),
            )
            .mount(&server)
            .await;

        let err = client_for(&server)
            .acquire_kv("svc", b"{}", "gone")
            .await
            .unwrap_err();
        assert!(err.is_session_not_found());
    }

    #[tokio::test]
    async fn test_other_server_errors_are_not_session_errors() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/svc"))
            .respond_with(ResponseTemplate::new(500).set_body_string("rpc error: No cluster leader"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .acquire_kv("svc", b"{}", "s1")
            .await
            .unwrap_err();
        assert!(!err.is_session_not_found());
    }

    #[tokio::test]
    async fn test_release() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/svc"))
            .and(query_param("release", "s1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(1)
            .mount(&server)
            .await;

        assert!(client_for(&server).release_kv("svc", b"{}", "s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_kv_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/svc"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(client_for(&server).get_kv("svc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_kv_decodes_value() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/svc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "Key": "svc",
                "Value": "eyJuYW1lIjoic3ZjIiwiaXAiOiIxMC4wLjAuMiIsInBvcnQiOjgwODB9",
                "Session": "s9",
                "LockIndex": 1,
                "ModifyIndex": 42
            }])))
            .mount(&server)
            .await;

        let pair = client_for(&server).get_kv("svc").await.unwrap().unwrap();
        assert_eq!(pair.value, br#"{"name":"svc","ip":"10.0.0.2","port":8080}"#);
        assert_eq!(pair.session.as_deref(), Some("s9"));
        assert_eq!(pair.modify_index, 42);
    }

    #[tokio::test]
    async fn test_register_and_deregister_check() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/check/register"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let check_id = client
            .register_check("svc", "http://10.0.0.1:8080/v1/health", "1s", "5s")
            .await
            .unwrap();
        assert!(check_id.starts_with("svc:ha:"));

        Mock::given(method("PUT"))
            .and(path(format!("/v1/agent/check/deregister/{}", check_id)))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        client.deregister_check(&check_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_token_header_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/svc"))
            .and(header("X-Consul-Token", "secret"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let config = ConsulClientConfig::new("", &server.uri()).with_token("secret");
        let client = ConsulClient::new(config).unwrap();
        assert!(client.get_kv("svc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failover_to_next_agent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/svc"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        // Reserve a port and close it so the first agent refuses connections
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let config = ConsulClientConfig::default()
            .with_servers(vec![dead, server.uri()])
            .with_timeouts(500, 2000);
        let client = ConsulClient::new(config).unwrap();

        assert!(client.get_kv("svc").await.unwrap().is_none());
        // The healthy agent stays current for later calls
        assert_eq!(client.current_server(), Some(server.uri()));
    }

    #[test]
    fn test_is_session_error() {
        assert!(is_session_error("Invalid session \"abc\""));
        assert!(is_session_error("missing session"));
        assert!(is_session_error("Session abc not found"));
        assert!(!is_session_error("No cluster leader"));
    }
}
