//! Failover proxy middleware
//!
//! Requests reaching a follower are replayed against the current leader and
//! the leader's answer is relayed back. The leader itself, and every request
//! to the health check path, is served by the wrapped service.

use std::future::{Future, Ready, ready};
use std::pin::Pin;
use std::sync::Arc;

use actix_web::{
    Error, HttpMessage, HttpResponse, ResponseError,
    body::EitherBody,
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    http::{
        StatusCode, Uri,
        header::{CONTENT_TYPE, HeaderName, HeaderValue},
    },
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::{debug, error, warn};

use crate::{
    error::FailoverError,
    manager::{HaManager, HighAvailability, Shared},
    model::ServiceIdentity,
};

/// Middleware factory returned by [`HaManager::handler`](crate::HighAvailability::handler)
pub struct FailoverProxy {
    manager: HaManager,
}

impl FailoverProxy {
    pub fn new(manager: HaManager) -> Self {
        Self { manager }
    }
}

impl<S, B> Transform<S, ServiceRequest> for FailoverProxy
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = FailoverProxyMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(FailoverProxyMiddleware {
            service,
            manager: self.manager.clone(),
        }))
    }
}

pub struct FailoverProxyMiddleware<S> {
    service: S,
    manager: HaManager,
}

impl<S, B> Service<ServiceRequest> for FailoverProxyMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(
        &self,
        ctx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        // The provider probes every instance, so health checks never leave the node.
        let serve_locally =
            req.path() == self.manager.health_path() || self.manager.is_leader();
        if serve_locally {
            let fut = self.service.call(req);
            return Box::pin(async move { fut.await.map(|res| res.map_into_left_body()) });
        }

        let shared = self.manager.shared.clone();
        Box::pin(async move {
            let mut req = req;
            let response = match forward_to_leader(&shared, &mut req).await {
                Ok(response) => response,
                Err(e) => e.error_response(),
            };
            Ok(req.into_response(response).map_into_right_body())
        })
    }
}

async fn forward_to_leader(
    shared: &Arc<Shared>,
    req: &mut ServiceRequest,
) -> Result<HttpResponse, FailoverError> {
    let Some(leader) = shared.state.leader() else {
        error!("leader is unknown, cannot forward {} {}", req.method(), req.path());
        return Err(FailoverError::NoLeader);
    };

    let url = leader_url(&leader, req.uri());
    let body = read_body(req).await;
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes()).map_err(|e| {
        error!("unsupported method {}: {}", req.method(), e);
        FailoverError::LeaderUnreachable
    })?;

    let mut outbound = shared.http.request(method, &url).body(body);
    for name in &shared.headers.request {
        if let Some(value) = req.headers().get(name.as_str())
            && !value.is_empty()
        {
            outbound = outbound.header(name.as_str(), value.as_bytes());
        }
    }

    debug!("forwarding {} {} to leader {}", req.method(), req.path(), leader);
    let response = outbound.send().await.map_err(|e| {
        error!("fail to get response from leader {}, err: {}", leader, e);
        FailoverError::LeaderUnreachable
    })?;

    let status = response.status().as_u16();
    let relayed: Vec<(String, Vec<u8>)> = shared
        .headers
        .response
        .iter()
        .filter_map(|name| {
            response
                .headers()
                .get(name.as_str())
                .filter(|value| !value.is_empty())
                .map(|value| (name.clone(), value.as_bytes().to_vec()))
        })
        .collect();

    let body = response.bytes().await.map_err(|e| {
        error!("fail to read response body from leader {}, err: {}", leader, e);
        FailoverError::LeaderBodyUnreadable
    })?;

    let mut builder =
        HttpResponse::build(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    let mut has_content_type = false;
    for (name, value) in relayed {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(&value),
        ) {
            (Ok(name), Ok(value)) => {
                has_content_type |= name == CONTENT_TYPE;
                builder.append_header((name, value));
            }
            _ => warn!("dropping invalid response header [{}] from leader", name),
        }
    }
    if !has_content_type {
        builder.insert_header((CONTENT_TYPE, "application/json"));
    }

    Ok(builder.body(body))
}

/// Same path and query, on the leader's address
fn leader_url(leader: &ServiceIdentity, uri: &Uri) -> String {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    format!("http://{}{}", leader.authority(), path_and_query)
}

/// Drain the inbound body. A broken body is forwarded as empty.
async fn read_body(req: &mut ServiceRequest) -> Bytes {
    let mut payload = req.take_payload();
    let mut body = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        match chunk {
            Ok(chunk) => body.extend_from_slice(&chunk),
            Err(e) => {
                warn!("fail to read request body, forwarding an empty one: {}", e);
                return Bytes::new();
            }
        }
    }
    body.freeze()
}
