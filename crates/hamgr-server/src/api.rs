//! Demo endpoints
//!
//! Enough surface to watch the failover proxy at work: plain reads, a JSON
//! write, an error, and a health check that can be switched off to force the
//! provider to drop this node's session.

use std::sync::atomic::{AtomicBool, Ordering};

use actix_web::{HttpResponse, Responder, web};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Health reported on the check path
pub struct HealthState {
    healthy: AtomicBool,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Reply {
    pub msg: String,
    pub ok: bool,
}

#[derive(Debug, Serialize)]
struct ErrorReply {
    error: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct HiRequest {
    pub xx: String,
    pub yy: i64,
}

#[derive(Debug, Deserialize)]
pub struct HealthToggle {
    pub health: bool,
}

async fn hello() -> impl Responder {
    info!("receive hello");
    HttpResponse::Ok().json(Reply {
        msg: "hello".to_string(),
        ok: true,
    })
}

async fn hi(body: web::Json<HiRequest>) -> impl Responder {
    info!("receive hi, args: {:?}", body);
    HttpResponse::Ok().json(Reply {
        msg: format!("{}:{}", body.xx, body.yy),
        ok: false,
    })
}

async fn error() -> impl Responder {
    info!("receive error");
    HttpResponse::InternalServerError().json(ErrorReply {
        error: "i am an error!",
    })
}

async fn health(state: web::Data<HealthState>) -> impl Responder {
    if state.is_healthy() {
        HttpResponse::Ok().json(Reply {
            msg: "healthy".to_string(),
            ok: true,
        })
    } else {
        HttpResponse::ServiceUnavailable().json(ErrorReply {
            error: "I'm not healthy",
        })
    }
}

async fn set_health(
    state: web::Data<HealthState>,
    body: web::Json<HealthToggle>,
) -> impl Responder {
    if body.health {
        info!("health check switched on");
    } else {
        warn!("health check switched off, this node will lose its session");
    }
    state.set_healthy(body.health);
    HttpResponse::Ok().json(Reply {
        msg: format!("health set to {}", body.health),
        ok: true,
    })
}

pub fn routes() -> actix_web::Scope {
    web::scope("/v1")
        .route("/hello", web::get().to(hello))
        .route("/hi", web::post().to(hi))
        .route("/error", web::get().to(error))
        .route("/health", web::get().to(health))
        .route("/health", web::post().to(set_health))
}
