//! Example service behind the HA failover proxy.
//!
//! Every instance serves the same API. Followers forward requests to the
//! leader; the leader answers them itself.

use actix_web::{App, HttpServer, web};
use anyhow::Context;
use clap::Parser;
use hamgr_core::{HaManager, HighAvailability};
use hamgr_server::{
    api::{self, HealthState},
    config::{AppConfig, Cli},
    logging::{self, LoggingConfig},
    shutdown::{self, ShutdownSignal},
};
use tracing::{error, info};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli)?;

    let logging_config = LoggingConfig::from_config(&config.log_level, config.log_dir.clone());
    let _logging_guard = logging::init_logging(&logging_config)?;
    info!("configuration loaded: {:?}", config);

    let manager = HaManager::new(&config.consul_config, &config.ha_manager_config)
        .context("fail to create HA manager")?;
    manager.register(config.service.clone());

    let health = web::Data::new(HealthState::new());
    let handler_manager = manager.clone();
    // The provider probes the health endpoint during setup, so serve first.
    let server = HttpServer::new(move || {
        App::new()
            .wrap(handler_manager.handler())
            .app_data(health.clone())
            .service(api::routes())
    })
    .disable_signals()
    .bind(("0.0.0.0", config.service.port))
    .with_context(|| format!("fail to bind port {}", config.service.port))?
    .run();
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);
    info!("listening on port {}", config.service.port);

    if let Err(e) = manager.setup().await {
        error!("fail to setup HA manager, err: {}", e);
        server_handle.stop(false).await;
        return Err(e.into());
    }
    manager.start();

    let signal = ShutdownSignal::new();
    shutdown::listen_for_os_signals(signal.clone());
    let trigger = shutdown::wait_for_release(&signal, config.release_delay()).await;
    info!("stepping down, trigger: {:?}", trigger);

    shutdown::step_down(&manager, config.shutdown_grace()).await;

    server_handle.stop(true).await;
    match server_task.await {
        Ok(Ok(())) => info!("server stopped"),
        Ok(Err(e)) => error!("server error: {}", e),
        Err(e) => error!("server task failed: {}", e),
    }

    Ok(())
}
