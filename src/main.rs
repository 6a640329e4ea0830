//! Glucose bridge
//!
//! Serves the latest CGM glucose reading to pixel displays while keeping
//! upstream polling within a fixed minimum interval.

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cache;
mod config;
mod display;
mod error;
mod handlers;
mod models;
mod policy;
mod state;
mod trend;
mod upstream;
mod usage;
mod validation;
mod websocket;

use crate::cache::{CacheTiming, ReadingCache};
use crate::config::Settings;
use crate::policy::ColorThresholdPolicy;
use crate::state::AppState;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env
    dotenv::dotenv().ok();

    // Logging
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,glucose_bridge=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();

    // Configuration; an invalid policy aborts startup
    let settings = Settings::from_env().context("Failed to load configuration")?;
    let policy = ColorThresholdPolicy::from_settings(&settings.thresholds)
        .context("Invalid display policy")?;
    let source = upstream::build_source(&settings.upstream).context("Failed to configure upstream")?;

    let bind_address = format!("{}:{}", settings.server.host, settings.server.port);

    info!("Starting glucose bridge");
    info!("Binding server to {}", bind_address);

    let cache = ReadingCache::new(
        source,
        CacheTiming::from_settings(&settings.cache, settings.upstream.timeout_secs),
    );
    let app_state = Arc::new(AppState::new(cache, policy, settings.display.clone()));

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .wrap(tracing_actix_web::TracingLogger::default())
            .configure(handlers::configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
