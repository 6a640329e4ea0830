//! HTTP request handlers
//!
//! Display devices poll `/glucose`; `/ws` pushes the same payload to
//! clients that prefer a socket.

use actix_web::{web, HttpRequest, HttpResponse, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::display::progress_percent;
use crate::error::AppError;
use crate::models::{GlucoseResponse, HealthCheck, StatusResponse};
use crate::state::AppState;
use crate::websocket::WsSession;

/// Configure all application routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .service(
            web::scope("/glucose")
                .route("", web::get().to(get_display_payload))
                .route("/raw", web::get().to(get_raw_reading))
                .route("/status", web::get().to(get_status))
                .route("/statistics", web::get().to(get_statistics)),
        )
        .route("/ws", web::get().to(websocket_handler));
}

/// Health check endpoint
///
/// GET /health
pub async fn health_check(state: web::Data<Arc<AppState>>) -> Result<HttpResponse, AppError> {
    let snapshot = state.cache().snapshot().await;

    let health = HealthCheck {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        uptime_seconds: state.uptime_seconds(),
        source: state.cache().source_name().to_string(),
        last_fetch: snapshot.last_fetch_time,
        connected_clients: state.client_count().await,
    };

    Ok(HttpResponse::Ok().json(health))
}

/// AWTRIX3 custom app payload
///
/// GET /glucose
pub async fn get_display_payload(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
) -> Result<HttpResponse, AppError> {
    let correlation_id = extract_correlation_id(&req);
    let current = state.current(Utc::now()).await?;

    info!(
        correlation_id = %correlation_id,
        value = current.lookup.reading.value,
        trend = %current.trend.category,
        fresh = current.lookup.is_fresh,
        "Serving display payload"
    );

    Ok(HttpResponse::Ok().json(current.payload.to_awtrix(state.display_settings())))
}

/// Raw reading for debugging and custom integrations
///
/// GET /glucose/raw
pub async fn get_raw_reading(state: web::Data<Arc<AppState>>) -> Result<HttpResponse, AppError> {
    let current = state.current(Utc::now()).await?;
    let reading = &current.lookup.reading;

    let response = GlucoseResponse {
        value: reading.value,
        mmol_l: reading.mmol_l(),
        trend: current.trend.category,
        trend_arrow: current.trend.category.arrow().to_string(),
        delta: current.trend.delta,
        previous_value: current.lookup.snapshot.previous_reading.as_ref().map(|r| r.value),
        timestamp: reading.timestamp,
        fresh: current.lookup.is_fresh,
        fetched_at: current.lookup.snapshot.last_fetch_time,
    };

    Ok(HttpResponse::Ok().json(response))
}

/// Rate-limit status; never contacts upstream
///
/// GET /glucose/status
pub async fn get_status(state: web::Data<Arc<AppState>>) -> Result<HttpResponse, AppError> {
    let now = Utc::now();
    let snapshot = state.cache().snapshot().await;
    let seconds_until_next_refresh = snapshot.seconds_until_next_fetch(now);

    debug!(seconds_until_next_refresh, "Serving cache status");

    Ok(HttpResponse::Ok().json(StatusResponse {
        seconds_until_next_refresh,
        refresh_progress_percent: progress_percent(snapshot.progress(now)),
        can_refresh_now: seconds_until_next_refresh == 0,
        next_refresh_at: snapshot.next_fetch_at(),
        last_fetch_at: snapshot.last_fetch_time,
        statistics: state.cache().statistics(now).await,
    }))
}

/// Usage statistics
///
/// GET /glucose/statistics
pub async fn get_statistics(state: web::Data<Arc<AppState>>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(state.cache().statistics(Utc::now()).await))
}

/// WebSocket upgrade handler
///
/// GET /ws
pub async fn websocket_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<Arc<AppState>>,
) -> Result<HttpResponse, actix_web::Error> {
    let client_id = Uuid::new_v4().to_string();

    info!(client_id = %client_id, "WebSocket connection request");

    state.add_client(client_id.clone()).await;

    let ws_session = WsSession::new(client_id, state.get_ref().clone());

    actix_web_actors::ws::start(ws_session, &req, stream)
}

/// Extract or generate correlation ID from request headers
fn extract_correlation_id(req: &HttpRequest) -> String {
    req.headers()
        .get("X-Correlation-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
