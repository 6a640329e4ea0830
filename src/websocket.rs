//! WebSocket push for display clients
//!
//! Each session checks the shared cache on the configured push interval and
//! sends the display payload when the rendered frame changes: a new reading
//! or trend, or the countdown moving into the next tenth of the interval.
//! Checks that need no fetch leave the usage counters alone; due fetches go
//! through the same rate limit as HTTP polling.

use actix::{Actor, ActorContext, ActorFutureExt, AsyncContext, StreamHandler};
use actix_web_actors::ws;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::display::DisplayPayload;
use crate::models::WsMessage;
use crate::state::AppState;

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// WebSocket session actor
pub struct WsSession {
    client_id: String,
    last_heartbeat: Instant,
    state: Arc<AppState>,
    last_payload: Option<DisplayPayload>,
    /// Set while upstream is unavailable so the error is sent once
    reported_error: bool,
}

impl WsSession {
    pub fn new(client_id: String, state: Arc<AppState>) -> Self {
        Self {
            client_id,
            last_heartbeat: Instant::now(),
            state,
            last_payload: None,
            reported_error: false,
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(
                    client_id = %act.client_id,
                    "WebSocket heartbeat timeout"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn push_current(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let state = self.state.clone();

        let fut = async move {
            state
                .current_for_push(Utc::now())
                .await
                .map(|current| current.payload)
        };
        let fut = actix::fut::wrap_future::<_, Self>(fut);

        ctx.spawn(fut.map(|result, act, ctx| match result {
            Ok(payload) => {
                act.reported_error = false;

                let unchanged = act
                    .last_payload
                    .as_ref()
                    .is_some_and(|last| last.same_frame(&payload));

                if !unchanged {
                    act.last_payload = Some(payload.clone());
                    send(ctx, &WsMessage::DisplayUpdate(payload));
                }
            }
            Err(e) => {
                if !act.reported_error {
                    act.reported_error = true;
                    warn!(client_id = %act.client_id, error = %e, "No reading to push");
                    send(
                        ctx,
                        &WsMessage::Error {
                            message: e.to_string(),
                        },
                    );
                }
            }
        }));
    }

    fn start_push(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let interval = Duration::from_secs(self.state.display_settings().ws_push_interval_secs.max(1));

        self.push_current(ctx);
        ctx.run_interval(interval, |act, ctx| act.push_current(ctx));
    }
}

fn send(ctx: &mut ws::WebsocketContext<WsSession>, msg: &WsMessage) {
    if let Ok(json) = serde_json::to_string(msg) {
        ctx.text(json);
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(client_id = %self.client_id, "WebSocket connected");

        send(
            ctx,
            &WsMessage::Connected {
                client_id: self.client_id.clone(),
            },
        );

        self.start_heartbeat(ctx);
        self.start_push(ctx);
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        info!(client_id = %self.client_id, "WebSocket disconnected");

        let state = self.state.clone();
        let client_id = self.client_id.clone();

        // Actix runtime spawn, not Tokio
        actix_rt::spawn(async move {
            state.remove_client(&client_id).await;
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                debug!(client_id = %self.client_id, message = %text);

                match serde_json::from_str::<WsMessage>(&text) {
                    Ok(WsMessage::Ping) => {
                        self.last_heartbeat = Instant::now();
                        send(ctx, &WsMessage::Pong);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(client_id = %self.client_id, error = %e);
                        send(
                            ctx,
                            &WsMessage::Error {
                                message: "Invalid message format".into(),
                            },
                        );
                    }
                }
            }
            Ok(ws::Message::Close(reason)) => {
                info!(client_id = %self.client_id, reason = ?reason);
                ctx.stop();
            }
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e);
                ctx.stop();
            }
            _ => {}
        }
    }
}
