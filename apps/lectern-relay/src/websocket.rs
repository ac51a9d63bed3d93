use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use metrics::counter;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use lectern_proto::{ClientFrame, JsonObject, PongPayload, ServerFrame, StudentEvent};

use crate::config::RelayConfig;
use crate::hub::{Hub, RouteTarget};
use crate::session::{now_millis, Role, Session};
use crate::AppState;

/// WebSocket upgrade handler.
pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let max_message_bytes = state.config.max_message_bytes;
    ws.max_message_size(max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();
    run_session(sink, stream, state).await;
}

/// Drives one connection: spawns the writer pump, runs the reader inline and
/// unregisters once either side finishes. Generic over the socket halves so
/// tests can drive it with channel-backed fakes.
async fn run_session<S, R, E>(sink: S, stream: R, state: AppState)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let (session, outbox_rx) = Session::new(state.config.outbox_capacity);
    counter!("lectern_connections_total", 1);
    info!(connection = %session.connection_id(), "client connected");

    let writer = tokio::spawn(outbound_pump(
        sink,
        outbox_rx,
        Arc::clone(&session),
        state.hub.clone(),
        state.config.clone(),
    ));
    inbound_pump(stream, &session, &state).await;
    // Unregister before the socket handle goes away, then wait for the writer
    // to drain and say goodbye.
    state.hub.unregister(Arc::clone(&session)).await;
    let _ = writer.await;
    info!(
        connection = %session.connection_id(),
        client_id = session.client_id().as_deref().unwrap_or("unidentified"),
        "client disconnected"
    );
}

/// Reads frames until the client goes away, a read misses its deadline, or
/// the session's outbox is closed from the other side.
async fn inbound_pump<R, E>(mut stream: R, session: &Arc<Session>, state: &AppState)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut closed = session.closed();
    loop {
        let next = tokio::select! {
            next = timeout(state.config.pong_timeout, stream.next()) => next,
            _ = closed.changed() => {
                debug!(connection = %session.connection_id(), "outbox closed, stopping reader");
                break;
            }
        };
        let message = match next {
            Err(_) => {
                warn!(
                    connection = %session.connection_id(),
                    "no traffic within the read deadline, closing connection"
                );
                counter!("lectern_read_timeouts_total", 1);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(connection = %session.connection_id(), error = %err, "websocket read failed");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };
        session.touch();
        match message {
            Message::Text(text) => dispatch_text(&text, session, state).await,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => dispatch_text(&text, session, state).await,
                Err(_) => {
                    warn!(connection = %session.connection_id(), "discarding non-utf8 binary frame");
                }
            },
            Message::Close(_) => {
                debug!(connection = %session.connection_id(), "client sent close");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn dispatch_text(text: &str, session: &Arc<Session>, state: &AppState) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(connection = %session.connection_id(), error = %err, "discarding unparseable frame");
            counter!("lectern_frames_discarded_total", 1);
            return;
        }
    };
    dispatch_frame(frame, session, state).await;
}

async fn dispatch_frame(frame: ClientFrame, session: &Arc<Session>, state: &AppState) {
    match frame {
        ClientFrame::IdentifyStudent { data } => {
            if !session.assign_student(data.client_id, data.email) {
                warn!(
                    connection = %session.connection_id(),
                    "session already identified, ignoring identify_student"
                );
                return;
            }
            state.hub.register(Arc::clone(session)).await;
        }
        ClientFrame::IdentifyTeacher => {
            if !session.assign_teacher() {
                warn!(
                    connection = %session.connection_id(),
                    "session already identified, ignoring identify_teacher"
                );
                return;
            }
            state.hub.register(Arc::clone(session)).await;
        }
        ClientFrame::TabsUpdate { data } => {
            if !require_student(session, "tabs_update") {
                return;
            }
            // Retain the full tab map so a late-joining teacher can be caught
            // up without waiting for the next update.
            if let Some(Value::Object(tabs)) = data.get("tabs") {
                session.set_tabs(tabs.clone());
            }
            relay_student_event(session, state, data, |event| ServerFrame::StudentTabsUpdate {
                data: event,
            })
            .await;
        }
        ClientFrame::TabCreated { data } => {
            if !require_student(session, "tab_created") {
                return;
            }
            relay_student_event(session, state, data, |event| ServerFrame::StudentTabCreated {
                data: event,
            })
            .await;
        }
        ClientFrame::TabUpdated { data } => {
            if !require_student(session, "tab_updated") {
                return;
            }
            relay_student_event(session, state, data, |event| ServerFrame::StudentTabUpdated {
                data: event,
            })
            .await;
        }
        ClientFrame::TabRemoved { data } => {
            if !require_student(session, "tab_removed") {
                return;
            }
            relay_student_event(session, state, data, |event| ServerFrame::StudentTabRemoved {
                data: event,
            })
            .await;
        }
        ClientFrame::CaptureFrame { data } => {
            if !require_student(session, "capture_frame") {
                return;
            }
            let Some(client_id) = session.client_id() else {
                return;
            };
            state.capture.forward(client_id, data);
        }
        ClientFrame::CaptureError { data } => {
            if !require_student(session, "capture_error") {
                return;
            }
            relay_student_event(session, state, data, |event| {
                ServerFrame::StudentCaptureError { data: event }
            })
            .await;
        }
        ClientFrame::CaptureSkipped { data } => {
            if !require_student(session, "capture_skipped") {
                return;
            }
            relay_student_event(session, state, data, |event| {
                ServerFrame::StudentCaptureSkipped { data: event }
            })
            .await;
        }
        ClientFrame::KeepalivePing => {
            let pong = ServerFrame::Pong {
                data: PongPayload {
                    timestamp: now_millis() as i64,
                },
            };
            if let Ok(json) = serde_json::to_string(&pong) {
                // A dropped pong is not worth logging; the client pings again.
                let _ = session.enqueue(json);
            }
        }
        ClientFrame::Command { data } => {
            if session.role() != Role::Teacher {
                warn!(
                    connection = %session.connection_id(),
                    "non-teacher session sent a command, discarding"
                );
                return;
            }
            state
                .hub
                .route_command(
                    Arc::clone(session),
                    data.target_client_id,
                    data.command,
                    data.data,
                )
                .await;
        }
    }
}

fn require_student(session: &Session, envelope: &'static str) -> bool {
    if session.role() == Role::Student {
        return true;
    }
    warn!(
        connection = %session.connection_id(),
        envelope,
        "frame requires a student session, discarding"
    );
    false
}

/// Wraps a student frame under its `student_<type>` name and queues it for
/// ordered delivery to the teacher.
async fn relay_student_event(
    session: &Arc<Session>,
    state: &AppState,
    data: JsonObject,
    wrap: fn(StudentEvent) -> ServerFrame,
) {
    let Some(client_id) = session.client_id() else {
        return;
    };
    let frame = wrap(StudentEvent {
        client_id,
        payload: Value::Object(data),
    });
    match serde_json::to_string(&frame) {
        Ok(json) => state.hub.route_control(RouteTarget::Teacher, json).await,
        Err(err) => warn!(error = %err, "failed to serialize student event"),
    }
}

/// Writes queued frames and keepalive pings. Sole owner of the socket's write
/// half; exits when the outbox closes or a write goes bad.
async fn outbound_pump<S>(
    mut sink: S,
    mut outbox: mpsc::Receiver<String>,
    session: Arc<Session>,
    hub: Hub,
    config: RelayConfig,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut keepalive = interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            queued = outbox.recv() => match queued {
                Some(first) => {
                    // Coalesce whatever else is already queued into one write.
                    let mut batch = first;
                    while let Ok(next) = outbox.try_recv() {
                        batch.push('\n');
                        batch.push_str(&next);
                    }
                    if !write_frame(&mut sink, Message::Text(batch), &config, &session).await {
                        break;
                    }
                }
                None => {
                    // Outbox closed after draining: say goodbye and stop.
                    let _ = write_frame(&mut sink, Message::Close(None), &config, &session).await;
                    break;
                }
            },
            _ = keepalive.tick() => {
                if !write_frame(&mut sink, Message::Ping(Vec::new()), &config, &session).await {
                    break;
                }
            }
        }
    }
    // Reached on write failure or a drained, closed outbox; either way this
    // session is done.
    hub.unregister(session).await;
}

async fn write_frame<S>(
    sink: &mut S,
    message: Message,
    config: &RelayConfig,
    session: &Session,
) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match timeout(config.write_timeout, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            debug!(connection = %session.connection_id(), error = %err, "websocket write failed");
            false
        }
        Err(_) => {
            warn!(
                connection = %session.connection_id(),
                "write missed its deadline, closing connection"
            );
            counter!("lectern_write_timeouts_total", 1);
            false
        }
    }
}
