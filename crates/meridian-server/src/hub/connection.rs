//! Per-connection plumbing: the WebSocket upgrade, a reader loop that
//! enforces the frame-size cap and read deadline, and a writer loop that
//! drains the session mailbox and keeps the transport alive with pings.

use super::handlers::ProbeConnection;
use super::{Hub, MAILBOX_CAPACITY};
use crate::db::models::ProbeStatus;
use crate::web::AppState;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Per-frame write deadline.
const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Read deadline; any inbound frame (pong included) refreshes it.
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Transport pings go out at 0.9 x the read deadline.
const PING_PERIOD: Duration = Duration::from_secs(54);
/// Frames above this are a protocol violation.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let remote_ip = client_ip(&headers, addr);
    info!(remote_ip = %remote_ip, "probe connection request");
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub.clone(), remote_ip))
}

/// Prefer proxy headers over the socket peer, which behind a reverse proxy
/// is just the proxy.
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    for header in ["x-forwarded-for", "x-real-ip"] {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or_default().trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    addr.to_string()
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, remote_ip: String) {
    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<String>(MAILBOX_CAPACITY);
    let (close_tx, close_rx) = watch::channel(false);

    tokio::spawn(writer_loop(sink, outbound_rx, close_rx));

    let mut conn = ProbeConnection {
        hub: hub.clone(),
        remote_ip,
        probe_id: None,
        session_id: hub.next_session_id(),
        outbound_tx,
        close_tx,
    };

    read_loop(&mut conn, stream).await;

    // The writer shuts down when the mailbox sender is dropped with the
    // connection. If our session is still the indexed one, the probe is now
    // offline; if it was replaced, the new session owns the state.
    if let Some(probe_id) = conn.probe_id.clone() {
        if hub.unregister_session(&probe_id, conn.session_id).await {
            if let Err(e) =
                crate::db::probes::update_probe_status(&hub.db, &probe_id, ProbeStatus::Offline)
                    .await
            {
                warn!(probe_id = %probe_id, error = %e, "failed to mark probe offline");
            }
        }
    }
    debug!("connection task finished");
}

async fn read_loop(conn: &mut ProbeConnection, mut stream: SplitStream<WebSocket>) {
    loop {
        let frame = match timeout(PONG_WAIT, stream.next()).await {
            Err(_) => {
                warn!(probe_id = ?conn.probe_id, "read deadline expired");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!(probe_id = ?conn.probe_id, error = %e, "read error");
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                if text.len() > MAX_FRAME_SIZE {
                    warn!(probe_id = ?conn.probe_id, size = text.len(), "oversized frame, closing");
                    return;
                }
                if !conn.handle_frame(text.as_str()).await {
                    return;
                }
            }
            Message::Close(_) => return,
            // Pings are answered by the websocket layer; pongs only matter
            // for the deadline, which the timeout above already refreshed.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }
}

async fn writer_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<String>,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; skip it.
    ping.tick().await;

    loop {
        tokio::select! {
            _ = close_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            frame = outbound_rx.recv() => match frame {
                Some(text) => {
                    match timeout(WRITE_WAIT, sink.send(Message::Text(text.into()))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                match timeout(WRITE_WAIT, sink.send(Message::Ping(Vec::new().into()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }

    let _ = sink.close().await;
}
