//! Controller session: outbound dial, registration, heartbeats, and the
//! read loop, with linear-backoff reconnect. All outbound frames funnel
//! through one mutex-guarded sink so the wire sees a single writer; swapping
//! the transport on reconnect happens under that same lock.

use crate::config::ProbeConfig;
use crate::worker::{Outbound, WorkerPool};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use meridian_proto::{
    Envelope, HeartbeatPayload, Payload, ProtocolError, MSG_HEARTBEAT, MSG_PONG, MSG_REGISTER,
    MSG_TASK_RESULT, MSG_TASK_STATUS,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

pub const PROBE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("not connected")]
    NotConnected,
    #[error("registration rejected: {0}")]
    Rejected(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("gave up after {0} reconnect attempts")]
    ReconnectExhausted(u32),
    #[error("session stopped")]
    Stopped,
}

pub struct Session {
    cfg: ProbeConfig,
    probe_id: String,
    metadata: HashMap<String, String>,
    pool: WorkerPool,
    writer: Mutex<Option<WsSink>>,
    heartbeat_interval: AtomicU64,
    shutdown_rx: watch::Receiver<bool>,
}

impl Session {
    pub fn new(
        cfg: ProbeConfig,
        probe_id: String,
        metadata: HashMap<String, String>,
        pool: WorkerPool,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cfg,
            probe_id,
            metadata,
            pool,
            writer: Mutex::new(None),
            heartbeat_interval: AtomicU64::new(30),
            shutdown_rx,
        }
    }

    /// Connect, register, and serve until shutdown or reconnect exhaustion.
    pub async fn run(self: Arc<Self>, outbound_rx: mpsc::Receiver<Outbound>) {
        let stream = match self.dial_and_register().await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "initial connection failed");
                return;
            }
        };
        info!(url = %self.cfg.server.url, "connected to controller");

        tokio::spawn(self.clone().heartbeat_loop());
        tokio::spawn(self.clone().forward_outbound(outbound_rx));

        if let Err(e) = self.clone().read_loop(stream).await {
            match e {
                SessionError::Stopped => info!("session stopped"),
                other => error!(error = %other, "session ended"),
            }
        }
        self.close_writer().await;
    }

    async fn dial_and_register(&self) -> Result<WsSource, SessionError> {
        let (ws, _) = connect_async(self.cfg.server.url.as_str()).await?;
        let (sink, source) = ws.split();

        {
            let mut guard = self.writer.lock().await;
            if let Some(mut old) = guard.replace(sink) {
                let _ = old.close().await;
            }
        }

        self.register().await?;
        Ok(source)
    }

    async fn register(&self) -> Result<(), SessionError> {
        debug!("sending register");
        self.send(
            MSG_REGISTER,
            meridian_proto::RegisterPayload {
                probe_id: self.probe_id.clone(),
                name: self.cfg.probe.name.clone(),
                location: self.cfg.probe.location.clone(),
                region: self.cfg.probe.region.clone(),
                capabilities: self.cfg.capabilities.clone(),
                version: PROBE_VERSION.to_string(),
                auth_token: self.cfg.server.auth_token.clone(),
                metadata: self.metadata.clone(),
            },
        )
        .await
    }

    /// The single write path. Every outbound frame serializes through this
    /// mutex, which also guards transport replacement on reconnect.
    async fn send(&self, msg_type: &str, data: impl Serialize) -> Result<(), SessionError> {
        let envelope = Envelope::new(msg_type, data);
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(sink) => {
                sink.send(WsMessage::text(envelope.encode())).await?;
                Ok(())
            }
            None => Err(SessionError::NotConnected),
        }
    }

    async fn close_writer(&self) {
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            let interval = self.heartbeat_interval.load(Ordering::Relaxed).max(1);
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
            }

            let status = if self.pool.is_busy() { "busy" } else { "online" };
            let heartbeat = HeartbeatPayload {
                probe_id: self.probe_id.clone(),
                status: status.to_string(),
                active_tasks: self.pool.active_count(),
            };
            if let Err(e) = self.send(MSG_HEARTBEAT, heartbeat).await {
                // Transport trouble surfaces in the read loop; just note it.
                debug!(error = %e, "heartbeat not sent");
            }
        }
    }

    /// Drain worker output onto the wire, stamping our probe id.
    async fn forward_outbound(self: Arc<Self>, mut outbound_rx: mpsc::Receiver<Outbound>) {
        while let Some(frame) = outbound_rx.recv().await {
            let sent = match frame {
                Outbound::Status(mut status) => {
                    status.probe_id = self.probe_id.clone();
                    self.send(MSG_TASK_STATUS, status).await
                }
                Outbound::Result(mut result) => {
                    result.probe_id = self.probe_id.clone();
                    self.send(MSG_TASK_RESULT, result).await
                }
            };
            if let Err(e) = sent {
                warn!(error = %e, "failed to send frame to controller");
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut source: WsSource) -> Result<(), SessionError> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return Err(SessionError::Stopped),
                frame = source.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Err(e) = self.handle_frame(text.as_str()).await {
                            warn!(error = %e, "session error, reconnecting");
                            self.close_writer().await;
                            source = self.reconnect().await?;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        warn!("connection closed by controller");
                        self.close_writer().await;
                        source = self.reconnect().await?;
                    }
                    // Transport pings and pongs are handled by tungstenite.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "read error");
                        self.close_writer().await;
                        source = self.reconnect().await?;
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, raw: &str) -> Result<(), SessionError> {
        let envelope = Envelope::decode(raw)?;
        match envelope.payload()? {
            Payload::RegisterAck(ack) => {
                if ack.success {
                    info!(message = %ack.message, "registration accepted");
                    if ack.config.heartbeat_interval > 0 {
                        self.heartbeat_interval
                            .store(ack.config.heartbeat_interval, Ordering::Relaxed);
                    }
                } else {
                    return Err(SessionError::Rejected(ack.message));
                }
            }
            Payload::TaskAssign(job) => self.pool.submit(job).await,
            Payload::TaskCancel(cancel) => {
                self.pool.cancel(&cancel.execution_id, &cancel.reason).await;
            }
            Payload::Config(config) => {
                info!(heartbeat_interval = config.heartbeat_interval, "received config update");
                if config.heartbeat_interval > 0 {
                    self.heartbeat_interval
                        .store(config.heartbeat_interval, Ordering::Relaxed);
                }
            }
            Payload::Ping => {
                let _ = self.send(MSG_PONG, serde_json::json!({})).await;
            }
            Payload::HeartbeatAck(_) | Payload::Pong => {}
            Payload::Unknown(msg_type) => {
                warn!(msg_type = %msg_type, "unknown message type, dropping");
            }
            other => debug!(payload = ?other, "ignoring message"),
        }
        Ok(())
    }

    /// Linear retry until a dial+register succeeds. `max_reconnect_attempts`
    /// of zero retries forever.
    async fn reconnect(&self) -> Result<WsSource, SessionError> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let max_attempts = self.cfg.server.max_reconnect_attempts;
        let delay = Duration::from_secs(self.cfg.server.reconnect_interval.max(1));

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if max_attempts > 0 && attempts > max_attempts {
                error!("max reconnect attempts reached");
                return Err(SessionError::ReconnectExhausted(max_attempts));
            }

            info!(attempt = attempts, "reconnecting");
            tokio::select! {
                _ = shutdown_rx.changed() => return Err(SessionError::Stopped),
                _ = tokio::time::sleep(delay) => {}
            }

            match self.dial_and_register().await {
                Ok(source) => {
                    info!("reconnected");
                    return Ok(source);
                }
                Err(e) => warn!(error = %e, "reconnect failed"),
            }
        }
    }
}
