//! The probe registry: an in-memory index of live sessions keyed by probe
//! id. Each session exposes a bounded mailbox; routing a frame to a probe is
//! a non-blocking enqueue so a slow connection can never stall the
//! scheduler.

pub mod connection;
pub mod handlers;

use crate::db::DbPool;
use crate::geoip::GeoIpService;
use meridian_proto::Envelope;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, warn};

/// Outbound frames queued per session before the writer applies
/// backpressure as a send failure.
pub const MAILBOX_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("probe not connected")]
    ProbeNotConnected,
    #[error("send message timeout")]
    SendTimeout,
}

/// Handle to one live probe connection. `session_id` disambiguates a session
/// from the one that replaced it, so stale teardown can't evict a successor.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: u64,
    outbound_tx: mpsc::Sender<String>,
    close_tx: watch::Sender<bool>,
}

impl SessionHandle {
    pub fn new(
        session_id: u64,
        outbound_tx: mpsc::Sender<String>,
        close_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            session_id,
            outbound_tx,
            close_tx,
        }
    }

    fn try_enqueue(&self, frame: String) -> Result<(), HubError> {
        self.outbound_tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => HubError::SendTimeout,
            TrySendError::Closed(_) => HubError::ProbeNotConnected,
        })
    }

    /// Ask the session's writer to shut the transport down.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }
}

pub struct Hub {
    pub db: DbPool,
    pub geoip: Arc<GeoIpService>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    static_shared_secret: String,
    session_counter: AtomicU64,
}

impl Hub {
    pub fn new(db: DbPool, geoip: Arc<GeoIpService>, shared_secret: String) -> Self {
        Self {
            db,
            geoip,
            sessions: RwLock::new(HashMap::new()),
            static_shared_secret: shared_secret,
            session_counter: AtomicU64::new(1),
        }
    }

    pub fn next_session_id(&self) -> u64 {
        self.session_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// The shared secret probes must present. The persisted config value
    /// wins so operators can rotate it at runtime; the static config is the
    /// bootstrap fallback.
    pub async fn shared_secret(&self) -> String {
        match crate::db::results::get_config(&self.db, "shared_secret").await {
            Ok(secret) if !secret.is_empty() => secret,
            _ => self.static_shared_secret.clone(),
        }
    }

    /// Index a session, returning the handle it displaced, if any.
    pub async fn register_session(
        &self,
        probe_id: &str,
        handle: SessionHandle,
    ) -> Option<SessionHandle> {
        let old = self
            .sessions
            .write()
            .await
            .insert(probe_id.to_string(), handle);
        if old.is_some() {
            info!(probe_id, "replaced existing probe session");
        } else {
            info!(probe_id, "registered probe session");
        }
        old
    }

    /// Drop a session from the index, but only if it is still the one the
    /// caller owned. Returns whether anything was removed.
    pub async fn unregister_session(&self, probe_id: &str, session_id: u64) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(probe_id)
            .is_some_and(|h| h.session_id == session_id)
        {
            sessions.remove(probe_id);
            info!(probe_id, "unregistered probe session");
            true
        } else {
            false
        }
    }

    /// Wrap `data` in an envelope and enqueue it to a probe's mailbox
    /// without blocking. The caller decides what a failure means for the
    /// owning execution.
    pub async fn send_to_probe(
        &self,
        probe_id: &str,
        msg_type: &str,
        data: impl Serialize,
    ) -> Result<(), HubError> {
        let handle = {
            let sessions = self.sessions.read().await;
            sessions.get(probe_id).cloned()
        };
        let Some(handle) = handle else {
            return Err(HubError::ProbeNotConnected);
        };

        handle.try_enqueue(Envelope::new(msg_type, data).encode())
    }

    pub async fn is_probe_online(&self, probe_id: &str) -> bool {
        self.sessions.read().await.contains_key(probe_id)
    }

    /// Fan a frame out to every live session, best effort.
    pub async fn broadcast(&self, msg_type: &str, data: impl Serialize) {
        let frame = Envelope::new(msg_type, data).encode();
        let sessions = self.sessions.read().await;
        for (probe_id, handle) in sessions.iter() {
            if let Err(e) = handle.try_enqueue(frame.clone()) {
                warn!(probe_id = %probe_id, error = %e, "broadcast frame dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use serde_json::json;

    fn test_hub() -> (Arc<Hub>, tempfile::TempDir) {
        let (pool, dir) = test_pool();
        let hub = Arc::new(Hub::new(
            pool,
            Arc::new(GeoIpService::new()),
            "static-secret".to_string(),
        ));
        (hub, dir)
    }

    fn handle_with_capacity(
        session_id: u64,
        capacity: usize,
    ) -> (SessionHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (close_tx, _) = watch::channel(false);
        (SessionHandle::new(session_id, tx, close_tx), rx)
    }

    #[tokio::test]
    async fn send_requires_a_session() {
        let (hub, _dir) = test_hub();
        assert_eq!(
            hub.send_to_probe("p-1", "task_assign", json!({})).await,
            Err(HubError::ProbeNotConnected)
        );
    }

    #[tokio::test]
    async fn routed_frames_arrive_as_envelopes() {
        let (hub, _dir) = test_hub();
        let (handle, mut rx) = handle_with_capacity(1, 8);
        hub.register_session("p-1", handle).await;

        hub.send_to_probe("p-1", "task_cancel", json!({"execution_id": "e-9"}))
            .await
            .unwrap();

        let frame = rx.recv().await.unwrap();
        let envelope = meridian_proto::Envelope::decode(&frame).unwrap();
        assert_eq!(envelope.msg_type, "task_cancel");
        assert_eq!(envelope.data["execution_id"], "e-9");
    }

    #[tokio::test]
    async fn full_mailbox_is_a_send_timeout() {
        let (hub, _dir) = test_hub();
        let (handle, _rx) = handle_with_capacity(1, 1);
        hub.register_session("p-1", handle).await;

        hub.send_to_probe("p-1", "config", json!({})).await.unwrap();
        assert_eq!(
            hub.send_to_probe("p-1", "config", json!({})).await,
            Err(HubError::SendTimeout)
        );
    }

    #[tokio::test]
    async fn stale_teardown_cannot_evict_a_replacement() {
        let (hub, _dir) = test_hub();
        let (old, _rx_old) = handle_with_capacity(1, 1);
        let (new, _rx_new) = handle_with_capacity(2, 1);

        hub.register_session("p-1", old).await;
        let displaced = hub.register_session("p-1", new).await;
        assert_eq!(displaced.unwrap().session_id, 1);

        // The displaced session's teardown runs late; the live session must
        // survive it.
        assert!(!hub.unregister_session("p-1", 1).await);
        assert!(hub.is_probe_online("p-1").await);
        assert!(hub.unregister_session("p-1", 2).await);
        assert!(!hub.is_probe_online("p-1").await);
    }

    #[tokio::test]
    async fn shared_secret_prefers_the_persisted_value() {
        let (hub, _dir) = test_hub();
        assert_eq!(hub.shared_secret().await, "static-secret");

        crate::db::results::set_config(&hub.db, "shared_secret", "rotated")
            .await
            .unwrap();
        assert_eq!(hub.shared_secret().await, "rotated");
    }
}
