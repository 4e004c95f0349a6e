//! Message handling for one probe session: registration and auth, liveness,
//! and the result ingestion path that advances task state.

use super::Hub;
use crate::db::models::{ExecutionStatus, Probe, ProbeStatus, TaskMode, TaskStatus};
use crate::db::{probes, results, tasks, DbError};
use crate::geoip::is_private_or_loopback;
use chrono::Utc;
use meridian_proto::{
    Envelope, HeartbeatAckPayload, HeartbeatPayload, Payload, RegisterAckPayload, RegisterPayload,
    SessionConfig, TaskResultPayload, TaskStatusPayload, MSG_HEARTBEAT_ACK, MSG_PONG,
    MSG_REGISTER_ACK,
};
use serde::Serialize;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub(super) struct ProbeConnection {
    pub hub: Arc<Hub>,
    pub remote_ip: String,
    pub probe_id: Option<String>,
    pub session_id: u64,
    pub outbound_tx: mpsc::Sender<String>,
    pub close_tx: watch::Sender<bool>,
}

impl ProbeConnection {
    async fn send(&self, msg_type: &str, data: impl Serialize) {
        let frame = Envelope::new(msg_type, data).encode();
        let sent = tokio::time::timeout(Duration::from_secs(10), self.outbound_tx.send(frame));
        if sent.await.map_or(true, |r| r.is_err()) {
            warn!(probe_id = ?self.probe_id, msg_type, "failed to queue frame");
        }
    }

    /// Dispatch one inbound frame. Returns false when the session must end:
    /// an undecodable envelope or a failed registration.
    pub(super) async fn handle_frame(&mut self, raw: &str) -> bool {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(probe_id = ?self.probe_id, error = %e, "protocol error, closing session");
                return false;
            }
        };

        let payload = match envelope.payload() {
            Ok(payload) => payload,
            Err(e) => {
                // A known type with a bad body: log and move on.
                warn!(probe_id = ?self.probe_id, error = %e, "dropping malformed payload");
                return true;
            }
        };

        match payload {
            Payload::Register(register) => self.handle_register(register).await,
            Payload::Heartbeat(heartbeat) => {
                self.handle_heartbeat(heartbeat).await;
                true
            }
            Payload::TaskResult(result) => {
                if let Err(e) = ingest_task_result(&self.hub, &result).await {
                    error!(execution_id = %result.execution_id, error = %e, "failed to ingest result");
                }
                true
            }
            Payload::TaskStatus(status) => {
                self.handle_task_status(status).await;
                true
            }
            Payload::Error(err) => {
                warn!(
                    probe_id = ?self.probe_id,
                    code = %err.code,
                    message = %err.message,
                    details = %err.details,
                    "error reported by probe"
                );
                true
            }
            Payload::Ping => {
                self.send(MSG_PONG, serde_json::json!({"timestamp": Utc::now().timestamp()}))
                    .await;
                true
            }
            Payload::Unknown(msg_type) => {
                warn!(probe_id = ?self.probe_id, msg_type = %msg_type, "unknown message type");
                true
            }
            other => {
                debug!(probe_id = ?self.probe_id, payload = ?other, "ignoring message");
                true
            }
        }
    }

    async fn handle_register(&mut self, register: RegisterPayload) -> bool {
        info!(
            probe_id = %register.probe_id,
            name = %register.name,
            remote_ip = %self.remote_ip,
            "probe registering"
        );

        let secret = self.hub.shared_secret().await;
        if register.auth_token != secret {
            warn!(probe_id = %register.probe_id, "invalid auth token");
            self.send(
                MSG_REGISTER_ACK,
                RegisterAckPayload {
                    success: false,
                    probe_id: register.probe_id.clone(),
                    message: "Invalid auth token".to_string(),
                    config: SessionConfig::default(),
                },
            )
            .await;
            return false;
        }

        let probe = self.build_probe_row(&register).await;
        if let Err(e) = probes::save_probe(&self.hub.db, &probe).await {
            error!(probe_id = %register.probe_id, error = %e, "failed to save probe");
            self.send(
                MSG_REGISTER_ACK,
                RegisterAckPayload {
                    success: false,
                    probe_id: register.probe_id.clone(),
                    message: format!("Failed to save probe info: {e}"),
                    config: SessionConfig::default(),
                },
            )
            .await;
            return true;
        }

        self.probe_id = Some(register.probe_id.clone());
        let handle = super::SessionHandle::new(
            self.session_id,
            self.outbound_tx.clone(),
            self.close_tx.clone(),
        );
        if let Some(old) = self
            .hub
            .register_session(&register.probe_id, handle)
            .await
        {
            old.close();
        }

        self.send(
            MSG_REGISTER_ACK,
            RegisterAckPayload {
                success: true,
                probe_id: register.probe_id.clone(),
                message: "Registration successful".to_string(),
                config: SessionConfig::default(),
            },
        )
        .await;

        info!(probe_id = %register.probe_id, "probe registered");
        true
    }

    /// Turn a register message into the persisted probe row, resolving
    /// coordinates from metadata first and the connecting address second.
    async fn build_probe_row(&self, register: &RegisterPayload) -> Probe {
        let probe_ip = strip_ip_port(&self.remote_ip).to_string();
        let mut probe = Probe {
            id: 0,
            probe_id: register.probe_id.clone(),
            name: register.name.clone(),
            location: register.location.clone(),
            region: register.region.clone(),
            latitude: register.metadata.get("latitude").and_then(|v| v.parse().ok()),
            longitude: register.metadata.get("longitude").and_then(|v| v.parse().ok()),
            ip_address: probe_ip.clone(),
            capabilities: register.capabilities.clone(),
            status: ProbeStatus::Online,
            last_heartbeat: Utc::now(),
            registered_at: Utc::now(),
            metadata: register.metadata.clone(),
        };

        if probe.latitude.is_none() || probe.longitude.is_none() {
            match self.hub.geoip.lookup(&probe_ip).await {
                Ok(location) => {
                    probe.latitude = Some(location.latitude);
                    probe.longitude = Some(location.longitude);
                    if (probe.location.is_empty() || probe.location == "Unknown")
                        && !location.city.is_empty()
                    {
                        probe.location = format!("{}, {}", location.city, location.country);
                    }
                }
                Err(e) => {
                    debug!(ip = %probe_ip, error = %e, "geoip lookup for probe failed");
                    if probe.location.is_empty() && is_local_address(&probe_ip) {
                        probe.location = "Local".to_string();
                    }
                }
            }
        }

        probe
    }

    async fn handle_heartbeat(&self, heartbeat: HeartbeatPayload) {
        if let Err(e) = probes::update_probe_heartbeat(&self.hub.db, &heartbeat.probe_id).await {
            warn!(probe_id = %heartbeat.probe_id, error = %e, "failed to update heartbeat");
            return;
        }
        let status = ProbeStatus::parse(&heartbeat.status);
        if let Err(e) = probes::update_probe_status(&self.hub.db, &heartbeat.probe_id, status).await
        {
            warn!(probe_id = %heartbeat.probe_id, error = %e, "failed to update probe status");
        }

        self.send(
            MSG_HEARTBEAT_ACK,
            HeartbeatAckPayload {
                timestamp: Utc::now().timestamp(),
                next_heartbeat: 30,
            },
        )
        .await;
    }

    async fn handle_task_status(&self, status: TaskStatusPayload) {
        let mut execution = match tasks::get_execution(&self.hub.db, &status.execution_id).await {
            Ok(execution) => execution,
            Err(e) => {
                warn!(execution_id = %status.execution_id, error = %e, "status for unknown execution");
                return;
            }
        };

        // A late progress update must not reopen a finished execution.
        if execution.status.is_terminal() {
            return;
        }

        execution.status = ExecutionStatus::parse(&status.status);
        if let Err(e) = tasks::update_execution(&self.hub.db, &execution).await {
            warn!(execution_id = %status.execution_id, error = %e, "failed to update execution");
        }
    }
}

/// Correlate a `task_result` with its execution and task, enrich it, persist
/// it, and complete the parent task when it was the last open execution.
/// Safe to run repeatedly for the same execution.
pub async fn ingest_task_result(hub: &Hub, msg: &TaskResultPayload) -> Result<(), DbError> {
    info!(execution_id = %msg.execution_id, status = %msg.status, "received task result");

    let mut execution = tasks::get_execution(&hub.db, &msg.execution_id).await?;
    execution.status = if msg.status == "success" {
        ExecutionStatus::Success
    } else {
        ExecutionStatus::Failed
    };
    execution.completed_at = Some(Utc::now());
    execution.error = if msg.error.is_empty() {
        None
    } else {
        Some(msg.error.clone())
    };
    tasks::update_execution(&hub.db, &execution).await?;

    // The task carries the canonical target and test type; the payload's
    // copy is advisory.
    let task = tasks::get_task(&hub.db, &msg.task_id).await?;

    let mut result_data = msg.result_data.clone();
    if task.task_type == meridian_proto::TASK_TRACEROUTE {
        enrich_hops(&mut result_data, hub).await;
    }

    let mut summary = extract_summary(&result_data);
    if let Some(resolved_ip) = extract_resolved_ip(&result_data) {
        if let Ok(location) = hub.geoip.lookup(&resolved_ip).await {
            if !location.isp.is_empty() {
                summary.insert("target_isp".to_string(), Value::String(location.isp));
            }
            if !location.asn.is_empty() {
                summary.insert("target_asn".to_string(), Value::String(location.asn));
            }
            if !location.as_name.is_empty() {
                summary.insert("target_as_name".to_string(), Value::String(location.as_name));
            }
        }
    }

    results::save_result(
        &hub.db,
        &crate::db::models::TestResult {
            id: 0,
            result_id: Uuid::new_v4().to_string(),
            execution_id: msg.execution_id.clone(),
            task_id: msg.task_id.clone(),
            probe_id: msg.probe_id.clone(),
            target: task.target.clone(),
            test_type: task.task_type.clone(),
            status: msg.status.clone(),
            result_data,
            summary: Value::Object(summary),
            created_at: Utc::now(),
        },
    )
    .await?;

    // Single-shot tasks complete once every execution has reached a
    // terminal state. Continuous tasks are owned by the scheduler.
    if task.mode == TaskMode::Single && !task.status.is_terminal() {
        let executions = tasks::list_executions_by_task(&hub.db, &msg.task_id).await?;
        if executions.iter().all(|e| e.status.is_terminal()) {
            tasks::update_task_status(&hub.db, &msg.task_id, TaskStatus::Completed).await?;
            info!(task_id = %msg.task_id, "task completed");
        }
    }

    Ok(())
}

/// Attach geolocation to each public hop address in a traceroute payload.
async fn enrich_hops(result_data: &mut Value, hub: &Hub) {
    let Some(hops) = result_data.get_mut("hops").and_then(Value::as_array_mut) else {
        return;
    };

    for hop in hops {
        let Some(ip) = hop.get("ip").and_then(Value::as_str) else {
            continue;
        };
        if ip.is_empty() || ip == "*" {
            continue;
        }
        if let Ok(parsed) = ip.parse::<IpAddr>() {
            if is_private_or_loopback(parsed) {
                continue;
            }
        }

        let Ok(location) = hub.geoip.lookup(ip).await else {
            continue;
        };
        hop["geo"] = serde_json::json!({
            "isp": location.isp,
            "asn": location.asn,
            "as_name": location.as_name,
            "country": location.country,
            "region": location.region,
            "city": location.city,
            "latitude": location.latitude,
            "longitude": location.longitude,
        });
    }
}

/// Pull the headline metrics out of a result payload.
fn extract_summary(result_data: &Value) -> serde_json::Map<String, Value> {
    let mut summary = serde_json::Map::new();
    let Some(data) = result_data.as_object() else {
        return summary;
    };

    if let Some(avg) = data.get("avg_rtt_ms") {
        summary.insert("avg_latency".to_string(), avg.clone());
    }
    if let Some(avg) = data.get("avg_connect_time_ms") {
        summary.insert("avg_latency".to_string(), avg.clone());
    }
    if let Some(loss) = data.get("packet_loss_percent") {
        summary.insert("packet_loss".to_string(), loss.clone());
    }

    summary
}

/// The address a result was actually measured against: `resolved_ip` when
/// present, else the TCP target with its port stripped.
fn extract_resolved_ip(result_data: &Value) -> Option<String> {
    let data = result_data.as_object()?;

    if let Some(ip) = data.get("resolved_ip").and_then(Value::as_str) {
        if !ip.is_empty() {
            return Some(ip.to_string());
        }
    }

    let target = data.get("target").and_then(Value::as_str)?;
    if target.is_empty() {
        return None;
    }
    Some(strip_ip_port(target).to_string())
}

/// Strip a trailing `:port` from an address. Bracketed IPv6 loses both the
/// brackets and the port; bare IPv6 (two or more colons) passes through.
fn strip_ip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host;
        }
    }
    if addr.matches(':').count() == 1 {
        return addr.split(':').next().unwrap_or(addr);
    }
    addr
}

fn is_local_address(ip: &str) -> bool {
    matches!(ip, "127.0.0.1" | "::1" | "localhost")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::TaskMode;
    use crate::db::tasks::{test_execution, test_task};
    use crate::db::test_pool;
    use crate::geoip::GeoIpService;
    use serde_json::json;

    fn test_hub() -> (Arc<Hub>, tempfile::TempDir) {
        let (pool, dir) = test_pool();
        let hub = Arc::new(Hub::new(
            pool,
            Arc::new(GeoIpService::new()),
            "secret".to_string(),
        ));
        (hub, dir)
    }

    #[test]
    fn port_stripping_handles_all_target_shapes() {
        assert_eq!(strip_ip_port("192.0.2.1:443"), "192.0.2.1");
        assert_eq!(strip_ip_port("example.com:80"), "example.com");
        assert_eq!(strip_ip_port("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(strip_ip_port("2001:db8::1"), "2001:db8::1");
        assert_eq!(strip_ip_port("192.0.2.1"), "192.0.2.1");
    }

    #[test]
    fn summary_picks_latency_and_loss() {
        let summary = extract_summary(&json!({
            "avg_rtt_ms": 12.5,
            "packet_loss_percent": 25.0,
            "replies": [],
        }));
        assert_eq!(summary["avg_latency"], json!(12.5));
        assert_eq!(summary["packet_loss"], json!(25.0));

        let summary = extract_summary(&json!({"avg_connect_time_ms": 3.2}));
        assert_eq!(summary["avg_latency"], json!(3.2));

        assert!(extract_summary(&json!("not an object")).is_empty());
    }

    #[test]
    fn resolved_ip_prefers_the_explicit_field() {
        assert_eq!(
            extract_resolved_ip(&json!({"resolved_ip": "198.51.100.7"})),
            Some("198.51.100.7".to_string())
        );
        assert_eq!(
            extract_resolved_ip(&json!({"target": "example.com:443"})),
            Some("example.com".to_string())
        );
        assert_eq!(extract_resolved_ip(&json!({})), None);
    }

    #[tokio::test]
    async fn ingestion_is_idempotent_and_completes_single_tasks() {
        let (hub, _dir) = test_hub();

        let task = test_task("t-1", "icmp_ping", TaskMode::Single);
        tasks::create_task(&hub.db, &task).await.unwrap();
        let mut execution = test_execution("e-1", "t-1", "p-1");
        execution.status = ExecutionStatus::Running;
        tasks::save_execution(&hub.db, &execution).await.unwrap();

        let msg = TaskResultPayload {
            execution_id: "e-1".to_string(),
            task_id: "t-1".to_string(),
            probe_id: "p-1".to_string(),
            status: "success".to_string(),
            result_data: json!({"avg_rtt_ms": 9.5, "packet_loss_percent": 0.0}),
            error: String::new(),
            duration_ms: 120,
        };

        ingest_task_result(&hub, &msg).await.unwrap();
        ingest_task_result(&hub, &msg).await.unwrap();

        let execution = tasks::get_execution(&hub.db, "e-1").await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert!(execution.completed_at.is_some());

        let rows = results::list_results_by_execution(&hub.db, "e-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].summary["avg_latency"], json!(9.5));
        assert_eq!(rows[0].target, "192.0.2.1");

        let task = tasks::get_task(&hub.db, "t-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn task_stays_running_while_other_executions_are_open() {
        let (hub, _dir) = test_hub();

        let mut task = test_task("t-2", "icmp_ping", TaskMode::Single);
        task.status = TaskStatus::Running;
        tasks::create_task(&hub.db, &task).await.unwrap();
        tasks::save_execution(&hub.db, &test_execution("e-1", "t-2", "p-1"))
            .await
            .unwrap();
        tasks::save_execution(&hub.db, &test_execution("e-2", "t-2", "p-2"))
            .await
            .unwrap();

        let msg = TaskResultPayload {
            execution_id: "e-1".to_string(),
            task_id: "t-2".to_string(),
            probe_id: "p-1".to_string(),
            status: "failed".to_string(),
            result_data: Value::Null,
            error: "timed out after 300s".to_string(),
            duration_ms: 300_000,
        };
        ingest_task_result(&hub, &msg).await.unwrap();

        let task = tasks::get_task(&hub.db, "t-2").await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);

        let execution = tasks::get_execution(&hub.db, "e-1").await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error.as_deref(), Some("timed out after 300s"));
    }

    #[tokio::test]
    async fn result_for_unknown_execution_is_an_error() {
        let (hub, _dir) = test_hub();
        let msg = TaskResultPayload {
            execution_id: "ghost".to_string(),
            task_id: "t-9".to_string(),
            status: "success".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            ingest_task_result(&hub, &msg).await,
            Err(DbError::NotFound(_))
        ));
    }
}
