//! Task endpoints: creation with admission policy, listing, detail, cancel.

use super::error::AppError;
use super::AppState;
use crate::db::models::{ScheduleState, Task, TaskMode, TaskStatus};
use crate::db::{probes, results, tasks};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use ipnet::IpNet;
use meridian_proto::{supports_continuous, TASK_HTTP_TEST, TASK_TCP_PING, TASK_TRACEROUTE};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_PRIORITY: i64 = 5;
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub task_type: String,
    pub mode: String,
    pub target: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
    #[serde(default)]
    pub assigned_probes: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub ip_version: String,
    #[serde(default)]
    pub schedule: Option<ScheduleState>,
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(mut req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), AppError> {
    let mut ip_version = req.ip_version.clone();
    if ip_version.is_empty() {
        if let Some(v) = req.parameters.get("ip_version").and_then(Value::as_str) {
            ip_version = v.to_string();
        }
    }
    if !ip_version.is_empty() && !req.parameters.contains_key("ip_version") {
        req.parameters
            .insert("ip_version".to_string(), Value::String(ip_version.clone()));
    }

    if let Ok(blocked) = results::get_config(&state.db, "blocked_networks").await {
        let blocked = normalize_blocked_networks(&blocked);
        if !blocked.is_empty() {
            if let Ok(networks) = parse_blocked_networks(&blocked) {
                if blocked_by_policy(&req.target, &networks, &ip_version).await {
                    return Err(AppError::InvalidInput("Target is blocked".to_string()));
                }
            }
        }
    }

    if req.task_type == TASK_HTTP_TEST && req.mode != "single" {
        return Err(AppError::InvalidInput(
            "http_test only supports single mode".to_string(),
        ));
    }

    if req.task_type == TASK_TRACEROUTE {
        if req.assigned_probes.is_empty() {
            return Err(AppError::InvalidInput(
                "assigned_probes required for traceroute".to_string(),
            ));
        }
        for probe_id in req.assigned_probes.iter().filter(|p| !p.is_empty()) {
            if !state.hub.is_probe_online(probe_id).await {
                return Err(AppError::InvalidInput(format!("probe {probe_id} is offline")));
            }
            let capabilities = probes::get_probe_capabilities(&state.db, probe_id)
                .await
                .map_err(|e| {
                    AppError::InvalidInput(format!("failed to load probe capabilities: {e}"))
                })?;
            if !capabilities
                .iter()
                .any(|c| c == &req.task_type || c == meridian_proto::CAPABILITY_ALL)
            {
                return Err(AppError::InvalidInput(format!(
                    "probe {probe_id} does not support {}",
                    req.task_type
                )));
            }
        }
    }

    if req.task_type == TASK_TCP_PING {
        validate_tcp_target(&req.target)?;
        // The port lives in the target; a stray parameter would let the two
        // disagree.
        req.parameters.remove("port");
    }

    if req.mode == "continuous" && !supports_continuous(&req.task_type) {
        return Err(AppError::InvalidInput(
            "continuous mode only supports icmp_ping and tcp_ping".to_string(),
        ));
    }

    let mode = TaskMode::parse(&req.mode);
    let task = Task {
        id: 0,
        task_id: Uuid::new_v4().to_string(),
        task_type: req.task_type,
        mode,
        target: req.target,
        parameters: req.parameters,
        assigned_probes: req.assigned_probes,
        status: TaskStatus::Pending,
        schedule: req.schedule,
        priority: if req.priority == 0 {
            DEFAULT_PRIORITY
        } else {
            req.priority
        },
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        // Continuous tasks become due immediately; the scheduler spaces the
        // runs from here on.
        next_run_at: (mode == TaskMode::Continuous).then(Utc::now),
    };

    tasks::create_task(&state.db, &task).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Value>, AppError> {
    let listed = tasks::list_tasks(
        &state.db,
        query.status.as_deref().filter(|s| !s.is_empty()),
        query.limit.unwrap_or(100),
        query.offset.unwrap_or(0),
    )
    .await?;
    Ok(Json(json!({ "tasks": listed, "total": listed.len() })))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let task = tasks::get_task(&state.db, &task_id).await?;
    let executions = tasks::list_executions_by_task(&state.db, &task_id)
        .await
        .unwrap_or_default();
    let task_results = results::list_results_by_task(&state.db, &task_id, 100, 0)
        .await
        .unwrap_or_default();

    Ok(Json(json!({
        "task": task,
        "executions": executions,
        "results": task_results,
    })))
}

pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.scheduler.cancel_task(&task_id).await?;
    Ok(Json(json!({ "message": "Task cancelled" })))
}

#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    pub task_id: Option<String>,
}

pub async fn list_executions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<Value>, AppError> {
    let task_id = query
        .task_id
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::InvalidInput("task_id required".to_string()))?;
    let executions = tasks::list_executions_by_task(&state.db, &task_id).await?;
    Ok(Json(json!({ "executions": executions, "total": executions.len() })))
}

fn validate_tcp_target(target: &str) -> Result<(), AppError> {
    let target = target.trim();

    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        match rest.split_once(']') {
            Some((host, after)) => (host, after.strip_prefix(':').unwrap_or("")),
            None => ("", ""),
        }
    } else {
        match target.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, port),
            _ => ("", ""),
        }
    };

    if host.is_empty() || port.is_empty() {
        return Err(AppError::InvalidInput(
            "tcp_ping target must be host:port or [ipv6]:port".to_string(),
        ));
    }
    match port.parse::<u16>() {
        Ok(p) if p >= 1 => Ok(()),
        _ => Err(AppError::InvalidInput("invalid tcp port".to_string())),
    }
}

pub fn normalize_blocked_networks(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn parse_blocked_networks(blocked: &str) -> Result<Vec<IpNet>, ipnet::AddrParseError> {
    blocked
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::parse)
        .collect()
}

/// A target is blocked when any address it names or resolves to falls in a
/// blocked network. Resolution failures do not block: the probe will fail
/// the task on its own terms.
async fn blocked_by_policy(target: &str, blocked: &[IpNet], ip_version: &str) -> bool {
    let host = extract_target_host(target);
    if host.is_empty() {
        return false;
    }

    let bare = host.split('%').next().unwrap_or(&host);
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return ip_in_networks(ip, blocked);
    }

    let Ok(Ok(addrs)) = tokio::time::timeout(
        RESOLVE_TIMEOUT,
        tokio::net::lookup_host(format!("{bare}:0")),
    )
    .await
    else {
        return false;
    };

    addrs
        .map(|sa| sa.ip())
        .filter(|ip| match ip_version {
            "ipv4" => ip.is_ipv4(),
            "ipv6" => ip.is_ipv6(),
            _ => true,
        })
        .any(|ip| ip_in_networks(ip, blocked))
}

fn ip_in_networks(ip: IpAddr, networks: &[IpNet]) -> bool {
    networks.iter().any(|net| net.contains(&ip))
}

/// Dig the host out of whatever shape the target takes: URL, host:port,
/// bracketed IPv6, CIDR, or a bare host.
fn extract_target_host(target: &str) -> String {
    let target = target.trim();
    if target.is_empty() {
        return String::new();
    }

    if target.contains("://") {
        if let Ok(url) = reqwest::Url::parse(target) {
            if let Some(host) = url.host_str() {
                return host.trim_matches(|c| c == '[' || c == ']').to_string();
            }
        }
    }

    if target.contains('/') {
        if let Ok(url) = reqwest::Url::parse(&format!("http://{target}")) {
            if let Some(host) = url.host_str() {
                return host.trim_matches(|c| c == '[' || c == ']').to_string();
            }
        }
    }

    if let Some(rest) = target.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host.to_string();
        }
    }

    if let Some((host, port)) = target.rsplit_once(':') {
        if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() {
            return host.to_string();
        }
    }

    target.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_target_validation() {
        assert!(validate_tcp_target("example.com:443").is_ok());
        assert!(validate_tcp_target("[2001:db8::1]:22").is_ok());

        assert!(validate_tcp_target("example.com").is_err());
        assert!(validate_tcp_target("2001:db8::1").is_err());
        assert!(validate_tcp_target("example.com:abc").is_err());
        assert!(validate_tcp_target("example.com:0").is_err());
        assert!(validate_tcp_target(":443").is_err());
    }

    #[test]
    fn host_extraction_covers_every_target_shape() {
        assert_eq!(extract_target_host("https://example.com/path"), "example.com");
        assert_eq!(extract_target_host("http://example.com:8080/x"), "example.com");
        assert_eq!(extract_target_host("example.com:443"), "example.com");
        assert_eq!(extract_target_host("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(extract_target_host("2001:db8::1"), "2001:db8::1");
        assert_eq!(extract_target_host("10.0.0.0/24"), "10.0.0.0");
        assert_eq!(extract_target_host("example.com"), "example.com");
        assert_eq!(extract_target_host("  "), "");
    }

    #[test]
    fn blocked_networks_normalization_and_parsing() {
        let raw = " 10.0.0.0/8 \n\n 192.168.0.0/16\n";
        let normalized = normalize_blocked_networks(raw);
        assert_eq!(normalized, "10.0.0.0/8\n192.168.0.0/16");

        let networks = parse_blocked_networks(&normalized).unwrap();
        assert_eq!(networks.len(), 2);
        assert!(parse_blocked_networks("not-a-cidr").is_err());
    }

    #[tokio::test]
    async fn literal_targets_are_checked_without_dns() {
        let networks = parse_blocked_networks("10.0.0.0/8").unwrap();
        assert!(blocked_by_policy("10.1.2.3", &networks, "auto").await);
        assert!(blocked_by_policy("10.1.2.3:443", &networks, "auto").await);
        assert!(!blocked_by_policy("192.0.2.9", &networks, "auto").await);
    }

    #[tokio::test]
    async fn widening_the_blocklist_blocks_strictly_more() {
        let narrow = parse_blocked_networks("10.0.0.0/16").unwrap();
        let wide = parse_blocked_networks("10.0.0.0/16\n10.1.0.0/16").unwrap();

        for target in ["10.0.5.5", "10.1.5.5", "172.16.0.1"] {
            if blocked_by_policy(target, &narrow, "auto").await {
                assert!(blocked_by_policy(target, &wide, "auto").await);
            }
        }
        assert!(!blocked_by_policy("10.1.5.5", &narrow, "auto").await);
        assert!(blocked_by_policy("10.1.5.5", &wide, "auto").await);
    }
}
