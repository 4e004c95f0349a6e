//! Normalized result schemas, one per test type. Executors fill these and
//! the controller persists them as the `result_data` blob, so both sides
//! share the field vocabulary.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IcmpPingResult {
    pub packets_sent: u32,
    pub packets_received: u32,
    pub packet_loss_percent: f64,
    pub min_rtt_ms: f64,
    pub avg_rtt_ms: f64,
    pub max_rtt_ms: f64,
    pub stddev_rtt_ms: f64,
    pub replies: Vec<PingReply>,
    /// The address the probe actually pinged when the target was a hostname;
    /// equal to the input when it already was an IP.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolved_ip: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingReply {
    pub seq: u32,
    pub ttl: u32,
    pub time_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcpPingResult {
    pub target: String,
    pub successful_connections: u32,
    pub failed_connections: u32,
    pub avg_connect_time_ms: f64,
    pub min_connect_time_ms: f64,
    pub max_connect_time_ms: f64,
    pub attempts: Vec<TcpPingAttempt>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolved_ip: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcpPingAttempt {
    pub seq: u32,
    pub status: String,
    #[serde(default)]
    pub time_ms: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracerouteResult {
    pub hops: Vec<TracerouteHop>,
    pub target: String,
    pub total_hops: usize,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolved_ip: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracerouteHop {
    pub hop: u32,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub hostname: String,
    /// RTT samples in milliseconds; a hop may answer several times.
    pub rtts: Vec<f64>,
    pub timeout: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpTestResult {
    pub target: String,
    pub attempts: Vec<HttpAttempt>,
    pub successful_requests: u32,
    pub failed_requests: u32,
    #[serde(default)]
    pub avg_connect_time_ms: f64,
    #[serde(default)]
    pub min_connect_time_ms: f64,
    #[serde(default)]
    pub max_connect_time_ms: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolved_ip: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpAttempt {
    pub seq: u32,
    pub status: String,
    #[serde(default)]
    pub time_ms: f64,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteLookupResult {
    pub routes: Vec<RouteEntry>,
    pub total_routes: usize,
    pub success: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteEntry {
    pub network: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub protocol: String,
}
