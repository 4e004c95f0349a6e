//! Measurement executors. Each takes `(target, parameters)` and returns the
//! normalized result for its test type as a JSON value; cancellation and
//! timeouts are enforced by the worker that drives the future, and spawned
//! subprocesses die with it (`kill_on_drop`).

mod bird;
mod http;
mod icmp;
mod tcp;
mod traceroute;

use meridian_proto::{
    TASK_BIRD_ROUTE, TASK_HTTP_TEST, TASK_ICMP_PING, TASK_TCP_PING, TASK_TRACEROUTE,
};
use serde_json::{Map, Value};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unsupported task type: {0}")]
    Unsupported(String),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("dns resolution failed: {0}")]
    Resolve(String),
    #[error("command failed: {0}")]
    Command(String),
}

pub async fn execute(
    task_type: &str,
    target: &str,
    params: &Map<String, Value>,
) -> Result<Value, ExecutorError> {
    match task_type {
        TASK_ICMP_PING => icmp::run(target, params).await,
        TASK_TCP_PING => tcp::run(target, params).await,
        TASK_TRACEROUTE => traceroute::run(target, params).await,
        TASK_HTTP_TEST => http::run(target, params).await,
        TASK_BIRD_ROUTE => bird::run(target).await,
        other => Err(ExecutorError::Unsupported(other.to_string())),
    }
}

/// Read an integer parameter, accepting JSON numbers and numeric strings.
pub(crate) fn int_param(params: &Map<String, Value>, key: &str, default: u64) -> u64 {
    match params.get(key) {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f as u64))
            .unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
}

pub(crate) fn str_param<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

/// Drop an IPv6 zone suffix (`fe80::1%eth0`).
pub(crate) fn strip_zone(host: &str) -> &str {
    host.split('%').next().unwrap_or(host)
}

/// Resolve a hostname honoring the requested IP version. `auto` prefers
/// IPv4, falling back to IPv6. Literal addresses pass through untouched.
pub(crate) async fn resolve_host(host: &str, ip_version: &str) -> Result<IpAddr, ExecutorError> {
    let bare = strip_zone(host.trim_matches(|c| c == '[' || c == ']'));
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs: Vec<IpAddr> = tokio::net::lookup_host(format!("{bare}:0"))
        .await
        .map_err(|e| ExecutorError::Resolve(format!("{bare}: {e}")))?
        .map(|sa| sa.ip())
        .collect();

    let pick = match ip_version {
        "ipv4" => addrs.iter().find(|ip| ip.is_ipv4()),
        "ipv6" => addrs.iter().find(|ip| ip.is_ipv6()),
        _ => addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first()),
    };

    pick.copied()
        .ok_or_else(|| ExecutorError::Resolve(format!("no {ip_version} address found for {bare}")))
}

pub(crate) fn ip_version_param(params: &Map<String, Value>) -> String {
    str_param(params, "ip_version")
        .filter(|v| !v.is_empty())
        .unwrap_or("auto")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn int_param_accepts_numbers_and_strings() {
        let p = params(json!({"count": 7, "timeout": "12", "bad": "x"}));
        assert_eq!(int_param(&p, "count", 4), 7);
        assert_eq!(int_param(&p, "timeout", 5), 12);
        assert_eq!(int_param(&p, "bad", 3), 3);
        assert_eq!(int_param(&p, "missing", 4), 4);
    }

    #[test]
    fn zone_suffix_is_stripped() {
        assert_eq!(strip_zone("fe80::1%eth0"), "fe80::1");
        assert_eq!(strip_zone("192.0.2.1"), "192.0.2.1");
    }

    #[tokio::test]
    async fn literal_addresses_resolve_without_dns() {
        let ip = resolve_host("192.0.2.7", "auto").await.unwrap();
        assert_eq!(ip.to_string(), "192.0.2.7");

        let ip6 = resolve_host("[2001:db8::1]", "auto").await.unwrap();
        assert!(ip6.is_ipv6());
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let err = execute("dns_query", "example.com", &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unsupported task type: dns_query");
    }
}
