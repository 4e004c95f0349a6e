//! TCP connect latency. The target must name a port explicitly; each attempt
//! is a fresh dial with its own deadline.

use super::{int_param, ip_version_param, resolve_host, strip_zone, ExecutorError};
use meridian_proto::{TcpPingAttempt, TcpPingResult};
use serde_json::{Map, Value};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub async fn run(target: &str, params: &Map<String, Value>) -> Result<Value, ExecutorError> {
    let count = int_param(params, "count", 4).max(1) as u32;
    let dial_timeout = Duration::from_secs(int_param(params, "timeout", 5).max(1));
    let ip_version = ip_version_param(params);

    let (host, port) = split_host_port(target)?;
    let ip = resolve_host(&host, &ip_version).await?;
    let addr = SocketAddr::new(ip, port);

    let mut result = TcpPingResult {
        target: target.to_string(),
        resolved_ip: ip.to_string(),
        ..Default::default()
    };

    let mut total = 0.0;
    let mut min = 0.0_f64;
    let mut max = 0.0_f64;

    for seq in 1..=count {
        let start = Instant::now();
        match timeout(dial_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                result.successful_connections += 1;
                total += elapsed_ms;
                if min == 0.0 || elapsed_ms < min {
                    min = elapsed_ms;
                }
                if elapsed_ms > max {
                    max = elapsed_ms;
                }
                result.attempts.push(TcpPingAttempt {
                    seq,
                    status: "success".to_string(),
                    time_ms: elapsed_ms,
                    error: String::new(),
                });
            }
            Ok(Err(e)) => {
                result.failed_connections += 1;
                result.attempts.push(TcpPingAttempt {
                    seq,
                    status: "failed".to_string(),
                    time_ms: 0.0,
                    error: e.to_string(),
                });
            }
            Err(_) => {
                result.failed_connections += 1;
                result.attempts.push(TcpPingAttempt {
                    seq,
                    status: "failed".to_string(),
                    time_ms: 0.0,
                    error: format!("connect timed out after {}s", dial_timeout.as_secs()),
                });
            }
        }
    }

    if result.successful_connections > 0 {
        result.avg_connect_time_ms = total / result.successful_connections as f64;
        result.min_connect_time_ms = min;
        result.max_connect_time_ms = max;
    }

    Ok(serde_json::to_value(result).unwrap_or(Value::Null))
}

/// Accepts `host:port` and `[ipv6]:port` only. A bare host, a bare IPv6
/// address, or an out-of-range port is an invalid target.
pub fn split_host_port(target: &str) -> Result<(String, u16), ExecutorError> {
    let target = target.trim();

    let (host, port_str) = if let Some(rest) = target.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(|| {
            ExecutorError::InvalidTarget("target must be host:port or [ipv6]:port".to_string())
        })?;
        let port = after.strip_prefix(':').ok_or_else(|| {
            ExecutorError::InvalidTarget("target must be host:port or [ipv6]:port".to_string())
        })?;
        (host, port)
    } else {
        match target.rsplit_once(':') {
            // More than one colon without brackets is an un-bracketed IPv6.
            Some((host, port)) if !host.contains(':') => (host, port),
            _ => {
                return Err(ExecutorError::InvalidTarget(
                    "target must be host:port or [ipv6]:port".to_string(),
                ))
            }
        }
    };

    if host.is_empty() || port_str.is_empty() {
        return Err(ExecutorError::InvalidTarget(
            "target must include host and port".to_string(),
        ));
    }

    let port: u16 = port_str
        .parse()
        .ok()
        .filter(|p| *p >= 1)
        .ok_or_else(|| ExecutorError::InvalidTarget(format!("invalid tcp port: {port_str}")))?;

    Ok((strip_zone(host).to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[test]
    fn host_port_forms() {
        assert_eq!(
            split_host_port("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            split_host_port("[2001:db8::1]:22").unwrap(),
            ("2001:db8::1".to_string(), 22)
        );
        assert_eq!(
            split_host_port(" 192.0.2.1:80 ").unwrap(),
            ("192.0.2.1".to_string(), 80)
        );
    }

    #[test]
    fn rejects_missing_or_bad_ports() {
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port("2001:db8::1").is_err());
        assert!(split_host_port("example.com:").is_err());
        assert!(split_host_port(":443").is_err());
        assert!(split_host_port("example.com:0").is_err());
        assert!(split_host_port("example.com:70000").is_err());
    }

    #[tokio::test]
    async fn connects_to_a_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let params = json!({"count": 2, "timeout": 2})
            .as_object()
            .cloned()
            .unwrap();
        let value = run(&format!("127.0.0.1:{port}"), &params).await.unwrap();
        let result: TcpPingResult = serde_json::from_value(value).unwrap();

        assert_eq!(result.successful_connections, 2);
        assert_eq!(result.failed_connections, 0);
        assert_eq!(result.resolved_ip, "127.0.0.1");
        assert!(result.avg_connect_time_ms >= 0.0);
        assert_eq!(result.attempts.len(), 2);
    }

    #[tokio::test]
    async fn refused_port_records_failed_attempts() {
        // Bind then drop to find a port that is almost certainly closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let params = json!({"count": 1, "timeout": 1})
            .as_object()
            .cloned()
            .unwrap();
        let value = run(&format!("127.0.0.1:{port}"), &params).await.unwrap();
        let result: TcpPingResult = serde_json::from_value(value).unwrap();

        assert_eq!(result.successful_connections, 0);
        assert_eq!(result.failed_connections, 1);
        assert!(!result.attempts[0].error.is_empty());
    }
}
