//! ICMP ping via the system `ping` tool. The parser only trusts reply lines
//! carrying a TTL token; a run with at least one parsed reply counts as
//! success even when the subprocess exits non-zero (some ping builds exit 1
//! on partial loss).

use super::{int_param, ip_version_param, resolve_host, ExecutorError};
use meridian_proto::{IcmpPingResult, PingReply};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tokio::process::Command;

pub async fn run(target: &str, params: &Map<String, Value>) -> Result<Value, ExecutorError> {
    let count = int_param(params, "count", 4).max(1) as u32;
    let ip_version = ip_version_param(params);

    // Resolve up front so the result can report which address was measured.
    // If resolution fails we still hand the raw target to ping and let it
    // produce the error.
    let resolved_ip = match resolve_host(target, &ip_version).await {
        Ok(ip) => ip.to_string(),
        Err(_) => target.to_string(),
    };

    let output = Command::new("ping")
        .args(["-c", &count.to_string(), target])
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ExecutorError::Command(format!("failed to run ping: {e}")))?;

    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    let mut result = parse_ping_output(&text, count);
    result.resolved_ip = resolved_ip;

    if result.replies.is_empty() && !output.status.success() {
        return Err(ExecutorError::Command(format!(
            "ping exited with {}: {}",
            output.status,
            text.trim()
        )));
    }

    Ok(serde_json::to_value(result).unwrap_or(Value::Null))
}

fn rtt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[=<](\d+\.?\d*)\s*ms").unwrap())
}

fn ttl_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)ttl[=:](\d+)").unwrap())
}

fn parse_ping_output(output: &str, expected_count: u32) -> IcmpPingResult {
    let mut result = IcmpPingResult {
        packets_sent: expected_count,
        ..Default::default()
    };

    let mut seq = 1;
    for line in output.lines() {
        if !line.to_ascii_uppercase().contains("TTL") {
            continue;
        }
        let Some(rtt) = rtt_re()
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
        else {
            continue;
        };
        let ttl = ttl_re()
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(0);

        result.replies.push(PingReply {
            seq,
            ttl,
            time_ms: rtt,
        });
        seq += 1;
    }

    result.packets_received = result.replies.len() as u32;

    if !result.replies.is_empty() {
        let times: Vec<f64> = result.replies.iter().map(|r| r.time_ms).collect();
        let sum: f64 = times.iter().sum();
        let avg = sum / times.len() as f64;
        result.avg_rtt_ms = avg;
        result.min_rtt_ms = times.iter().copied().fold(f64::INFINITY, f64::min);
        result.max_rtt_ms = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let variance =
            times.iter().map(|t| (t - avg) * (t - avg)).sum::<f64>() / times.len() as f64;
        result.stddev_rtt_ms = variance.sqrt();
    }

    result.packet_loss_percent = (result.packets_sent.saturating_sub(result.packets_received))
        as f64
        / result.packets_sent.max(1) as f64
        * 100.0;

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINUX_OUTPUT: &str = "\
PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=118 time=10.5 ms
64 bytes from 8.8.8.8: icmp_seq=2 ttl=118 time=11.1 ms
64 bytes from 8.8.8.8: icmp_seq=3 ttl=118 time=9.9 ms

--- 8.8.8.8 ping statistics ---
4 packets transmitted, 3 received, 25% packet loss, time 3004ms
rtt min/avg/max/mdev = 9.900/10.500/11.100/0.490 ms";

    #[test]
    fn parses_reply_lines_and_stats() {
        let result = parse_ping_output(LINUX_OUTPUT, 4);
        assert_eq!(result.packets_sent, 4);
        assert_eq!(result.packets_received, 3);
        assert_eq!(result.replies[0].ttl, 118);
        assert!((result.replies[0].time_ms - 10.5).abs() < f64::EPSILON);
        assert!((result.packet_loss_percent - 25.0).abs() < 1e-9);
        assert!((result.min_rtt_ms - 9.9).abs() < 1e-9);
        assert!((result.max_rtt_ms - 11.1).abs() < 1e-9);
        assert!((result.avg_rtt_ms - 10.5).abs() < 1e-9);
        assert!(result.stddev_rtt_ms > 0.0);
    }

    #[test]
    fn windows_style_lines_are_accepted() {
        let output = "Reply from 1.1.1.1: bytes=32 time=13ms TTL=48";
        let result = parse_ping_output(output, 1);
        assert_eq!(result.packets_received, 1);
        assert_eq!(result.replies[0].ttl, 48);
        assert!((result.replies[0].time_ms - 13.0).abs() < f64::EPSILON);
    }

    #[test]
    fn total_loss_yields_no_replies() {
        let output = "\
PING 192.0.2.1 (192.0.2.1) 56(84) bytes of data.

--- 192.0.2.1 ping statistics ---
4 packets transmitted, 0 received, 100% packet loss, time 3061ms";
        let result = parse_ping_output(output, 4);
        assert!(result.replies.is_empty());
        assert!((result.packet_loss_percent - 100.0).abs() < 1e-9);
    }
}
