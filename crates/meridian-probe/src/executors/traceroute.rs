//! Path discovery via the system `traceroute` in numeric ICMP mode. ICMP
//! probes (`-I`) survive networks that blackhole the default UDP range.

use super::{ip_version_param, resolve_host, ExecutorError};
use meridian_proto::{TracerouteHop, TracerouteResult};
use serde_json::{Map, Value};
use std::net::IpAddr;
use tokio::process::Command;

pub async fn run(target: &str, params: &Map<String, Value>) -> Result<Value, ExecutorError> {
    let ip_version = ip_version_param(params);
    let ip = resolve_host(target, &ip_version).await?;

    let output = Command::new("traceroute")
        .args(["-n", "-I", &ip.to_string()])
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ExecutorError::Command(format!("failed to run traceroute: {e}")))?;

    // traceroute often exits non-zero while still printing usable hops.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let hops = parse_traceroute_output(&stdout);

    let result = TracerouteResult {
        total_hops: hops.len(),
        hops,
        target: target.to_string(),
        success: true,
        resolved_ip: ip.to_string(),
    };

    Ok(serde_json::to_value(result).unwrap_or(Value::Null))
}

fn parse_traceroute_output(output: &str) -> Vec<TracerouteHop> {
    let mut hops = Vec::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }
        let Ok(hop_num) = fields[0].parse::<u32>() else {
            continue; // header or continuation line
        };

        let mut hop = TracerouteHop {
            hop: hop_num,
            ..Default::default()
        };

        let mut prev_number: Option<f64> = None;
        for field in &fields[1..] {
            if *field == "*" {
                hop.timeout = true;
                prev_number = None;
                continue;
            }
            // RTTs appear either as "12.345 ms" (two tokens) or "12.345ms".
            if *field == "ms" {
                if let Some(rtt) = prev_number.take() {
                    hop.rtts.push(rtt);
                }
                continue;
            }
            if let Some(num) = field.strip_suffix("ms") {
                if let Ok(rtt) = num.parse::<f64>() {
                    hop.rtts.push(rtt);
                    prev_number = None;
                    continue;
                }
            }
            if let Ok(n) = field.parse::<f64>() {
                prev_number = Some(n);
                continue;
            }
            prev_number = None;
            if hop.ip.is_empty() && field.parse::<IpAddr>().is_ok() {
                hop.ip = field.to_string();
            }
        }

        hops.push(hop);
    }

    hops
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\
traceroute to 8.8.8.8 (8.8.8.8), 30 hops max, 60 byte packets
 1  192.168.1.1  0.390 ms  0.355 ms  0.331 ms
 2  10.10.0.1  1.184 ms  1.201 ms  1.166 ms
 3  * * *
 4  72.14.204.94  9.244 ms  8.916 ms  9.301 ms";

    #[test]
    fn hops_ips_and_rtts_are_extracted() {
        let hops = parse_traceroute_output(OUTPUT);
        assert_eq!(hops.len(), 4);

        assert_eq!(hops[0].hop, 1);
        assert_eq!(hops[0].ip, "192.168.1.1");
        assert_eq!(hops[0].rtts.len(), 3);
        assert!((hops[0].rtts[0] - 0.390).abs() < 1e-9);
        assert!(!hops[0].timeout);

        assert_eq!(hops[2].hop, 3);
        assert!(hops[2].timeout);
        assert!(hops[2].ip.is_empty());
        assert!(hops[2].rtts.is_empty());
    }

    #[test]
    fn suffixed_rtt_tokens_are_accepted() {
        let hops = parse_traceroute_output(" 1  203.0.113.9  4.2ms  4.5ms");
        assert_eq!(hops[0].rtts, vec![4.2, 4.5]);
        assert_eq!(hops[0].ip, "203.0.113.9");
    }

    #[test]
    fn header_lines_are_skipped() {
        let hops = parse_traceroute_output("traceroute to example.com, 30 hops max\n");
        assert!(hops.is_empty());
    }
}
