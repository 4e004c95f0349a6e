//! HTTP reachability: N GET requests, 2xx/3xx counts as up.

use super::{int_param, ip_version_param, resolve_host, ExecutorError};
use meridian_proto::{HttpAttempt, HttpTestResult};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};

const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(target: &str, params: &Map<String, Value>) -> Result<Value, ExecutorError> {
    let count = int_param(params, "count", 1).max(1) as u32;

    let client = reqwest::Client::builder()
        .timeout(TRANSPORT_TIMEOUT)
        .build()
        .map_err(|e| ExecutorError::Command(format!("failed to build http client: {e}")))?;

    let mut result = HttpTestResult {
        target: target.to_string(),
        ..Default::default()
    };

    // Best effort: report which address the URL's host resolves to.
    if let Ok(url) = reqwest::Url::parse(target) {
        if let Some(host) = url.host_str() {
            if let Ok(ip) = resolve_host(host, &ip_version_param(params)).await {
                result.resolved_ip = ip.to_string();
            }
        }
    }

    let mut total = 0.0;
    let mut min = 0.0_f64;
    let mut max = 0.0_f64;

    for seq in 1..=count {
        let start = Instant::now();
        match client.get(target).send().await {
            Ok(resp) => {
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                let code = resp.status().as_u16();
                if (200..400).contains(&code) {
                    result.successful_requests += 1;
                    total += elapsed_ms;
                    if min == 0.0 || elapsed_ms < min {
                        min = elapsed_ms;
                    }
                    if elapsed_ms > max {
                        max = elapsed_ms;
                    }
                    result.attempts.push(HttpAttempt {
                        seq,
                        status: "success".to_string(),
                        time_ms: elapsed_ms,
                        status_code: code,
                        error: String::new(),
                    });
                } else {
                    result.failed_requests += 1;
                    result.attempts.push(HttpAttempt {
                        seq,
                        status: "failed".to_string(),
                        time_ms: elapsed_ms,
                        status_code: code,
                        error: String::new(),
                    });
                }
            }
            Err(e) => {
                result.failed_requests += 1;
                result.attempts.push(HttpAttempt {
                    seq,
                    status: "failed".to_string(),
                    time_ms: 0.0,
                    status_code: 0,
                    error: e.to_string(),
                });
            }
        }
    }

    if result.successful_requests > 0 {
        result.avg_connect_time_ms = total / result.successful_requests as f64;
        result.min_connect_time_ms = min;
        result.max_connect_time_ms = max;
    }

    Ok(serde_json::to_value(result).unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unreachable_url_yields_failed_attempts_not_an_error() {
        // TEST-NET-1 address: connection should fail fast or time out, and
        // either way the run itself succeeds with failed attempts recorded.
        let params = json!({"count": 1}).as_object().cloned().unwrap();
        let value = run("http://127.0.0.1:9/", &params).await.unwrap();
        let result: HttpTestResult = serde_json::from_value(value).unwrap();

        assert_eq!(result.successful_requests, 0);
        assert_eq!(result.failed_requests, 1);
        assert_eq!(result.attempts.len(), 1);
        assert!(!result.attempts[0].error.is_empty());
    }
}
