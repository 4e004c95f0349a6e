//! Routing-table lookup through the BIRD daemon's CLI.

use super::ExecutorError;
use meridian_proto::{RouteEntry, RouteLookupResult};
use serde_json::Value;
use tokio::process::Command;

pub async fn run(target: &str) -> Result<Value, ExecutorError> {
    if which::which("birdc").is_err() {
        return Err(ExecutorError::Command("birdc command not found".to_string()));
    }

    let output = Command::new("birdc")
        .args(["show", "route", "for", target])
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ExecutorError::Command(format!("failed to run birdc: {e}")))?;

    if !output.status.success() {
        return Err(ExecutorError::Command(format!(
            "birdc exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let routes = parse_birdc_output(&String::from_utf8_lossy(&output.stdout));
    let result = RouteLookupResult {
        total_routes: routes.len(),
        routes,
        success: true,
    };

    Ok(serde_json::to_value(result).unwrap_or(Value::Null))
}

// Typical line: "192.0.2.0/24 via 198.51.100.1 on eth0 [bgp1 2024-01-11] * (100)"
fn parse_birdc_output(output: &str) -> Vec<RouteEntry> {
    let mut routes = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty()
            || line.to_ascii_lowercase().starts_with("bird")
            || line.starts_with("---")
        {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }

        let mut route = RouteEntry {
            network: fields[0].to_string(),
            ..Default::default()
        };

        for (i, field) in fields.iter().enumerate() {
            match *field {
                "via" if i + 1 < fields.len() => route.gateway = fields[i + 1].to_string(),
                "on" if i + 1 < fields.len() => route.interface = fields[i + 1].to_string(),
                _ => {}
            }
        }
        if let Some(proto) = fields.iter().find(|f| f.starts_with('[')) {
            route.protocol = proto.trim_matches(|c| c == '[' || c == ']').to_string();
        }

        routes.push(route);
    }

    routes
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\
BIRD 2.0.8 ready.
Table master4:
192.0.2.0/24         via 198.51.100.1 on eth0 [bgp1 2024-01-11] * (100) [AS64500i]
10.0.0.0/8           via 10.0.0.254 on eth1 [static1 2024-01-02] (200)";

    #[test]
    fn route_tokens_are_parsed() {
        let routes = parse_birdc_output(OUTPUT);
        assert_eq!(routes.len(), 2);

        assert_eq!(routes[0].network, "192.0.2.0/24");
        assert_eq!(routes[0].gateway, "198.51.100.1");
        assert_eq!(routes[0].interface, "eth0");
        assert_eq!(routes[0].protocol, "bgp1");

        assert_eq!(routes[1].protocol, "static1");
    }

    #[test]
    fn banner_and_short_lines_are_skipped() {
        let routes = parse_birdc_output("BIRD 2.0.8 ready.\nvia something\n");
        assert!(routes.is_empty());
    }
}
