use super::models::{Probe, ProbeStatus};
use super::{DbError, DbPool};
use chrono::{Duration, Utc};
use rusqlite::{params, Row};

/// Probes are considered live while their last heartbeat is younger than
/// this.
pub const HEARTBEAT_THRESHOLD_MINUTES: i64 = 5;

const PROBE_COLUMNS: &str = "id, probe_id, name, location, region, latitude, longitude, \
                             ip_address, capabilities, status, last_heartbeat, registered_at, metadata";

fn row_to_probe(row: &Row) -> rusqlite::Result<Probe> {
    let capabilities: String = row.get("capabilities")?;
    let metadata: String = row.get("metadata")?;
    let status: String = row.get("status")?;
    Ok(Probe {
        id: row.get("id")?,
        probe_id: row.get("probe_id")?,
        name: row.get("name")?,
        location: row.get("location")?,
        region: row.get("region")?,
        latitude: row.get("latitude")?,
        longitude: row.get("longitude")?,
        ip_address: row.get("ip_address")?,
        capabilities: serde_json::from_str(&capabilities).unwrap_or_default(),
        status: ProbeStatus::parse(&status),
        last_heartbeat: row.get("last_heartbeat")?,
        registered_at: row.get("registered_at")?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    })
}

/// Insert or refresh a probe row, keyed on the durable probe id.
pub async fn save_probe(pool: &DbPool, probe: &Probe) -> Result<(), DbError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO probes (probe_id, name, location, region, latitude, longitude,
                             ip_address, capabilities, status, last_heartbeat, registered_at, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(probe_id) DO UPDATE SET
             name = excluded.name,
             location = excluded.location,
             region = excluded.region,
             latitude = excluded.latitude,
             longitude = excluded.longitude,
             ip_address = excluded.ip_address,
             capabilities = excluded.capabilities,
             status = excluded.status,
             last_heartbeat = excluded.last_heartbeat,
             metadata = excluded.metadata",
        params![
            probe.probe_id,
            probe.name,
            probe.location,
            probe.region,
            probe.latitude,
            probe.longitude,
            probe.ip_address,
            serde_json::to_string(&probe.capabilities)?,
            probe.status.as_str(),
            probe.last_heartbeat,
            probe.registered_at,
            serde_json::to_string(&probe.metadata)?,
        ],
    )?;
    Ok(())
}

pub async fn get_probe(pool: &DbPool, probe_id: &str) -> Result<Probe, DbError> {
    let conn = pool.get()?;
    conn.query_row(
        &format!("SELECT {PROBE_COLUMNS} FROM probes WHERE probe_id = ?1"),
        params![probe_id],
        row_to_probe,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(format!("probe {probe_id}")),
        other => other.into(),
    })
}

pub async fn list_probes(pool: &DbPool, status: Option<&str>) -> Result<Vec<Probe>, DbError> {
    let conn = pool.get()?;
    let mut probes = Vec::new();
    match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROBE_COLUMNS} FROM probes WHERE status = ?1 ORDER BY registered_at DESC"
            ))?;
            let rows = stmt.query_map(params![status], row_to_probe)?;
            for row in rows {
                probes.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROBE_COLUMNS} FROM probes ORDER BY registered_at DESC"
            ))?;
            let rows = stmt.query_map([], row_to_probe)?;
            for row in rows {
                probes.push(row?);
            }
        }
    }
    Ok(probes)
}

/// Probes with a fresh heartbeat. This is the authoritative "online" view:
/// rows whose status field went stale are excluded by the time filter.
pub async fn get_online_probes(pool: &DbPool) -> Result<Vec<Probe>, DbError> {
    let threshold = Utc::now() - Duration::minutes(HEARTBEAT_THRESHOLD_MINUTES);
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROBE_COLUMNS} FROM probes
         WHERE last_heartbeat > ?1 AND status != 'offline'
         ORDER BY name"
    ))?;
    let rows = stmt.query_map(params![threshold], row_to_probe)?;
    let mut probes = Vec::new();
    for row in rows {
        probes.push(row?);
    }
    Ok(probes)
}

pub async fn update_probe_status(
    pool: &DbPool,
    probe_id: &str,
    status: ProbeStatus,
) -> Result<(), DbError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE probes SET status = ?1, last_heartbeat = ?2 WHERE probe_id = ?3",
        params![status.as_str(), Utc::now(), probe_id],
    )?;
    Ok(())
}

pub async fn update_probe_heartbeat(pool: &DbPool, probe_id: &str) -> Result<(), DbError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE probes SET last_heartbeat = ?1 WHERE probe_id = ?2",
        params![Utc::now(), probe_id],
    )?;
    Ok(())
}

pub async fn delete_probe(pool: &DbPool, probe_id: &str) -> Result<(), DbError> {
    let conn = pool.get()?;
    conn.execute("DELETE FROM probes WHERE probe_id = ?1", params![probe_id])?;
    Ok(())
}

pub async fn get_probe_capabilities(pool: &DbPool, probe_id: &str) -> Result<Vec<String>, DbError> {
    Ok(get_probe(pool, probe_id).await?.capabilities)
}

#[cfg(test)]
pub(crate) fn test_probe(probe_id: &str) -> Probe {
    Probe {
        id: 0,
        probe_id: probe_id.to_string(),
        name: format!("probe {probe_id}"),
        location: "Test City".to_string(),
        region: "TC".to_string(),
        latitude: None,
        longitude: None,
        ip_address: "203.0.113.10".to_string(),
        capabilities: vec!["icmp_ping".to_string(), "tcp_ping".to_string()],
        status: ProbeStatus::Online,
        last_heartbeat: Utc::now(),
        registered_at: Utc::now(),
        metadata: Default::default(),
    }
}
