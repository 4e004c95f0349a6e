//! Probe listing and detail. Connection addresses stay server-side: rows
//! are scrubbed before they leave the API.

use super::error::AppError;
use super::AppState;
use crate::db::probes;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct ListProbesQuery {
    pub status: Option<String>,
}

pub async fn list_probes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListProbesQuery>,
) -> Result<Json<Value>, AppError> {
    let status = query.status.as_deref().filter(|s| !s.is_empty());

    // `online` is answered from heartbeat freshness, not the stored status
    // field, so rows that went stale without a disconnect don't show up.
    let mut listed = match status {
        Some("online") => probes::get_online_probes(&state.db).await?,
        other => probes::list_probes(&state.db, other).await?,
    };

    for probe in &mut listed {
        probe.ip_address.clear();
    }

    Ok(Json(json!({ "probes": listed, "total": listed.len() })))
}

pub async fn get_probe(
    State(state): State<Arc<AppState>>,
    Path(probe_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let mut probe = probes::get_probe(&state.db, &probe_id).await?;
    probe.ip_address.clear();
    Ok(Json(serde_json::to_value(probe)?))
}
