//! Result queries, the geolocation endpoint, and liveness.

use super::error::AppError;
use super::AppState;
use crate::db::results;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct ListResultsQuery {
    pub task_id: Option<String>,
    pub probe_id: Option<String>,
    pub execution_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_results(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListResultsQuery>,
) -> Result<Json<Value>, AppError> {
    let limit = query.limit.unwrap_or(100);
    let offset = query.offset.unwrap_or(0);

    let listed = if let Some(task_id) = query.task_id.filter(|t| !t.is_empty()) {
        results::list_results_by_task(&state.db, &task_id, limit, offset).await?
    } else if let Some(probe_id) = query.probe_id.filter(|p| !p.is_empty()) {
        results::list_results_by_probe(&state.db, &probe_id, limit, offset).await?
    } else if let Some(execution_id) = query.execution_id.filter(|e| !e.is_empty()) {
        results::list_results_by_execution(&state.db, &execution_id).await?
    } else {
        return Err(AppError::InvalidInput(
            "task_id or probe_id required".to_string(),
        ));
    };

    Ok(Json(json!({ "results": listed })))
}

pub async fn get_result(
    State(state): State<Arc<AppState>>,
    Path(result_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let result = results::get_result(&state.db, &result_id).await?;
    Ok(Json(serde_json::to_value(result)?))
}

#[derive(Debug, Deserialize)]
pub struct GeoIpQuery {
    pub ip: Option<String>,
}

pub async fn geoip_lookup(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GeoIpQuery>,
) -> Result<Json<Value>, AppError> {
    let ip = query
        .ip
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| AppError::InvalidInput("ip parameter is required".to_string()))?;

    match state.geoip.lookup(&ip).await {
        Ok(location) => Ok(Json(json!({ "success": true, "data": location }))),
        Err(e) => Err(AppError::InvalidInput(e.to_string())),
    }
}
