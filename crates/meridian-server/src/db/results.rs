use super::models::TestResult;
use super::{DbError, DbPool};
use rusqlite::{params, Row};

const RESULT_COLUMNS: &str = "id, result_id, execution_id, task_id, probe_id, target, test_type, \
                              status, result_data, summary, created_at";

fn row_to_result(row: &Row) -> rusqlite::Result<TestResult> {
    let result_data: String = row.get("result_data")?;
    let summary: String = row.get("summary")?;
    Ok(TestResult {
        id: row.get("id")?,
        result_id: row.get("result_id")?,
        execution_id: row.get("execution_id")?,
        task_id: row.get("task_id")?,
        probe_id: row.get("probe_id")?,
        target: row.get("target")?,
        test_type: row.get("test_type")?,
        status: row.get("status")?,
        result_data: serde_json::from_str(&result_data).unwrap_or(serde_json::Value::Null),
        summary: serde_json::from_str(&summary).unwrap_or(serde_json::Value::Null),
        created_at: row.get("created_at")?,
    })
}

/// Upsert keyed on `execution_id`: re-delivered results replace the previous
/// row instead of accumulating, which is what makes ingestion idempotent.
pub async fn save_result(pool: &DbPool, result: &TestResult) -> Result<(), DbError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO results (result_id, execution_id, task_id, probe_id, target,
                              test_type, status, result_data, summary, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(execution_id) DO UPDATE SET
             status = excluded.status,
             result_data = excluded.result_data,
             summary = excluded.summary,
             created_at = excluded.created_at",
        params![
            result.result_id,
            result.execution_id,
            result.task_id,
            result.probe_id,
            result.target,
            result.test_type,
            result.status,
            serde_json::to_string(&result.result_data)?,
            serde_json::to_string(&result.summary)?,
            result.created_at,
        ],
    )?;
    Ok(())
}

pub async fn get_result(pool: &DbPool, result_id: &str) -> Result<TestResult, DbError> {
    let conn = pool.get()?;
    conn.query_row(
        &format!("SELECT {RESULT_COLUMNS} FROM results WHERE result_id = ?1"),
        params![result_id],
        row_to_result,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(format!("result {result_id}")),
        other => other.into(),
    })
}

pub async fn list_results_by_task(
    pool: &DbPool,
    task_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<TestResult>, DbError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {RESULT_COLUMNS} FROM results WHERE task_id = ?1
         ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt.query_map(params![task_id, limit, offset], row_to_result)?;
    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

pub async fn list_results_by_probe(
    pool: &DbPool,
    probe_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<TestResult>, DbError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {RESULT_COLUMNS} FROM results WHERE probe_id = ?1
         ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt.query_map(params![probe_id, limit, offset], row_to_result)?;
    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

pub async fn list_results_by_execution(
    pool: &DbPool,
    execution_id: &str,
) -> Result<Vec<TestResult>, DbError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {RESULT_COLUMNS} FROM results WHERE execution_id = ?1 ORDER BY created_at DESC"
    ))?;
    let rows = stmt.query_map(params![execution_id], row_to_result)?;
    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

pub async fn get_config(pool: &DbPool, key: &str) -> Result<String, DbError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT value FROM config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(format!("config key {key}")),
        other => other.into(),
    })
}

pub async fn set_config(pool: &DbPool, key: &str, value: &str) -> Result<(), DbError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, chrono::Utc::now()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::Utc;
    use serde_json::json;

    fn test_result(result_id: &str, execution_id: &str) -> TestResult {
        TestResult {
            id: 0,
            result_id: result_id.to_string(),
            execution_id: execution_id.to_string(),
            task_id: "t-1".to_string(),
            probe_id: "p-1".to_string(),
            target: "192.0.2.1".to_string(),
            test_type: "icmp_ping".to_string(),
            status: "success".to_string(),
            result_data: json!({"avg_rtt_ms": 10.0}),
            summary: json!({"avg_latency": 10.0}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn at_most_one_result_per_execution() {
        let (pool, _dir) = test_pool();

        save_result(&pool, &test_result("r-1", "e-1")).await.unwrap();

        // Re-delivery under a fresh result id replaces, not appends.
        let mut redelivered = test_result("r-2", "e-1");
        redelivered.status = "failed".to_string();
        save_result(&pool, &redelivered).await.unwrap();

        let rows = list_results_by_execution(&pool, "e-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "failed");
        assert_eq!(rows[0].result_id, "r-1");
    }

    #[tokio::test]
    async fn listing_filters_by_task_and_probe() {
        let (pool, _dir) = test_pool();
        save_result(&pool, &test_result("r-1", "e-1")).await.unwrap();

        let mut other = test_result("r-2", "e-2");
        other.task_id = "t-2".to_string();
        other.probe_id = "p-2".to_string();
        save_result(&pool, &other).await.unwrap();

        assert_eq!(
            list_results_by_task(&pool, "t-1", 100, 0).await.unwrap().len(),
            1
        );
        assert_eq!(
            list_results_by_probe(&pool, "p-2", 100, 0).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn config_roundtrip_and_overwrite() {
        let (pool, _dir) = test_pool();
        assert!(matches!(
            get_config(&pool, "shared_secret").await,
            Err(DbError::NotFound(_))
        ));

        set_config(&pool, "shared_secret", "alpha").await.unwrap();
        set_config(&pool, "shared_secret", "beta").await.unwrap();
        assert_eq!(get_config(&pool, "shared_secret").await.unwrap(), "beta");
    }
}
