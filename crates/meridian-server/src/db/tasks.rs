use super::models::{ExecutionStatus, ScheduleState, Task, TaskExecution, TaskMode, TaskStatus};
use super::{DbError, DbPool};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

const TASK_COLUMNS: &str = "id, task_id, task_type, mode, target, parameters, assigned_probes, \
                            status, schedule, priority, created_at, started_at, completed_at, next_run_at";

const EXECUTION_COLUMNS: &str =
    "id, execution_id, task_id, probe_id, status, started_at, completed_at, error";

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    let parameters: String = row.get("parameters")?;
    let assigned: String = row.get("assigned_probes")?;
    let schedule: Option<String> = row.get("schedule")?;
    let mode: String = row.get("mode")?;
    let status: String = row.get("status")?;
    Ok(Task {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        task_type: row.get("task_type")?,
        mode: TaskMode::parse(&mode),
        target: row.get("target")?,
        parameters: serde_json::from_str(&parameters).unwrap_or_default(),
        assigned_probes: serde_json::from_str(&assigned).unwrap_or_default(),
        status: TaskStatus::parse(&status),
        schedule: schedule
            .filter(|s| !s.is_empty())
            .and_then(|s| serde_json::from_str::<ScheduleState>(&s).ok()),
        priority: row.get("priority")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        next_run_at: row.get("next_run_at")?,
    })
}

fn row_to_execution(row: &Row) -> rusqlite::Result<TaskExecution> {
    let status: String = row.get("status")?;
    Ok(TaskExecution {
        id: row.get("id")?,
        execution_id: row.get("execution_id")?,
        task_id: row.get("task_id")?,
        probe_id: row.get("probe_id")?,
        status: ExecutionStatus::parse(&status),
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        error: row.get("error")?,
    })
}

fn schedule_to_sql(schedule: &Option<ScheduleState>) -> Result<Option<String>, DbError> {
    Ok(match schedule {
        Some(state) => Some(serde_json::to_string(state)?),
        None => None,
    })
}

pub async fn create_task(pool: &DbPool, task: &Task) -> Result<(), DbError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO tasks (task_id, task_type, mode, target, parameters, assigned_probes,
                            status, schedule, priority, created_at, started_at, completed_at, next_run_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            task.task_id,
            task.task_type,
            task.mode.as_str(),
            task.target,
            serde_json::to_string(&task.parameters)?,
            serde_json::to_string(&task.assigned_probes)?,
            task.status.as_str(),
            schedule_to_sql(&task.schedule)?,
            task.priority,
            task.created_at,
            task.started_at,
            task.completed_at,
            task.next_run_at,
        ],
    )?;
    Ok(())
}

pub async fn get_task(pool: &DbPool, task_id: &str) -> Result<Task, DbError> {
    let conn = pool.get()?;
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
        params![task_id],
        row_to_task,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(format!("task {task_id}")),
        other => other.into(),
    })
}

pub async fn list_tasks(
    pool: &DbPool,
    status: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Task>, DbError> {
    let conn = pool.get()?;
    let mut tasks = Vec::new();
    match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt.query_map(params![status, limit, offset], row_to_task)?;
            for row in rows {
                tasks.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
            ))?;
            let rows = stmt.query_map(params![limit, offset], row_to_task)?;
            for row in rows {
                tasks.push(row?);
            }
        }
    }
    Ok(tasks)
}

/// Persist the mutable slice of a task: state, schedule, and the lifecycle
/// timestamps. Identity fields never change after creation.
pub async fn update_task(pool: &DbPool, task: &Task) -> Result<(), DbError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE tasks SET status = ?1, started_at = ?2, completed_at = ?3,
                          next_run_at = ?4, schedule = ?5
         WHERE task_id = ?6",
        params![
            task.status.as_str(),
            task.started_at,
            task.completed_at,
            task.next_run_at,
            schedule_to_sql(&task.schedule)?,
            task.task_id,
        ],
    )?;
    Ok(())
}

/// Status-only transition. Terminal states also stamp `completed_at` and
/// clear `next_run_at`, keeping the terminal-state invariants in one place.
pub async fn update_task_status(
    pool: &DbPool,
    task_id: &str,
    status: TaskStatus,
) -> Result<(), DbError> {
    let conn = pool.get()?;
    if status.is_terminal() {
        conn.execute(
            "UPDATE tasks SET status = ?1, completed_at = ?2, next_run_at = NULL WHERE task_id = ?3",
            params![status.as_str(), Utc::now(), task_id],
        )?;
    } else {
        conn.execute(
            "UPDATE tasks SET status = ?1 WHERE task_id = ?2",
            params![status.as_str(), task_id],
        )?;
    }
    Ok(())
}

/// Single-shot work for the scheduler: pending, non-continuous, highest
/// priority first, oldest first within a priority.
pub async fn get_pending_tasks(pool: &DbPool) -> Result<Vec<Task>, DbError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE status = 'pending' AND mode != 'continuous'
         ORDER BY priority DESC, created_at ASC"
    ))?;
    let rows = stmt.query_map([], row_to_task)?;
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row?);
    }
    Ok(tasks)
}

pub async fn get_due_continuous_tasks(
    pool: &DbPool,
    now: DateTime<Utc>,
) -> Result<Vec<Task>, DbError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE mode = 'continuous' AND next_run_at <= ?1
           AND (status = 'running' OR status = 'pending')
         ORDER BY priority DESC"
    ))?;
    let rows = stmt.query_map(params![now], row_to_task)?;
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row?);
    }
    Ok(tasks)
}

pub async fn save_execution(pool: &DbPool, execution: &TaskExecution) -> Result<(), DbError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO task_executions (execution_id, task_id, probe_id, status, started_at, completed_at, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            execution.execution_id,
            execution.task_id,
            execution.probe_id,
            execution.status.as_str(),
            execution.started_at,
            execution.completed_at,
            execution.error,
        ],
    )?;
    Ok(())
}

pub async fn update_execution(pool: &DbPool, execution: &TaskExecution) -> Result<(), DbError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE task_executions SET status = ?1, completed_at = ?2, error = ?3
         WHERE execution_id = ?4",
        params![
            execution.status.as_str(),
            execution.completed_at,
            execution.error,
            execution.execution_id,
        ],
    )?;
    Ok(())
}

pub async fn get_execution(pool: &DbPool, execution_id: &str) -> Result<TaskExecution, DbError> {
    let conn = pool.get()?;
    conn.query_row(
        &format!("SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE execution_id = ?1"),
        params![execution_id],
        row_to_execution,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            DbError::NotFound(format!("execution {execution_id}"))
        }
        other => other.into(),
    })
}

pub async fn list_executions_by_task(
    pool: &DbPool,
    task_id: &str,
) -> Result<Vec<TaskExecution>, DbError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE task_id = ?1 ORDER BY started_at DESC"
    ))?;
    let rows = stmt.query_map(params![task_id], row_to_execution)?;
    let mut executions = Vec::new();
    for row in rows {
        executions.push(row?);
    }
    Ok(executions)
}

#[cfg(test)]
pub(crate) fn test_task(task_id: &str, task_type: &str, mode: TaskMode) -> Task {
    Task {
        id: 0,
        task_id: task_id.to_string(),
        task_type: task_type.to_string(),
        mode,
        target: "192.0.2.1".to_string(),
        parameters: serde_json::Map::new(),
        assigned_probes: Vec::new(),
        status: TaskStatus::Pending,
        schedule: None,
        priority: 5,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        next_run_at: None,
    }
}

#[cfg(test)]
pub(crate) fn test_execution(execution_id: &str, task_id: &str, probe_id: &str) -> TaskExecution {
    TaskExecution {
        id: 0,
        execution_id: execution_id.to_string(),
        task_id: task_id.to_string(),
        probe_id: probe_id.to_string(),
        status: ExecutionStatus::Pending,
        started_at: Utc::now(),
        completed_at: None,
        error: None,
    }
}
