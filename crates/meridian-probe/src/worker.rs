//! Worker pool: a bounded assignment queue drained under a concurrency
//! limit. Every accepted assignment produces exactly one terminal
//! `task_result`, whether it ran, was cancelled, timed out, or named a type
//! this probe cannot execute.

use crate::executors;
use meridian_proto::{TaskAssignPayload, TaskResultPayload, TaskStatusPayload};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

const QUEUE_CAPACITY: usize = 100;

/// Frames the pool wants on the wire. The session owns the transport; the
/// pool only ever sees this channel.
#[derive(Debug)]
pub enum Outbound {
    Status(TaskStatusPayload),
    Result(TaskResultPayload),
}

type CancelMap = Arc<Mutex<HashMap<String, oneshot::Sender<String>>>>;

#[derive(Clone)]
pub struct WorkerPool {
    queue_tx: mpsc::Sender<TaskAssignPayload>,
    cancels: CancelMap,
    active: Arc<AtomicUsize>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(max_workers: usize, outbound_tx: mpsc::Sender<Outbound>) -> Self {
        let max_workers = max_workers.max(1);
        let (queue_tx, mut queue_rx) = mpsc::channel::<TaskAssignPayload>(QUEUE_CAPACITY);
        let cancels: CancelMap = Arc::new(Mutex::new(HashMap::new()));
        let active = Arc::new(AtomicUsize::new(0));

        let semaphore = Arc::new(Semaphore::new(max_workers));
        let dispatcher_cancels = cancels.clone();
        let dispatcher_active = active.clone();
        tokio::spawn(async move {
            while let Some(job) = queue_rx.recv().await {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                tokio::spawn(run_job(
                    permit,
                    job,
                    dispatcher_cancels.clone(),
                    dispatcher_active.clone(),
                    outbound_tx.clone(),
                ));
            }
            info!("assignment queue closed, dispatcher exiting");
        });

        Self {
            queue_tx,
            cancels,
            active,
            max_workers,
        }
    }

    pub async fn submit(&self, job: TaskAssignPayload) {
        info!(
            task_id = %job.task_id,
            execution_id = %job.execution_id,
            task_type = %job.task_type,
            target = %job.target,
            "accepted assignment"
        );
        if self.queue_tx.send(job).await.is_err() {
            warn!("assignment queue is gone, dropping job");
        }
    }

    /// Trigger the cancel handle for a running execution. Unknown ids are a
    /// no-op: the work already reached a terminal state or never started.
    pub async fn cancel(&self, execution_id: &str, reason: &str) {
        let handle = self.cancels.lock().await.remove(execution_id);
        match handle {
            Some(tx) => {
                info!(execution_id, reason, "cancelling task");
                let _ = tx.send(reason.to_string());
            }
            None => info!(execution_id, "cancel requested for task that is not running"),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_busy(&self) -> bool {
        self.active_count() >= self.max_workers
    }
}

async fn run_job(
    permit: OwnedSemaphorePermit,
    job: TaskAssignPayload,
    cancels: CancelMap,
    active: Arc<AtomicUsize>,
    outbound_tx: mpsc::Sender<Outbound>,
) {
    let _permit = permit;

    let (cancel_tx, cancel_rx) = oneshot::channel::<String>();
    cancels
        .lock()
        .await
        .insert(job.execution_id.clone(), cancel_tx);
    active.fetch_add(1, Ordering::Relaxed);

    let _ = outbound_tx
        .send(Outbound::Status(TaskStatusPayload {
            execution_id: job.execution_id.clone(),
            task_id: job.task_id.clone(),
            probe_id: String::new(),
            status: "running".to_string(),
            progress: 0,
            message: String::new(),
        }))
        .await;

    let started = Instant::now();
    let outcome = run_with_limits(&job, cancel_rx).await;
    let duration_ms = started.elapsed().as_millis() as i64;

    let result = match outcome {
        Ok(data) => TaskResultPayload {
            execution_id: job.execution_id.clone(),
            task_id: job.task_id.clone(),
            probe_id: String::new(),
            status: "success".to_string(),
            result_data: data,
            error: String::new(),
            duration_ms,
        },
        Err(message) => {
            warn!(execution_id = %job.execution_id, error = %message, "task failed");
            TaskResultPayload {
                execution_id: job.execution_id.clone(),
                task_id: job.task_id.clone(),
                probe_id: String::new(),
                status: "failed".to_string(),
                result_data: serde_json::Value::Null,
                error: message,
                duration_ms,
            }
        }
    };

    if outbound_tx.send(Outbound::Result(result)).await.is_err() {
        warn!(execution_id = %job.execution_id, "failed to hand result to the session");
    }

    cancels.lock().await.remove(&job.execution_id);
    active.fetch_sub(1, Ordering::Relaxed);
}

/// Race the executor against the cancel handle and the per-task timeout.
/// Dropping the executor future kills any subprocess it spawned.
async fn run_with_limits(
    job: &TaskAssignPayload,
    mut cancel_rx: oneshot::Receiver<String>,
) -> Result<serde_json::Value, String> {
    let execution = executors::execute(&job.task_type, &job.target, &job.parameters);
    tokio::pin!(execution);

    if job.timeout > 0 {
        tokio::select! {
            biased;
            reason = &mut cancel_rx => {
                Err(format!("cancelled: {}", reason.unwrap_or_else(|_| "shutdown".to_string())))
            }
            _ = tokio::time::sleep(Duration::from_secs(job.timeout)) => {
                Err(format!("timed out after {}s", job.timeout))
            }
            res = &mut execution => res.map_err(|e| e.to_string()),
        }
    } else {
        tokio::select! {
            biased;
            reason = &mut cancel_rx => {
                Err(format!("cancelled: {}", reason.unwrap_or_else(|_| "shutdown".to_string())))
            }
            res = &mut execution => res.map_err(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(task_type: &str, target: &str) -> TaskAssignPayload {
        TaskAssignPayload {
            task_id: "task-1".to_string(),
            execution_id: "exec-1".to_string(),
            task_type: task_type.to_string(),
            target: target.to_string(),
            parameters: serde_json::Map::new(),
            timeout: 30,
        }
    }

    #[tokio::test]
    async fn unknown_type_emits_running_then_exactly_one_failed_result() {
        let (tx, mut rx) = mpsc::channel(16);
        let pool = WorkerPool::new(2, tx);

        pool.submit(job("quantum_ping", "example.com")).await;

        match rx.recv().await.unwrap() {
            Outbound::Status(s) => {
                assert_eq!(s.status, "running");
                assert_eq!(s.progress, 0);
            }
            other => panic!("expected status first, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            Outbound::Result(r) => {
                assert_eq!(r.status, "failed");
                assert_eq!(r.error, "unsupported task type: quantum_ping");
                assert!(r.duration_ms >= 0);
            }
            other => panic!("expected terminal result, got {other:?}"),
        }

        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn invalid_tcp_target_fails_with_the_validation_error() {
        let (tx, mut rx) = mpsc::channel(16);
        let pool = WorkerPool::new(1, tx);

        pool.submit(job(meridian_proto::TASK_TCP_PING, "example.com"))
            .await;

        let _status = rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            Outbound::Result(r) => {
                assert_eq!(r.status, "failed");
                assert!(r.error.contains("host:port"));
            }
            other => panic!("expected terminal result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_of_unknown_execution_is_a_noop() {
        let (tx, _rx) = mpsc::channel(16);
        let pool = WorkerPool::new(1, tx);
        pool.cancel("never-seen", "operator request").await;
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn busy_tracks_the_worker_limit() {
        let (tx, _rx) = mpsc::channel(16);
        let pool = WorkerPool::new(3, tx);
        assert!(!pool.is_busy());
    }
}
