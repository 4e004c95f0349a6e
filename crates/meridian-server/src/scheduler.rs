//! The task scheduler: a single-writer tick loop that moves persistent task
//! state forward. Each tick dispatches pending single-shot tasks, then due
//! continuous tasks, then advances continuous schedules. Errors are logged
//! and the task is simply revisited on the next tick.

use crate::db::models::{
    ExecutionStatus, Probe, ScheduleState, Task, TaskExecution, TaskMode, TaskStatus,
};
use crate::db::{probes, results, tasks, DbError, DbPool};
use crate::hub::Hub;
use chrono::{Duration as ChronoDuration, Utc};
use meridian_proto::{
    supports_continuous, TaskAssignPayload, TaskCancelPayload, MSG_TASK_ASSIGN, MSG_TASK_CANCEL,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;
const DEFAULT_INTERVAL_SECS: u64 = 1;
const DEFAULT_MAX_RUNS: u32 = 100;
const MAX_AUTO_SELECTED_PROBES: usize = 3;

pub struct Scheduler {
    db: DbPool,
    hub: Arc<Hub>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        db: DbPool,
        hub: Arc<Hub>,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            hub,
            interval,
            shutdown_rx,
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!(interval = ?self.interval, "scheduler started");
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("scheduler stopped");
                    return;
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        match tasks::get_pending_tasks(&self.db).await {
            Ok(pending) => {
                for mut task in pending {
                    if let Err(e) = self.assign_task(&mut task).await {
                        error!(task_id = %task.task_id, error = %e, "failed to assign task");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "failed to query pending tasks");
                return;
            }
        }

        match tasks::get_due_continuous_tasks(&self.db, Utc::now()).await {
            Ok(due) => {
                for mut task in due {
                    if let Err(e) = self.assign_task(&mut task).await {
                        error!(task_id = %task.task_id, error = %e, "failed to assign continuous task");
                    }
                    if let Err(e) = self.advance_schedule(&mut task).await {
                        error!(task_id = %task.task_id, error = %e, "failed to advance schedule");
                    }
                }
            }
            Err(e) => error!(error = %e, "failed to query continuous tasks"),
        }
    }

    /// Dispatch one round of executions for a task. Selecting zero probes
    /// leaves the task untouched so the next tick retries it.
    pub async fn assign_task(&self, task: &mut Task) -> Result<(), DbError> {
        let selected = self.select_probes(task).await?;
        if selected.is_empty() {
            debug!(task_id = %task.task_id, "no available probes");
            return Ok(());
        }

        info!(task_id = %task.task_id, probes = selected.len(), "assigning task");
        let timeout = self.effective_timeout(&task.task_type).await;

        for probe in &selected {
            let mut execution = TaskExecution {
                id: 0,
                execution_id: Uuid::new_v4().to_string(),
                task_id: task.task_id.clone(),
                probe_id: probe.probe_id.clone(),
                status: ExecutionStatus::Pending,
                started_at: Utc::now(),
                completed_at: None,
                error: None,
            };
            if let Err(e) = tasks::save_execution(&self.db, &execution).await {
                error!(task_id = %task.task_id, error = %e, "failed to save execution");
                continue;
            }

            let mut parameters = task.parameters.clone();
            // Continuous incremental probes do one round per tick; the
            // schedule owns the cadence and the bound.
            if task.mode == TaskMode::Continuous && supports_continuous(&task.task_type) {
                parameters.insert("count".to_string(), Value::from(1));
            }

            let assignment = TaskAssignPayload {
                task_id: task.task_id.clone(),
                execution_id: execution.execution_id.clone(),
                task_type: task.task_type.clone(),
                target: task.target.clone(),
                parameters,
                timeout,
            };

            match self
                .hub
                .send_to_probe(&probe.probe_id, MSG_TASK_ASSIGN, assignment)
                .await
            {
                Ok(()) => {
                    execution.status = ExecutionStatus::Running;
                    tasks::update_execution(&self.db, &execution).await?;
                }
                Err(e) => {
                    warn!(probe_id = %probe.probe_id, error = %e, "failed to send assignment");
                    execution.status = ExecutionStatus::Failed;
                    execution.completed_at = Some(Utc::now());
                    execution.error = Some(e.to_string());
                    tasks::update_execution(&self.db, &execution).await?;
                }
            }
        }

        task.status = TaskStatus::Running;
        if task.started_at.is_none() {
            task.started_at = Some(Utc::now());
        }
        tasks::update_task(&self.db, task).await
    }

    /// Probe selection: an explicit assignment list filtered to live
    /// sessions, or any online probe advertising the capability, capped.
    async fn select_probes(&self, task: &Task) -> Result<Vec<Probe>, DbError> {
        if !task.assigned_probes.is_empty() {
            let mut selected = Vec::new();
            for probe_id in &task.assigned_probes {
                if !self.hub.is_probe_online(probe_id).await {
                    continue;
                }
                match probes::get_probe(&self.db, probe_id).await {
                    Ok(probe) => selected.push(probe),
                    Err(DbError::NotFound(_)) => {
                        warn!(probe_id = %probe_id, "assigned probe has no record")
                    }
                    Err(e) => return Err(e),
                }
            }
            return Ok(selected);
        }

        let mut compatible = Vec::new();
        for probe in probes::get_online_probes(&self.db).await? {
            if !self.hub.is_probe_online(&probe.probe_id).await {
                continue;
            }
            if probe
                .capabilities
                .iter()
                .any(|c| c == &task.task_type || c == meridian_proto::CAPABILITY_ALL)
            {
                compatible.push(probe);
            }
        }
        compatible.truncate(MAX_AUTO_SELECTED_PROBES);
        Ok(compatible)
    }

    /// Advance a continuous task's schedule: bump the run counter, finish
    /// the task at the bound, otherwise arm the next run.
    pub async fn advance_schedule(&self, task: &mut Task) -> Result<(), DbError> {
        if !supports_continuous(&task.task_type) {
            return Ok(());
        }

        let mut state: ScheduleState = task.schedule.clone().unwrap_or_default();
        if state.interval_seconds == 0 {
            state.interval_seconds = DEFAULT_INTERVAL_SECS;
        }

        // An explicit bound in the schedule always wins; the config keys
        // only override the built-in default.
        let max_runs = match state.max_runs {
            Some(bound) if bound > 0 => bound,
            _ => {
                let key = if task.task_type == meridian_proto::TASK_TCP_PING {
                    "tcp_ping_max_runs"
                } else {
                    "ping_max_runs"
                };
                self.config_u64(key).await.map(|v| v as u32).unwrap_or(DEFAULT_MAX_RUNS)
            }
        };

        state.run_count += 1;
        if state.run_count >= max_runs {
            state.max_runs = Some(max_runs);
            task.schedule = Some(state);
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.next_run_at = None;
            tasks::update_task(&self.db, task).await?;
            info!(task_id = %task.task_id, runs = max_runs, "continuous task completed");
            return Ok(());
        }

        task.next_run_at = Some(Utc::now() + ChronoDuration::seconds(state.interval_seconds as i64));
        task.schedule = Some(state);
        tasks::update_task(&self.db, task).await
    }

    /// Cancel a task and sweep its open executions. Cancel frames to probes
    /// are best effort; a dead probe must not block the sweep.
    pub async fn cancel_task(&self, task_id: &str) -> Result<(), DbError> {
        tasks::get_task(&self.db, task_id).await?;
        tasks::update_task_status(&self.db, task_id, TaskStatus::Cancelled).await?;

        let executions = tasks::list_executions_by_task(&self.db, task_id).await?;
        for mut execution in executions {
            if execution.status.is_terminal() {
                continue;
            }

            let cancel = TaskCancelPayload {
                execution_id: execution.execution_id.clone(),
                task_id: task_id.to_string(),
                reason: "User requested cancellation".to_string(),
            };
            if let Err(e) = self
                .hub
                .send_to_probe(&execution.probe_id, MSG_TASK_CANCEL, cancel)
                .await
            {
                warn!(probe_id = %execution.probe_id, error = %e, "failed to send cancel");
            }

            execution.status = ExecutionStatus::Cancelled;
            execution.completed_at = Some(Utc::now());
            tasks::update_execution(&self.db, &execution).await?;
        }

        info!(task_id, "task cancelled");
        Ok(())
    }

    /// Per-type timeout override from config, falling back to the global
    /// `task_timeout`, falling back to the built-in default.
    async fn effective_timeout(&self, task_type: &str) -> u64 {
        if task_type == meridian_proto::TASK_TRACEROUTE {
            if let Some(timeout) = self.config_u64("traceroute_timeout_seconds").await {
                return timeout;
            }
        }
        self.config_u64("task_timeout")
            .await
            .unwrap_or(DEFAULT_TASK_TIMEOUT_SECS)
    }

    async fn config_u64(&self, key: &str) -> Option<u64> {
        match results::get_config(&self.db, key).await {
            Ok(value) => value.trim().parse().ok().filter(|v| *v > 0),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::probes::test_probe;
    use crate::db::tasks::test_task;
    use crate::db::test_pool;
    use crate::geoip::GeoIpService;
    use crate::hub::SessionHandle;
    use tokio::sync::mpsc;

    fn test_scheduler() -> (Arc<Scheduler>, Arc<Hub>, tempfile::TempDir) {
        let (pool, dir) = test_pool();
        let hub = Arc::new(Hub::new(
            pool.clone(),
            Arc::new(GeoIpService::new()),
            "secret".to_string(),
        ));
        let (_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Arc::new(Scheduler::new(
            pool,
            hub.clone(),
            Duration::from_secs(1),
            shutdown_rx,
        ));
        (scheduler, hub, dir)
    }

    async fn connect_fake_probe(hub: &Hub, probe_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(16);
        let (close_tx, _) = watch::channel(false);
        hub.register_session(probe_id, SessionHandle::new(hub.next_session_id(), tx, close_tx))
            .await;
        rx
    }

    #[tokio::test]
    async fn no_probes_leaves_the_task_pending() {
        let (scheduler, _hub, _dir) = test_scheduler();
        let mut task = test_task("t-1", "icmp_ping", TaskMode::Single);
        tasks::create_task(&scheduler.db, &task).await.unwrap();

        scheduler.assign_task(&mut task).await.unwrap();

        let loaded = tasks::get_task(&scheduler.db, "t-1").await.unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert!(tasks::list_executions_by_task(&scheduler.db, "t-1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn assignment_creates_a_running_execution_and_sends_a_frame() {
        let (scheduler, hub, _dir) = test_scheduler();
        probes::save_probe(&scheduler.db, &test_probe("p-1"))
            .await
            .unwrap();
        let mut rx = connect_fake_probe(&hub, "p-1").await;

        let mut task = test_task("t-1", "icmp_ping", TaskMode::Single);
        task.assigned_probes = vec!["p-1".to_string()];
        tasks::create_task(&scheduler.db, &task).await.unwrap();

        scheduler.assign_task(&mut task).await.unwrap();

        let frame = rx.recv().await.unwrap();
        let envelope = meridian_proto::Envelope::decode(&frame).unwrap();
        assert_eq!(envelope.msg_type, MSG_TASK_ASSIGN);
        assert_eq!(envelope.data["target"], "192.0.2.1");
        assert_eq!(envelope.data["timeout"], 300);

        let executions = tasks::list_executions_by_task(&scheduler.db, "t-1")
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Running);

        let loaded = tasks::get_task(&scheduler.db, "t-1").await.unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    async fn continuous_assignment_forces_count_of_one() {
        let (scheduler, hub, _dir) = test_scheduler();
        probes::save_probe(&scheduler.db, &test_probe("p-1"))
            .await
            .unwrap();
        let mut rx = connect_fake_probe(&hub, "p-1").await;

        let mut task = test_task("t-1", "icmp_ping", TaskMode::Continuous);
        task.assigned_probes = vec!["p-1".to_string()];
        task.parameters
            .insert("count".to_string(), Value::from(10));
        tasks::create_task(&scheduler.db, &task).await.unwrap();

        scheduler.assign_task(&mut task).await.unwrap();

        let frame = rx.recv().await.unwrap();
        let envelope = meridian_proto::Envelope::decode(&frame).unwrap();
        assert_eq!(envelope.data["parameters"]["count"], 1);
    }

    #[tokio::test]
    async fn auto_selection_filters_by_capability_and_caps_fanout() {
        let (scheduler, hub, _dir) = test_scheduler();

        for i in 0..5 {
            let mut probe = test_probe(&format!("icmp-{i}"));
            probe.capabilities = vec!["icmp_ping".to_string()];
            probes::save_probe(&scheduler.db, &probe).await.unwrap();
            let _rx = connect_fake_probe(&hub, &probe.probe_id).await;
        }
        let mut other = test_probe("dns-only");
        other.capabilities = vec!["dns_query".to_string()];
        probes::save_probe(&scheduler.db, &other).await.unwrap();
        let _rx = connect_fake_probe(&hub, "dns-only").await;

        let task = test_task("t-1", "icmp_ping", TaskMode::Single);
        let selected = scheduler.select_probes(&task).await.unwrap();
        assert_eq!(selected.len(), MAX_AUTO_SELECTED_PROBES);
        assert!(selected.iter().all(|p| p.probe_id.starts_with("icmp-")));
    }

    #[tokio::test]
    async fn wildcard_capability_matches_everything() {
        let (scheduler, hub, _dir) = test_scheduler();
        let mut probe = test_probe("p-all");
        probe.capabilities = vec!["all".to_string()];
        probes::save_probe(&scheduler.db, &probe).await.unwrap();
        let _rx = connect_fake_probe(&hub, "p-all").await;

        let task = test_task("t-1", "traceroute", TaskMode::Single);
        let selected = scheduler.select_probes(&task).await.unwrap();
        assert_eq!(selected.len(), 1);
    }

    #[tokio::test]
    async fn send_failure_marks_the_execution_failed() {
        let (scheduler, _hub, _dir) = test_scheduler();
        // Probe row exists and is fresh, but there is no live session, so
        // the scheduler's explicit-list path skips it. Simulate the race
        // where the session vanishes between selection and send by going
        // through auto-selection with a session that is gone: instead,
        // register then drop the receiver so try_send sees a closed channel.
        probes::save_probe(&scheduler.db, &test_probe("p-1"))
            .await
            .unwrap();
        let rx = connect_fake_probe(&scheduler.hub, "p-1").await;
        drop(rx);

        let mut task = test_task("t-1", "icmp_ping", TaskMode::Single);
        task.assigned_probes = vec!["p-1".to_string()];
        tasks::create_task(&scheduler.db, &task).await.unwrap();

        scheduler.assign_task(&mut task).await.unwrap();

        let executions = tasks::list_executions_by_task(&scheduler.db, "t-1")
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Failed);
        assert!(executions[0].completed_at.is_some());
        assert!(executions[0].error.is_some());
    }

    #[tokio::test]
    async fn schedule_advances_and_completes_at_the_bound() {
        let (scheduler, _hub, _dir) = test_scheduler();
        let mut task = test_task("t-1", "icmp_ping", TaskMode::Continuous);
        task.schedule = Some(ScheduleState {
            run_count: 0,
            interval_seconds: 1,
            max_runs: Some(3),
        });
        task.next_run_at = Some(Utc::now());
        tasks::create_task(&scheduler.db, &task).await.unwrap();

        for expected in 1..=2u32 {
            scheduler.advance_schedule(&mut task).await.unwrap();
            let loaded = tasks::get_task(&scheduler.db, "t-1").await.unwrap();
            assert_eq!(loaded.schedule.as_ref().unwrap().run_count, expected);
            assert!(loaded.next_run_at.is_some());
            assert_eq!(loaded.status, TaskStatus::Pending);
        }

        scheduler.advance_schedule(&mut task).await.unwrap();
        let loaded = tasks::get_task(&scheduler.db, "t-1").await.unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.schedule.as_ref().unwrap().run_count, 3);
        assert!(loaded.next_run_at.is_none());
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn config_overrides_the_default_bound_but_not_an_explicit_one() {
        let (scheduler, _hub, _dir) = test_scheduler();
        results::set_config(&scheduler.db, "ping_max_runs", "2")
            .await
            .unwrap();

        // No explicit bound: the config key applies.
        let mut task = test_task("t-cfg", "icmp_ping", TaskMode::Continuous);
        tasks::create_task(&scheduler.db, &task).await.unwrap();
        scheduler.advance_schedule(&mut task).await.unwrap();
        scheduler.advance_schedule(&mut task).await.unwrap();
        assert_eq!(
            tasks::get_task(&scheduler.db, "t-cfg").await.unwrap().status,
            TaskStatus::Completed
        );

        // Explicit bound: config must not shrink it.
        let mut task = test_task("t-explicit", "icmp_ping", TaskMode::Continuous);
        task.schedule = Some(ScheduleState {
            run_count: 0,
            interval_seconds: 1,
            max_runs: Some(5),
        });
        tasks::create_task(&scheduler.db, &task).await.unwrap();
        scheduler.advance_schedule(&mut task).await.unwrap();
        scheduler.advance_schedule(&mut task).await.unwrap();
        let loaded = tasks::get_task(&scheduler.db, "t-explicit").await.unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.schedule.unwrap().run_count, 2);
    }

    #[tokio::test]
    async fn cancel_sweeps_open_executions_and_is_idempotent() {
        let (scheduler, _hub, _dir) = test_scheduler();

        let mut task = test_task("t-1", "icmp_ping", TaskMode::Single);
        task.status = TaskStatus::Running;
        tasks::create_task(&scheduler.db, &task).await.unwrap();

        let mut running = crate::db::tasks::test_execution("e-1", "t-1", "dead-probe");
        running.status = ExecutionStatus::Running;
        tasks::save_execution(&scheduler.db, &running).await.unwrap();

        // The probe is offline, so the cancel frame fails; the sweep must
        // still terminate the execution.
        scheduler.cancel_task("t-1").await.unwrap();
        scheduler.cancel_task("t-1").await.unwrap();

        let loaded = tasks::get_task(&scheduler.db, "t-1").await.unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelled);
        assert!(loaded.completed_at.is_some());

        let executions = tasks::list_executions_by_task(&scheduler.db, "t-1")
            .await
            .unwrap();
        assert_eq!(executions[0].status, ExecutionStatus::Cancelled);
        assert!(executions[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn traceroute_timeout_override_applies() {
        let (scheduler, _hub, _dir) = test_scheduler();
        assert_eq!(scheduler.effective_timeout("traceroute").await, 300);

        results::set_config(&scheduler.db, "traceroute_timeout_seconds", "60")
            .await
            .unwrap();
        assert_eq!(scheduler.effective_timeout("traceroute").await, 60);
        assert_eq!(scheduler.effective_timeout("icmp_ping").await, 300);

        results::set_config(&scheduler.db, "task_timeout", "120")
            .await
            .unwrap();
        assert_eq!(scheduler.effective_timeout("icmp_ping").await, 120);
    }
}
