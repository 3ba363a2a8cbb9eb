//! Waiting on server-side tasks.
//!
//! Every task is submitted before tracking starts. The tracker then polls the
//! `info` property of each pending task on a fixed interval, keeps one status
//! line up to date while anything is running and collects one outcome per
//! task. A task that fails never stops the others from being watched.

use std::time::Duration;
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use crate::vim::{ApiError, Connection, ManagedObjectRef, TaskInfo, TaskState};
use super::commands::CommandError;
use super::console::Console;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackOptions {
    pub poll_interval: Duration,
    /// `None` waits forever
    pub timeout: Option<Duration>,
}

impl Default for TrackOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

/// A task handle, or the fault that kept it from being created
pub struct Submission {
    pub label: String,
    pub connection: Connection,
    pub task: Result<ManagedObjectRef, ApiError>,
}

impl Submission {
    pub fn new(label: impl Into<String>, connection: Connection, task: Result<ManagedObjectRef, ApiError>) -> Self {
        Self {
            label: label.into(),
            connection,
            task,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub label: String,
    /// `Ok(task result)` or the fault message
    pub result: Result<Option<Value>, String>,
}

impl TaskOutcome {
    pub fn line(&self) -> String {
        match &self.result {
            Ok(_) => format!("{}: success", self.label),
            Err(message) => format!("{}: error: {}", self.label, message),
        }
    }
}

/// Outcomes in submission order
#[derive(Debug, Clone, Default)]
pub struct ProgressReport {
    outcomes: Vec<TaskOutcome>,
}

impl ProgressReport {
    pub fn outcomes(&self) -> &[TaskOutcome] {
        &self.outcomes
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }

    /// One line per task
    pub fn render(&self) -> String {
        self.outcomes.iter().map(|o| format!("{}\n", o.line())).collect()
    }

    /// `TaskFailed` when any task failed, carrying every outcome
    pub fn into_result(self) -> Result<ProgressReport, CommandError> {
        match self.failures() {
            0 => Ok(self),
            failed => Err(CommandError::TaskFailed {
                report: self.render(),
                failed,
                total: self.outcomes.len(),
            }),
        }
    }
}

struct Pending {
    index: usize,
    connection: Connection,
    task: ManagedObjectRef,
}

/// Poll until every submitted task reached a terminal state
pub async fn track(console: &Console, submissions: Vec<Submission>, options: &TrackOptions) -> Result<ProgressReport, CommandError> {
    let total = submissions.len();
    let labels: Vec<String> = submissions.iter().map(|s| s.label.clone()).collect();
    let mut results: Vec<Option<Result<Option<Value>, String>>> = vec![None; total];
    let mut pending = Vec::new();

    for (index, submission) in submissions.into_iter().enumerate() {
        match submission.task {
            Ok(task) => pending.push(Pending { index, connection: submission.connection, task }),
            Err(e) => {
                log::debug!("{}: task was not created: {}", submission.label, e);
                results[index] = Some(Err(e.to_string()));
            }
        }
    }

    let wait = async {
        let mut ticker = tokio::time::interval(options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !pending.is_empty() {
            ticker.tick().await;
            let mut running = Vec::new();
            let mut still_pending = Vec::new();
            for p in pending.drain(..) {
                match p.connection.get_as::<TaskInfo>(&p.task, "info").await {
                    Ok(info) => match info.state {
                        TaskState::Success => results[p.index] = Some(Ok(info.result)),
                        TaskState::Error => {
                            let message = info.error.map(|e| e.describe()).unwrap_or_else(|| "unknown fault".to_string());
                            results[p.index] = Some(Err(message));
                        }
                        TaskState::Queued | TaskState::Running => {
                            running.push(format!("{} {}%", labels[p.index], info.progress.unwrap_or(0)));
                            still_pending.push(p);
                        }
                    },
                    Err(e) => results[p.index] = Some(Err(e.to_string())),
                }
            }
            pending = still_pending;
            console.status(&format!("{}/{} {}", total - pending.len(), total, running.join(", ")));
        }
    };

    let finished = match options.timeout {
        Some(limit) => tokio::time::timeout(limit, wait).await.is_ok(),
        None => {
            wait.await;
            true
        }
    };
    console.clear_status();

    let outcomes: Vec<TaskOutcome> = labels.into_iter().zip(results)
        .filter_map(|(label, result)| result.map(|result| TaskOutcome { label, result }))
        .collect();
    if !finished {
        let waiting = total - outcomes.len();
        return Err(CommandError::Timeout(format!("Timed out waiting for {} of {} tasks", waiting, total)));
    }
    Ok(ProgressReport { outcomes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use serde_json::json;
    use crate::vim::simulator::Simulator;
    use crate::shell::console::ScriptedPrompter;

    fn console() -> Console {
        Console::detached(Arc::new(ScriptedPrompter::default()))
    }

    #[tokio::test]
    async fn test_one_failure_still_reports_every_task() {
        let sim = Arc::new(Simulator::new());
        let dc = sim.add_datacenter("lab");
        let host = sim.add_host(&dc, "esx1");
        let vms: Vec<ManagedObjectRef> = (0..3).map(|i| sim.add_vm(&dc, &host, &format!("vm{}", i), "poweredOff")).collect();
        sim.fail_task(&vms[1], "PowerOnVM_Task", "Insufficient resources");
        let conn = Connection::new("vc", sim.clone());

        let mut submissions = Vec::new();
        for (i, vm) in vms.iter().enumerate() {
            let task = conn.call_task(vm, "PowerOnVM_Task", json!({})).await;
            submissions.push(Submission::new(format!("vm{}", i), conn.clone(), task));
        }
        let report = track(&console(), submissions, &TrackOptions::default()).await.unwrap();
        assert_eq!(report.outcomes().len(), 3);
        assert_eq!(report.failures(), 1);
        assert_eq!(report.render(), "vm0: success\nvm1: error: Insufficient resources\nvm2: success\n");

        match report.into_result() {
            Err(CommandError::TaskFailed { report, failed, total }) => {
                assert_eq!((failed, total), (1, 3));
                assert!(report.contains("vm2: success"));
            }
            other => panic!("unexpected {:?}", other.map(|r| r.render())),
        }
    }

    #[tokio::test]
    async fn test_submission_fault_is_an_outcome() {
        let sim = Arc::new(Simulator::new());
        let dc = sim.add_datacenter("lab");
        let host = sim.add_host(&dc, "esx1");
        let vm = sim.add_vm(&dc, &host, "vm0", "poweredOn");
        sim.fail_call(&vm, "ResetVM_Task", "NoPermission", "Permission denied");
        let conn = Connection::new("vc", sim.clone());

        let task = conn.call_task(&vm, "ResetVM_Task", json!({})).await;
        let report = track(&console(), vec![Submission::new("vm0", conn, task)], &TrackOptions::default()).await.unwrap();
        assert_eq!(report.render(), "vm0: error: NoPermission: Permission denied\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_task_times_out() {
        let sim = Arc::new(Simulator::new());
        let dc = sim.add_datacenter("lab");
        let host = sim.add_host(&dc, "esx1");
        let vm = sim.add_vm(&dc, &host, "vm0", "poweredOff");
        let conn = Connection::new("vc", sim.clone());
        let task = conn.call_task(&vm, "PowerOnVM_Task", json!({})).await.unwrap();
        sim.set_property(&task, "info", json!({"state": "running", "progress": 40}));

        let options = TrackOptions {
            poll_interval: Duration::from_secs(1),
            timeout: Some(Duration::from_secs(5)),
        };
        let err = track(&console(), vec![Submission::new("vm0", conn, Ok(task))], &options).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)));
        assert_eq!(err.to_string(), "Timed out waiting for 1 of 1 tasks");
    }
}
