//! The coordinator owns the task table for one job, serves the two-operation
//! RPC surface workers pull from, and merges the final answer once every task
//! has completed. All mutation happens under a single lock.

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::Context as _;
use futures::{
    future::{ready, Ready},
    StreamExt,
};
use serde::{Deserialize, Serialize};
use tarpc::{
    context,
    server::{incoming::Incoming, BaseChannel},
    tokio_serde::formats::Json,
};
use tracing::{debug, info};

use crate::mr::layout;

/// TCP port the coordinator serves RPC on by default.
pub const RPC_PORT: u16 = 1234;

/// How long a task may stay in progress before the sweep takes it back.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval at which `wait` polls the completion counter.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Everything fixed about a job for the lifetime of its coordinator.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Short identifier used as a component of every file the job writes.
    pub job_name: String,
    /// One map task per input file.
    pub input_files: Vec<PathBuf>,
    pub n_reduce: usize,
    pub task_timeout: Duration,
    /// Directory all job files live in.
    pub dir: PathBuf,
}

impl JobConfig {
    pub fn new(job_name: impl Into<String>, input_files: Vec<PathBuf>, n_reduce: usize) -> Self {
        Self {
            job_name: job_name.into(),
            input_files,
            n_reduce,
            task_timeout: TASK_TIMEOUT,
            dir: PathBuf::from("."),
        }
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Map,
    Reduce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

/// A map or reduce task as handed to workers. Map tasks get ids
/// `0..n_map`, reduce tasks `n_map..n_map + n_reduce`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub kind: TaskKind,
    pub task_id: usize,
    pub job_name: String,
    /// Input file path for map tasks; a human-readable label for reduce tasks.
    pub input_file: String,
    pub map_index: usize,
    pub reduce_index: usize,
    pub n_map: usize,
    pub n_reduce: usize,
    pub status: TaskStatus,
    pub assigned_worker: Option<String>,
    /// Moment of the last pending to in-progress transition. Coordinator-local.
    #[serde(skip)]
    pub started_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Working,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub name: String,
    pub status: WorkerStatus,
}

/// Point-in-time view of the job for read-only consumers such as a dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub workers: Vec<WorkerInfo>,
    pub tasks: Vec<Task>,
    /// Completed share of all tasks, in percent.
    pub progress: f64,
}

#[derive(Debug)]
struct State {
    tasks: Vec<Task>,
    /// Known workers and whether they currently hold a task. Workers the
    /// coordinator has never heard from are implicitly idle.
    workers: HashMap<String, WorkerStatus>,
    completed: usize,
}

/// Tracks every task of one job and hands them out over RPC. Handles are
/// cheap clones sharing the same state.
#[derive(Debug, Clone)]
pub struct Coordinator {
    config: JobConfig,
    n_map: usize,
    total: usize,
    state: Arc<Mutex<State>>,
}

impl Coordinator {
    /// Build the task table for a job: map tasks first, then reduce tasks,
    /// all pending.
    pub fn new(config: JobConfig) -> Self {
        let n_map = config.input_files.len();
        let n_reduce = config.n_reduce;
        let mut tasks = Vec::with_capacity(n_map + n_reduce);
        for (map_index, input_file) in config.input_files.iter().enumerate() {
            tasks.push(Task {
                kind: TaskKind::Map,
                task_id: map_index,
                job_name: config.job_name.clone(),
                input_file: input_file.display().to_string(),
                map_index,
                reduce_index: 0,
                n_map,
                n_reduce,
                status: TaskStatus::Pending,
                assigned_worker: None,
                started_at: None,
            });
        }
        for reduce_index in 0..n_reduce {
            tasks.push(Task {
                kind: TaskKind::Reduce,
                task_id: n_map + reduce_index,
                job_name: config.job_name.clone(),
                input_file: format!("reduce-{reduce_index}"),
                map_index: 0,
                reduce_index,
                n_map,
                n_reduce,
                status: TaskStatus::Pending,
                assigned_worker: None,
                started_at: None,
            });
        }
        Self {
            n_map,
            total: n_map + n_reduce,
            state: Arc::new(Mutex::new(State {
                tasks,
                workers: HashMap::new(),
                completed: 0,
            })),
            config,
        }
    }

    /// Claim the first assignable pending task for `worker_id`, sweeping
    /// timed-out tasks back to pending first. `None` means nothing can be
    /// handed out right now and the worker should back off.
    pub fn assign_task(&self, worker_id: &str) -> Option<Task> {
        self.assign_task_at(worker_id, Instant::now())
    }

    fn assign_task_at(&self, worker_id: &str, now: Instant) -> Option<Task> {
        let mut state = self.state.lock().unwrap();

        // Revoke stragglers before scanning; their eventual reports will be
        // rejected by the assigned-worker check in complete_task.
        for task in &mut state.tasks {
            if task.status == TaskStatus::InProgress {
                let expired = task
                    .started_at
                    .map_or(true, |started| now.duration_since(started) > self.config.task_timeout);
                if expired {
                    info!("task {} timed out, reassigning", task.task_id);
                    task.status = TaskStatus::Pending;
                    task.assigned_worker = None;
                    task.started_at = None;
                }
            }
        }

        // Reduce tasks are gated on the whole map phase; table order makes the
        // scan prefer map tasks and lower indices deterministically.
        let all_maps_done = state.tasks[..self.n_map]
            .iter()
            .all(|task| task.status == TaskStatus::Completed);

        for index in 0..state.tasks.len() {
            let task = &state.tasks[index];
            if task.status != TaskStatus::Pending {
                continue;
            }
            if task.kind == TaskKind::Reduce && !all_maps_done {
                continue;
            }
            let task = &mut state.tasks[index];
            task.status = TaskStatus::InProgress;
            task.assigned_worker = Some(worker_id.to_string());
            task.started_at = Some(now);
            let claimed = task.clone();
            state.workers.insert(worker_id.to_string(), WorkerStatus::Working);
            debug!("assigned task {} ({:?}) to {}", claimed.task_id, claimed.kind, worker_id);
            return Some(claimed);
        }
        None
    }

    /// Mark `task_id` completed, but only if it is in progress and still
    /// assigned to `worker_id`. Any other report (unknown id, wrong worker,
    /// or one arriving after a timeout reassignment) is a silent no-op.
    pub fn complete_task(&self, task_id: usize, worker_id: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(index) = state.tasks.iter().position(|task| task.task_id == task_id) else {
            debug!("report for unknown task {task_id} from {worker_id}");
            return;
        };
        let task = &state.tasks[index];
        if task.status != TaskStatus::InProgress || task.assigned_worker.as_deref() != Some(worker_id) {
            debug!("dropping report for task {task_id} from {worker_id}");
            return;
        }
        let task = &mut state.tasks[index];
        task.status = TaskStatus::Completed;
        task.assigned_worker = None;
        task.started_at = None;
        state.completed += 1;
        state.workers.insert(worker_id.to_string(), WorkerStatus::Idle);
        info!("task {} completed by {} ({}/{})", task_id, worker_id, state.completed, self.total);
    }

    /// Number of tasks that have reached `completed`. Never decreases.
    pub fn completed(&self) -> usize {
        self.state.lock().unwrap().completed
    }

    pub fn total_tasks(&self) -> usize {
        self.total
    }

    pub fn done(&self) -> bool {
        self.completed() == self.total
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Consistent view of workers, tasks, and progress, taken under the lock.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock().unwrap();
        let workers = state
            .workers
            .iter()
            .map(|(name, status)| WorkerInfo {
                name: name.clone(),
                status: *status,
            })
            .collect();
        let progress = if self.total == 0 {
            0.0
        } else {
            state.completed as f64 / self.total as f64 * 100.0
        };
        Snapshot {
            workers,
            tasks: state.tasks.clone(),
            progress,
        }
    }

    /// Block until every task has completed, polling at a coarse interval.
    pub async fn wait(&self) {
        while !self.done() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Concatenate the per-partition outputs into the final answer file, in
    /// partition order. Call after `wait`.
    pub async fn merge_output(&self) -> anyhow::Result<PathBuf> {
        let dir = &self.config.dir;
        let sources: Vec<PathBuf> = (0..self.config.n_reduce)
            .map(|r| dir.join(layout::merge_name(&self.config.job_name, r)))
            .collect();
        let dst = dir.join(layout::ans_name(&self.config.job_name));
        layout::concat_files(&dst, &sources)
            .await
            .context("merging job output")?;
        info!("final answer written to {}", dst.display());
        Ok(dst)
    }

    /// Remove the job's intermediate and per-partition files, keeping the
    /// final answer.
    pub fn clean_intermediates(&self) {
        layout::clean_intermediates(&self.config.dir, &self.config.job_name, self.n_map, self.config.n_reduce);
    }

    /// Bind the RPC endpoint and serve `get_task`/`report_task_done` in the
    /// background. Returns the bound address, so callers may bind port 0.
    pub async fn listen<A: tokio::net::ToSocketAddrs>(&self, addr: A) -> anyhow::Result<SocketAddr> {
        let listener = tarpc::serde_transport::tcp::listen(addr, Json::default)
            .await
            .context("binding coordinator RPC endpoint")?;
        let local_addr = listener.local_addr();
        let server = self.clone();
        tokio::spawn(
            listener
                // Accepts valid connections, drops the rest.
                .filter_map(|r| async { r.ok() })
                .map(BaseChannel::with_defaults)
                .execute(server.serve()),
        );
        info!("coordinator serving on {local_addr}");
        Ok(local_addr)
    }
}

/// The coordinator's RPC surface: workers pull tasks and report completions.
#[tarpc::service]
pub trait Server {
    /// Claim a task, if one is assignable. `None` means back off and retry.
    async fn get_task(worker_id: String) -> Option<Task>;
    /// Report a finished task. Late or mismatched reports are ignored.
    async fn report_task_done(task_id: usize, worker_id: String);
}

#[tarpc::server]
impl Server for Coordinator {
    type GetTaskFut = Ready<Option<Task>>;
    type ReportTaskDoneFut = Ready<()>;

    fn get_task(self, _: context::Context, worker_id: String) -> Self::GetTaskFut {
        ready(self.assign_task(&worker_id))
    }

    fn report_task_done(self, _: context::Context, task_id: usize, worker_id: String) -> Self::ReportTaskDoneFut {
        self.complete_task(task_id, &worker_id);
        ready(())
    }
}
