//! The worker side of the runtime: a long-running client that pulls one task
//! at a time from the coordinator, executes it, and reports back. Workers
//! never stop on their own; the launcher aborts them when the job is done.

use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use tarpc::{client, context, tokio_serde::formats::Json};
use tokio::{task::JoinHandle, time::sleep};
use tracing::{info, warn};

use crate::mr::{
    coordinator::{ServerClient, Task, TaskKind},
    executor::{self, MapFunc, ReduceFunc},
};

/// How long an idle worker sleeps before asking for a task again.
const BACKOFF: Duration = Duration::from_secs(1);

/// Fault-injection knobs for exercising timeout recovery.
#[derive(Debug, Clone, Copy)]
pub struct FaultPlan {
    /// Chance of exiting without reporting, per claimed task.
    pub crash_probability: f64,
    /// Chance of sleeping `delay` before executing, per claimed task.
    pub delay_probability: f64,
    pub delay: Duration,
}

impl Default for FaultPlan {
    fn default() -> Self {
        Self {
            crash_probability: 0.1,
            delay_probability: 0.2,
            delay: Duration::from_secs(5),
        }
    }
}

impl FaultPlan {
    pub fn disabled() -> Self {
        Self {
            crash_probability: 0.0,
            delay_probability: 0.0,
            delay: Duration::ZERO,
        }
    }

    fn roll_crash(&self) -> bool {
        self.crash_probability > 0.0 && rand::random::<f64>() < self.crash_probability
    }

    fn roll_delay(&self) -> bool {
        self.delay_probability > 0.0 && rand::random::<f64>() < self.delay_probability
    }
}

/// A pull-model task runner. One worker executes one task at a time.
pub struct Worker {
    id: String,
    dir: PathBuf,
    map_f: MapFunc,
    reduce_f: ReduceFunc,
    faults: FaultPlan,
}

impl Worker {
    pub fn new(id: impl Into<String>, map_f: MapFunc, reduce_f: ReduceFunc) -> Self {
        Self {
            id: id.into(),
            dir: PathBuf::from("."),
            map_f,
            reduce_f,
            faults: FaultPlan::disabled(),
        }
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    /// Dial the coordinator and pull tasks until externally stopped. Returns
    /// `Ok` only when a crash injection fires; any real failure is an error,
    /// and the abandoned task is recovered by the coordinator's timeout sweep.
    pub async fn run<A: tokio::net::ToSocketAddrs>(self, addr: A) -> anyhow::Result<()> {
        let transport = tarpc::serde_transport::tcp::connect(addr, Json::default)
            .await
            .context("dialing coordinator")?;
        let client = ServerClient::new(client::Config::default(), transport).spawn();
        info!("worker {} connected", self.id);

        loop {
            let task = client
                .get_task(context::current(), self.id.clone())
                .await
                .context("get_task call failed")?;
            let Some(task) = task else {
                sleep(BACKOFF).await;
                continue;
            };

            if self.faults.roll_crash() {
                warn!("worker {} simulating crash on task {}", self.id, task.task_id);
                return Ok(());
            }
            if self.faults.roll_delay() {
                warn!("worker {} simulating delay on task {}", self.id, task.task_id);
                sleep(self.faults.delay).await;
            }

            let task_id = task.task_id;
            self.execute(&task).await?;
            client
                .report_task_done(context::current(), task_id, self.id.clone())
                .await
                .context("report_task_done call failed")?;
        }
    }

    async fn execute(&self, task: &Task) -> anyhow::Result<()> {
        match task.kind {
            TaskKind::Map => {
                executor::run_map(
                    &self.dir,
                    &task.job_name,
                    task.map_index,
                    &task.input_file,
                    task.n_reduce,
                    &self.map_f,
                )
                .await
            }
            TaskKind::Reduce => {
                executor::run_reduce(
                    &self.dir,
                    &task.job_name,
                    task.reduce_index,
                    task.n_map,
                    &self.reduce_f,
                )
                .await
            }
        }
    }
}

/// Launch `n` workers against `addr` under ids `worker-0 … worker-(n-1)`.
/// The returned handles let the caller abort the fleet once the job is done.
pub fn run_workers(
    addr: String,
    n: usize,
    map_f: MapFunc,
    reduce_f: ReduceFunc,
    faults: FaultPlan,
    dir: PathBuf,
) -> Vec<JoinHandle<anyhow::Result<()>>> {
    (0..n)
        .map(|i| {
            let id = format!("worker-{i}");
            let worker = Worker::new(id.clone(), map_f.clone(), reduce_f.clone())
                .with_dir(dir.clone())
                .with_faults(faults);
            let addr = addr.clone();
            tokio::spawn(async move {
                let result = worker.run(addr).await;
                if let Err(err) = &result {
                    warn!("{id} exited with error: {err:#}");
                }
                result
            })
        })
        .collect()
}
