use std::{path::PathBuf, sync::Arc};

use anyhow::bail;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use distmr::mr::{
    coordinator::{Coordinator, JobConfig, RPC_PORT},
    executor::{MapFunc, ReduceFunc},
    function::wc,
    worker::{run_workers, FaultPlan, Worker},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Master,
    Worker,
}

/// Distributed MapReduce runtime: run the job master or a worker.
#[derive(Debug, Parser)]
#[command(name = "distmr")]
struct Args {
    /// Role of this process.
    #[arg(long, value_enum)]
    mode: Mode,

    /// Comma-separated input files for the job (master only).
    #[arg(long, value_delimiter = ',')]
    files: Vec<PathBuf>,

    /// Number of reduce partitions (master only).
    #[arg(long, default_value_t = 3)]
    n_reduce: usize,

    /// Coordinator endpoint to dial (worker only).
    #[arg(long, default_value = "localhost:1234")]
    master: String,

    /// Number of in-process workers to launch alongside the master.
    #[arg(long, default_value_t = 0)]
    n_workers: usize,

    /// Job name; used as a component of every file the job writes.
    #[arg(long, default_value = "wordcount")]
    job: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let map_f: MapFunc = Arc::new(wc::map);
    let reduce_f: ReduceFunc = Arc::new(wc::reduce);

    match args.mode {
        Mode::Master => run_master(args, map_f, reduce_f).await,
        Mode::Worker => {
            let id = format!("worker-{}", std::process::id());
            Worker::new(id, map_f, reduce_f).run(args.master).await
        }
    }
}

async fn run_master(args: Args, map_f: MapFunc, reduce_f: ReduceFunc) -> anyhow::Result<()> {
    if args.files.is_empty() {
        bail!("master mode needs at least one input file (--files)");
    }
    if args.n_reduce == 0 {
        bail!("--n-reduce must be positive");
    }
    if args.job.is_empty()
        || !args.job.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("--job must be a non-empty filesystem-safe name");
    }

    let coordinator = Coordinator::new(JobConfig::new(args.job, args.files, args.n_reduce));
    coordinator.listen(("0.0.0.0", RPC_PORT)).await?;

    let workers = if args.n_workers > 0 {
        run_workers(
            format!("127.0.0.1:{RPC_PORT}"),
            args.n_workers,
            map_f,
            reduce_f,
            FaultPlan::disabled(),
            PathBuf::from("."),
        )
    } else {
        Vec::new()
    };

    coordinator.wait().await;
    let answer = coordinator.merge_output().await?;
    coordinator.clean_intermediates();
    for handle in workers {
        handle.abort();
    }
    info!("job finished; answer at {}", answer.display());
    Ok(())
}
