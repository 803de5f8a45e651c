//! Full-job scenarios: real RPC over loopback where scheduling matters, and
//! direct executor runs where only the data path is under test.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use distmr::mr::{
    coordinator::{Coordinator, JobConfig},
    executor::{self, MapFunc, ReduceFunc},
    function::wc,
    layout,
    worker::{run_workers, FaultPlan, Worker},
};
use tokio::time::timeout;

fn wc_funcs() -> (MapFunc, ReduceFunc) {
    (Arc::new(wc::map), Arc::new(wc::reduce))
}

async fn wait_done(coordinator: &Coordinator) {
    timeout(Duration::from_secs(30), async {
        while !coordinator.done() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("job did not complete in time");
}

#[tokio::test]
async fn single_map_single_reduce_counts_words() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input.txt");
    tokio::fs::write(&input, "a\nb\na\n").await?;

    let config = JobConfig::new("wc1", vec![input], 1).with_dir(dir.path());
    let coordinator = Coordinator::new(config);
    let addr = coordinator.listen("127.0.0.1:0").await?;

    let (map_f, reduce_f) = wc_funcs();
    let workers = run_workers(
        addr.to_string(),
        2,
        map_f,
        reduce_f,
        FaultPlan::disabled(),
        dir.path().to_path_buf(),
    );

    wait_done(&coordinator).await;
    let answer = coordinator.merge_output().await?;
    for handle in workers {
        handle.abort();
    }

    let body = tokio::fs::read_to_string(&answer).await?;
    assert_eq!(body, "{\"Key\":\"a\",\"Value\":\"2\"}\n{\"Key\":\"b\",\"Value\":\"1\"}\n");
    assert_eq!(coordinator.completed(), coordinator.total_tasks());
    Ok(())
}

#[tokio::test]
async fn crashed_worker_is_replaced_after_timeout() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input.txt");
    tokio::fs::write(&input, "x x y\n").await?;

    let config = JobConfig::new("wc-crash", vec![input], 1)
        .with_dir(dir.path())
        .with_task_timeout(Duration::from_millis(300));
    let coordinator = Coordinator::new(config);
    let addr = coordinator.listen("127.0.0.1:0").await?;

    // This worker claims the map task and exits without reporting.
    let (map_f, reduce_f) = wc_funcs();
    let crashing = Worker::new("worker-crash", map_f.clone(), reduce_f.clone())
        .with_dir(dir.path())
        .with_faults(FaultPlan {
            crash_probability: 1.0,
            delay_probability: 0.0,
            delay: Duration::ZERO,
        });
    crashing.run(addr).await?;
    assert_eq!(coordinator.completed(), 0);

    // A healthy worker picks the task up once the timeout sweep fires.
    let workers = run_workers(
        addr.to_string(),
        1,
        map_f,
        reduce_f,
        FaultPlan::disabled(),
        dir.path().to_path_buf(),
    );
    wait_done(&coordinator).await;
    let answer = coordinator.merge_output().await?;
    for handle in workers {
        handle.abort();
    }

    let body = tokio::fs::read_to_string(&answer).await?;
    assert_eq!(body, "{\"Key\":\"x\",\"Value\":\"2\"}\n{\"Key\":\"y\",\"Value\":\"1\"}\n");
    Ok(())
}

#[tokio::test]
async fn partitions_cover_every_key_exactly_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let inputs = ["x x y", "y z"];
    let n_reduce = 2;
    let (map_f, reduce_f) = wc_funcs();

    for (m, contents) in inputs.iter().enumerate() {
        let path = dir.path().join(format!("in-{m}.txt"));
        tokio::fs::write(&path, contents).await?;
        executor::run_map(dir.path(), "wc2", m, path.to_str().unwrap(), n_reduce, &map_f).await?;
    }
    for r in 0..n_reduce {
        executor::run_reduce(dir.path(), "wc2", r, inputs.len(), &reduce_f).await?;
    }

    // Each key lands in exactly the partition the shared hash assigns it, and
    // the union of the per-partition outputs is the whole word count.
    let mut seen = HashMap::new();
    for r in 0..n_reduce {
        let body = tokio::fs::read_to_string(dir.path().join(layout::merge_name("wc2", r))).await?;
        for line in body.lines() {
            let record: layout::KeyValue = serde_json::from_str(line)?;
            assert_eq!(layout::partition(&record.key, n_reduce), r);
            assert!(seen.insert(record.key, record.value).is_none());
        }
    }
    let expected: HashMap<String, String> = [("x", "2"), ("y", "2"), ("z", "1")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    assert_eq!(seen, expected);
    Ok(())
}

#[tokio::test]
async fn two_runs_produce_identical_answers() -> Result<()> {
    let (map_f, reduce_f) = wc_funcs();
    let mut answers = Vec::new();
    for _ in 0..2 {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("in.txt");
        tokio::fs::write(&path, "the quick brown fox the lazy dog the end").await?;
        executor::run_map(dir.path(), "det", 0, path.to_str().unwrap(), 3, &map_f).await?;
        let mut sources = Vec::new();
        for r in 0..3 {
            executor::run_reduce(dir.path(), "det", r, 1, &reduce_f).await?;
            sources.push(dir.path().join(layout::merge_name("det", r)));
        }
        let answer = dir.path().join(layout::ans_name("det"));
        layout::concat_files(&answer, &sources).await?;
        answers.push(tokio::fs::read_to_string(&answer).await?);
    }
    assert_eq!(answers[0], answers[1]);
    Ok(())
}

#[tokio::test]
async fn empty_input_produces_empty_outputs() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("empty.txt");
    tokio::fs::write(&input, "").await?;
    let n_reduce = 3;
    let (map_f, reduce_f) = wc_funcs();

    executor::run_map(dir.path(), "wc3", 0, input.to_str().unwrap(), n_reduce, &map_f).await?;
    for r in 0..n_reduce {
        let intermediate = dir.path().join(layout::reduce_name("wc3", 0, r));
        assert_eq!(tokio::fs::read_to_string(&intermediate).await?, "");
        executor::run_reduce(dir.path(), "wc3", r, 1, &reduce_f).await?;
        assert_eq!(
            tokio::fs::read_to_string(dir.path().join(layout::merge_name("wc3", r))).await?,
            ""
        );
    }

    let sources: Vec<PathBuf> = (0..n_reduce)
        .map(|r| dir.path().join(layout::merge_name("wc3", r)))
        .collect();
    let answer = dir.path().join(layout::ans_name("wc3"));
    layout::concat_files(&answer, &sources).await?;
    assert_eq!(tokio::fs::read_to_string(&answer).await?, "");
    Ok(())
}
