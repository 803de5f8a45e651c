//! Worker-side execution of a single map or reduce task. The executor only
//! sees task fields and the user's callables; all scheduling lives with the
//! coordinator.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use crate::mr::layout::{self, KeyValue};

/// User-supplied map function: `(input file name, contents)` to records.
pub type MapFunc = Arc<dyn Fn(&str, &str) -> Vec<KeyValue> + Send + Sync>;

/// User-supplied reduce function: a key and every value seen for it.
pub type ReduceFunc = Arc<dyn Fn(&str, &[String]) -> String + Send + Sync>;

/// Write `contents` under `name` in `dir` through a randomized temporary file
/// and a rename, so two attempts at the same task never interleave within a
/// file and readers only ever observe one complete attempt.
async fn write_atomic(dir: &Path, name: &str, contents: &str) -> anyhow::Result<()> {
    let tmp_name = format!("{name}.tmp-{:08x}", rand::random::<u32>());
    let tmp = dir.join(&tmp_name);
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, dir.join(name))
        .await
        .with_context(|| format!("renaming {tmp_name} to {name}"))?;
    Ok(())
}

/// Run one map task: read the input file, apply `map_f`, and write one
/// intermediate file per reduce partition. Every partition gets a file, even
/// an empty one.
pub async fn run_map(
    dir: &Path,
    job: &str,
    map_index: usize,
    input_file: &str,
    n_reduce: usize,
    map_f: &MapFunc,
) -> anyhow::Result<()> {
    let contents = tokio::fs::read_to_string(input_file)
        .await
        .with_context(|| format!("reading map input {input_file}"))?;
    let records = map_f(input_file, &contents);
    debug!("map {map_index}: {} records from {input_file}", records.len());

    let mut buckets: Vec<Vec<KeyValue>> = vec![Vec::new(); n_reduce];
    for record in records {
        let r = layout::partition(&record.key, n_reduce);
        buckets[r].push(record);
    }
    for (r, bucket) in buckets.iter().enumerate() {
        let body = layout::encode_records(bucket)?;
        write_atomic(dir, &layout::reduce_name(job, map_index, r), &body).await?;
    }
    Ok(())
}

/// Run one reduce task: decode this partition's slice of every map output,
/// group values by key, and write the reduced records sorted by key.
pub async fn run_reduce(
    dir: &Path,
    job: &str,
    reduce_index: usize,
    n_map: usize,
    reduce_f: &ReduceFunc,
) -> anyhow::Result<()> {
    // Keys iterate in lexicographic order; values keep their insertion order
    // within a key.
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for m in 0..n_map {
        let name = layout::reduce_name(job, m, reduce_index);
        let contents = tokio::fs::read_to_string(dir.join(&name))
            .await
            .with_context(|| format!("reading intermediate {name}"))?;
        for record in layout::decode_records(&contents)? {
            groups.entry(record.key).or_default().push(record.value);
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for (key, values) in &groups {
        out.push(KeyValue::new(key.clone(), reduce_f(key, values)));
    }
    let body = layout::encode_records(&out)?;
    write_atomic(dir, &layout::merge_name(job, reduce_index), &body).await?;
    debug!("reduce {reduce_index}: {} keys over {n_map} map outputs", out.len());
    Ok(())
}
