//! Naming and on-disk format for everything a job writes: intermediate files,
//! per-partition merged outputs, and the final answer. Both phases go through
//! this module so the file names and the partition hash always line up.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// Prefix shared by every file a job writes into its working directory.
pub const PREFIX: &str = "mrtmp.";

const FNV_OFFSET: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

/// A single key/value record, the unit of data between the map and reduce
/// phases. Serializes to the on-disk line form `{"Key":"…","Value":"…"}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Name of the intermediate file map task `map_task` produces for reduce
/// partition `reduce_task`.
pub fn reduce_name(job: &str, map_task: usize, reduce_task: usize) -> String {
    format!("{PREFIX}{job}-{map_task}-{reduce_task}")
}

/// Name of the merged output of reduce task `reduce_task`.
pub fn merge_name(job: &str, reduce_task: usize) -> String {
    format!("{PREFIX}{job}-res-{reduce_task}")
}

/// Name of the final answer file.
pub fn ans_name(job: &str) -> String {
    format!("{PREFIX}{job}")
}

fn fnv1a(key: &str) -> u32 {
    key.bytes()
        .fold(FNV_OFFSET, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME))
}

/// Reduce partition a key belongs to. The map and reduce sides must agree on
/// this for the intermediate files to align, so it is pinned to FNV-1a 32-bit.
pub fn partition(key: &str, n_reduce: usize) -> usize {
    fnv1a(key) as usize % n_reduce
}

/// Encode records as JSON lines, one object per line.
pub fn encode_records(records: &[KeyValue]) -> anyhow::Result<String> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    Ok(out)
}

/// Decode the body of a JSON-lines file back into records. Blank lines are
/// skipped; records need not be sorted.
pub fn decode_records(contents: &str) -> anyhow::Result<Vec<KeyValue>> {
    contents
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).with_context(|| format!("malformed record line: {line}")))
        .collect()
}

/// Remove every intermediate and per-partition file of a job, keeping the
/// final answer. Files that are already gone are not an error.
pub fn clean_intermediates(dir: &Path, job: &str, n_map: usize, n_reduce: usize) {
    for reduce_task in 0..n_reduce {
        for map_task in 0..n_map {
            let _ = std::fs::remove_file(dir.join(reduce_name(job, map_task, reduce_task)));
        }
        let _ = std::fs::remove_file(dir.join(merge_name(job, reduce_task)));
    }
}

/// Concatenate `sources` into `dst`, byte for byte, in order. The inputs are
/// line-oriented, so the result is a valid stream of records.
pub async fn concat_files(dst: &Path, sources: &[PathBuf]) -> anyhow::Result<()> {
    let mut out = tokio::fs::File::create(dst)
        .await
        .with_context(|| format!("creating {}", dst.display()))?;
    for src in sources {
        let mut input = tokio::fs::File::open(src)
            .await
            .with_context(|| format!("opening {}", src.display()))?;
        tokio::io::copy(&mut input, &mut out)
            .await
            .with_context(|| format!("appending {}", src.display()))?;
    }
    out.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_carry_job_and_indices() {
        assert_eq!(reduce_name("wordcount", 2, 5), "mrtmp.wordcount-2-5");
        assert_eq!(merge_name("wordcount", 5), "mrtmp.wordcount-res-5");
        assert_eq!(ans_name("wordcount"), "mrtmp.wordcount");
    }

    #[test]
    fn hash_is_fnv1a_32bit() {
        // Published FNV-1a test vectors.
        assert_eq!(fnv1a(""), 0x811c9dc5);
        assert_eq!(fnv1a("a"), 0xe40c292c);
        assert_eq!(fnv1a("foobar"), 0xbf9cf968);
    }

    #[test]
    fn partition_is_stable_and_in_range() {
        for key in ["a", "b", "the", "straggler", ""] {
            for n_reduce in [1, 2, 3, 7] {
                let p = partition(key, n_reduce);
                assert!(p < n_reduce);
                assert_eq!(p, partition(key, n_reduce));
            }
        }
    }

    #[test]
    fn records_encode_one_json_object_per_line() {
        let records = vec![KeyValue::new("a", "2"), KeyValue::new("b", "1")];
        let body = encode_records(&records).unwrap();
        assert_eq!(body, "{\"Key\":\"a\",\"Value\":\"2\"}\n{\"Key\":\"b\",\"Value\":\"1\"}\n");
        assert_eq!(decode_records(&body).unwrap(), records);
    }

    #[test]
    fn cleanup_keeps_the_final_answer() {
        let dir = tempfile::tempdir().unwrap();
        for m in 0..2 {
            for r in 0..2 {
                std::fs::write(dir.path().join(reduce_name("job", m, r)), "x").unwrap();
            }
        }
        for r in 0..2 {
            std::fs::write(dir.path().join(merge_name("job", r)), "x").unwrap();
        }
        std::fs::write(dir.path().join(ans_name("job")), "answer").unwrap();

        clean_intermediates(dir.path(), "job", 2, 2);

        assert!(!dir.path().join(reduce_name("job", 0, 0)).exists());
        assert!(!dir.path().join(merge_name("job", 1)).exists());
        assert!(dir.path().join(ans_name("job")).exists());
    }
}
