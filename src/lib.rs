//! A small distributed MapReduce runtime. A coordinator partitions a job into
//! map and reduce tasks and serves them over RPC; pull-model workers execute
//! the tasks against a shared filesystem; the coordinator reassigns stragglers
//! by timeout and merges the per-partition outputs into the final answer.

pub mod mr;
