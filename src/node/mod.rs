//! Runnable peers: the single-successor store and the replicated
//! fragment store, both composed from the same ring core.

use std::time::Duration;

use crate::consts::DEFAULT_IDA_M;
use crate::consts::DEFAULT_IDA_N;
use crate::consts::DEFAULT_IDA_P;
use crate::consts::DEFAULT_NUM_SUCCS;
use crate::consts::DEFAULT_RPC_WORKERS;
use crate::consts::DEFAULT_STABILIZE_INTERVAL_MS;

pub mod chord_kv;
pub mod dhash;
pub mod maintenance;
mod sync;

pub use chord_kv::ChordNode;
pub use dhash::DhashNode;
pub use maintenance::MaintenanceHandle;

/// Tunables of one peer. The defaults mirror the reference deployment;
/// tests shrink the intervals to converge quickly.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Successor list capacity.
    pub num_succs: usize,
    /// Time between two maintenance cycles.
    pub stabilize_interval: Duration,
    /// Number of concurrent request handlers.
    pub rpc_workers: usize,
    /// Fragments produced per value (replicated store only).
    pub ida_n: usize,
    /// Fragments required to reconstruct a value.
    pub ida_m: usize,
    /// Prime modulus of the codec arithmetic.
    pub ida_p: i64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            num_succs: DEFAULT_NUM_SUCCS,
            stabilize_interval: Duration::from_millis(DEFAULT_STABILIZE_INTERVAL_MS),
            rpc_workers: DEFAULT_RPC_WORKERS,
            ida_n: DEFAULT_IDA_N,
            ida_m: DEFAULT_IDA_M,
            ida_p: DEFAULT_IDA_P,
        }
    }
}

impl PeerConfig {
    /// Capacity override, keeping everything else at the default.
    pub fn with_num_succs(num_succs: usize) -> Self {
        Self {
            num_succs,
            ..Self::default()
        }
    }
}
