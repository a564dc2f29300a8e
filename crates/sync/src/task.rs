//! Controller-owned tasks.
//!
//! Tasks run on their own tokio tasks and talk to the controller only by
//! posting [`ControllerMsg`]s; nothing here touches controller state
//! directly. Each task announces its own end with a success or errored
//! message followed by a finished message, at which point the controller
//! drops its handle. Counters live in shared atomics so the stats snapshot
//! can read them while a task runs.

use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, trace, warn};

use ember_bitcoind::{BitcoindMgr, ChainInfo, RpcError};
use ember_types::{BlockHash, PreProcessedBlock, RawHeader, HEADER_SIZE};

use crate::controller::ControllerMsg;

/// Key of a live task in the controller's task map.
///
/// Ids are never reused, so a message carrying the id of a removed task can
/// be recognized as stale and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shared state of one download task.
///
/// The task covers the arithmetic progression
/// `{from, from + stride, ..., <= to}`; several tasks with the same stride
/// and consecutive `from` values partition a range by residue class.
#[derive(Debug)]
pub(crate) struct DlTaskCore {
    /// First height of this task's progression.
    pub from: u32,
    /// Upper bound (inclusive) of the range.
    pub to: u32,
    /// Step between consecutive heights.
    pub stride: u32,
    /// Number of heights this task must deliver.
    pub expected_ct: u32,
    /// Heights delivered so far.
    pub good_ct: AtomicU32,
    /// Transactions seen so far.
    pub n_tx: AtomicU64,
    /// Inputs seen so far.
    pub n_ins: AtomicU64,
    /// Outputs seen so far.
    pub n_outs: AtomicU64,
    // f64 bits of the most recent progress fraction
    last_progress: AtomicU64,
}

impl DlTaskCore {
    pub fn new(from: u32, to: u32, stride: u32) -> Self {
        debug_assert!(to >= from && stride > 0);
        let expected = ((to as u64 - from as u64) + stride as u64) / stride as u64;
        Self {
            from,
            to,
            stride,
            expected_ct: expected as u32,
            good_ct: AtomicU32::new(0),
            n_tx: AtomicU64::new(0),
            n_ins: AtomicU64::new(0),
            n_outs: AtomicU64::new(0),
            last_progress: AtomicU64::new(0),
        }
    }

    pub fn last_progress(&self) -> f64 {
        f64::from_bits(self.last_progress.load(Ordering::Relaxed))
    }

    fn set_progress(&self, progress: f64) {
        self.last_progress
            .store(progress.to_bits(), Ordering::Relaxed);
    }

    /// Rough estimate of how many headers this task has delivered, derived
    /// from the progress fraction.
    pub fn n_so_far(&self) -> u64 {
        (self.expected_ct as f64 * self.last_progress()).round() as u64
    }

    /// The height at a given position of the progression.
    pub fn index_to_height(&self, index: u32) -> u32 {
        self.from + index * self.stride
    }
}

/// One-shot probe for `getblockchaininfo`.
pub(crate) async fn run_chain_info_task(
    task: TaskId,
    mgr: Arc<BitcoindMgr>,
    tx: mpsc::UnboundedSender<ControllerMsg>,
    be_silent_if_up_to_date: bool,
) {
    match mgr.submit_request("getblockchaininfo", &[]).await {
        Ok(value) => match ChainInfo::from_value(&value) {
            Ok(info) => {
                trace!(%info, "chain info");
                let _ = tx.send(ControllerMsg::ChainInfoSuccess {
                    task,
                    info: Box::new(info),
                    be_silent_if_up_to_date,
                });
            }
            Err(e) => {
                error!(error = %e, "getblockchaininfo gave an unusable reply");
                let _ = tx.send(ControllerMsg::TaskErrored {
                    task,
                    error_code: 0,
                    error_message: e.to_string(),
                });
            }
        },
        Err(e) => {
            warn!(error = %e, "getblockchaininfo failed");
            let (error_code, error_message) = rpc_task_error(0, e);
            let _ = tx.send(ControllerMsg::TaskErrored {
                task,
                error_code,
                error_message,
            });
        }
    }
    let _ = tx.send(ControllerMsg::TaskFinished { task });
}

/// Parallel download task over one residue class of the missing range.
///
/// Keeps up to `max_q` requests outstanding: one request is issued up
/// front, and each delivered block tops the pipeline back up while work
/// remains. When the progression is exhausted, the delivered count is
/// checked against the expected count; a shortfall is an error, not a
/// success.
pub(crate) async fn run_download_task(
    task: TaskId,
    core: Arc<DlTaskCore>,
    mgr: Arc<BitcoindMgr>,
    tx: mpsc::UnboundedSender<ControllerMsg>,
    max_q: usize,
) {
    let mut next = core.from as u64;
    let mut in_flight: JoinSet<Result<(), (i64, String)>> = JoinSet::new();

    if next <= core.to as u64 {
        spawn_fetch(&mut in_flight, task, &core, &mgr, &tx, next as u32);
        next += core.stride as u64;
    }

    let outcome: Result<(), (i64, String)> = loop {
        let Some(joined) = in_flight.join_next().await else {
            break Ok(());
        };
        match joined {
            Ok(Ok(())) => {
                let good = core.good_ct.load(Ordering::Relaxed);
                while next <= core.to as u64
                    && (good + in_flight.len() as u32) < core.expected_ct
                    && in_flight.len() < max_q
                {
                    spawn_fetch(&mut in_flight, task, &core, &mgr, &tx, next as u32);
                    next += core.stride as u64;
                }
            }
            Ok(Err(err)) => break Err(err),
            Err(join_err) => break Err((0, format!("fetch task died: {join_err}"))),
        }
    };
    // dropping the JoinSet aborts any fetches still in flight

    match outcome {
        Ok(()) => {
            let good = core.good_ct.load(Ordering::Relaxed);
            if good >= core.expected_ct {
                let _ = tx.send(ControllerMsg::TaskSuccess { task });
            } else {
                let missing = core.expected_ct - good;
                let _ = tx.send(ControllerMsg::TaskErrored {
                    task,
                    error_code: missing as i64,
                    error_message: format!("missing {missing} headers"),
                });
            }
        }
        Err((error_code, error_message)) => {
            let _ = tx.send(ControllerMsg::TaskErrored {
                task,
                error_code,
                error_message,
            });
        }
    }
    let _ = tx.send(ControllerMsg::TaskFinished { task });
}

fn spawn_fetch(
    set: &mut JoinSet<Result<(), (i64, String)>>,
    task: TaskId,
    core: &Arc<DlTaskCore>,
    mgr: &Arc<BitcoindMgr>,
    tx: &mpsc::UnboundedSender<ControllerMsg>,
    height: u32,
) {
    let core = Arc::clone(core);
    let mgr = Arc::clone(mgr);
    let tx = tx.clone();
    set.spawn(async move { fetch_one(task, &core, &mgr, &tx, height).await });
}

/// The per-height protocol: `getblockhash`, `getblock`, header/hash check,
/// preprocess, hand off to the controller.
async fn fetch_one(
    task: TaskId,
    core: &DlTaskCore,
    mgr: &BitcoindMgr,
    tx: &mpsc::UnboundedSender<ControllerMsg>,
    height: u32,
) -> Result<(), (i64, String)> {
    let hash_value = mgr
        .submit_request("getblockhash", &[json!(height)])
        .await
        .map_err(|e| rpc_task_error(height, e))?;

    let hash = match hash_value.as_str().and_then(|s| BlockHash::from_hex(s).ok()) {
        Some(hash) => hash,
        None => {
            warn!(height, "getblockhash: hash not valid");
            return Err((height as i64, format!("invalid hash for height {height}")));
        }
    };

    let block_value = mgr
        .submit_request("getblock", &[hash_value, json!(false)])
        .await
        .map_err(|e| rpc_task_error(height, e))?;

    let raw = block_value
        .as_str()
        .and_then(|s| hex::decode(s).ok())
        .unwrap_or_default();
    if raw.len() < HEADER_SIZE {
        warn!(height, decoded = raw.len(), "getblock: header not valid");
        return Err((height as i64, format!("bad size for height {height}")));
    }

    let mut header: RawHeader = [0u8; HEADER_SIZE];
    header.copy_from_slice(&raw[..HEADER_SIZE]);
    if BlockHash::hash_rev(&header) != hash {
        warn!(
            height,
            expected = %hash,
            got = %BlockHash::hash_rev(&header),
            "getblock: header not valid"
        );
        return Err((height as i64, format!("hash mismatch for height {height}")));
    }

    let ppb = PreProcessedBlock::preprocess(height, &raw)
        .map_err(|e| (height as i64, format!("block {height} did not parse: {e}")))?;
    trace!(height, size = raw.len(), n_tx = ppb.tx_infos.len(), "block");

    core.n_tx
        .fetch_add(ppb.tx_infos.len() as u64, Ordering::Relaxed);
    core.n_ins
        .fetch_add(ppb.inputs.len() as u64, Ordering::Relaxed);
    core.n_outs
        .fetch_add(ppb.outputs.len() as u64, Ordering::Relaxed);
    core.good_ct.fetch_add(1, Ordering::Relaxed);

    let index = (height - core.from) / core.stride;
    let progress = index as f64 / core.expected_ct as f64;
    core.set_progress(progress);
    if height % 1000 == 0 && height != 0 {
        let _ = tx.send(ControllerMsg::TaskProgress { task, progress });
    }

    let _ = tx.send(ControllerMsg::PutBlock {
        task,
        block: Box::new(ppb),
    });
    Ok(())
}

fn rpc_task_error(height: u32, error: RpcError) -> (i64, String) {
    match error {
        RpcError::Server { code, message } => (code, message),
        other => (height as i64, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_count_over_stride_partition() {
        // [0..9] split 3 ways: residues get 4, 3, 3
        assert_eq!(DlTaskCore::new(0, 9, 3).expected_ct, 4);
        assert_eq!(DlTaskCore::new(1, 9, 3).expected_ct, 3);
        assert_eq!(DlTaskCore::new(2, 9, 3).expected_ct, 3);
    }

    #[test]
    fn expected_count_when_stride_exceeds_range() {
        assert_eq!(DlTaskCore::new(5, 6, 10).expected_ct, 1);
        assert_eq!(DlTaskCore::new(5, 5, 1).expected_ct, 1);
    }

    #[test]
    fn index_height_round_trip() {
        let core = DlTaskCore::new(100, 200, 4);
        for index in 0..core.expected_ct {
            let h = core.index_to_height(index);
            assert_eq!((h - core.from) / core.stride, index);
        }
    }

    #[test]
    fn stride_partition_covers_range_exactly_once() {
        let (from, to, n) = (100u32, 137u32, 4u32);
        let mut seen = std::collections::BTreeSet::new();
        for i in 0..n {
            let core = DlTaskCore::new(from + i, to, n);
            let mut height = core.from as u64;
            let mut count = 0;
            while height <= core.to as u64 {
                assert!(seen.insert(height as u32), "height {height} duplicated");
                height += core.stride as u64;
                count += 1;
            }
            assert_eq!(count, core.expected_ct);
        }
        assert_eq!(seen.len(), (to - from + 1) as usize);
        assert_eq!(seen.iter().next(), Some(&from));
        assert_eq!(seen.iter().next_back(), Some(&to));
    }

    #[test]
    fn progress_bits_round_trip() {
        let core = DlTaskCore::new(0, 99, 1);
        assert_eq!(core.last_progress(), 0.0);
        core.set_progress(0.25);
        assert_eq!(core.last_progress(), 0.25);
        assert_eq!(core.n_so_far(), 25);
    }
}
