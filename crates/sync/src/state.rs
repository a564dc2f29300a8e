//! Synchronization state machine data.
//!
//! At most one [`StateMachine`] exists at a time; `None` on the controller
//! represents "idle between polls". A machine is created on demand when a
//! sync cycle starts and dropped when the cycle ends (success, failure or
//! IBD), so every cycle starts from a clean slate at [`SyncState::Begin`].

use std::collections::BTreeMap;
use std::fmt;

use ember_types::PreProcessedBlock;

/// Phases of one synchronization cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Probe the daemon for chain info.
    Begin,
    /// Partition the missing range and spawn download tasks.
    GetBlocks,
    /// Tasks are streaming blocks in; reassemble, verify, persist.
    DownloadingBlocks,
    /// All heights persisted; log totals and start over to catch a new tip.
    FinishedDl,
    /// Nothing to do; wait for the poll timer.
    End,
    /// A task or the verifier failed; retry on the poll timer.
    Failure,
    /// The daemon is still in initial block download; retry in a minute.
    Ibd,
}

impl SyncState {
    /// Short state name for logs and the stats snapshot.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Begin => "Begin",
            Self::GetBlocks => "GetBlocks",
            Self::DownloadingBlocks => "DownloadingBlocks",
            Self::FinishedDl => "FinishedDL",
            Self::End => "End",
            Self::Failure => "Failure",
            Self::Ibd => "IBD",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Working state of one synchronization cycle.
#[derive(Debug)]
pub struct StateMachine {
    /// Current phase.
    pub state: SyncState,
    /// Remote tip height reported by the daemon; −1 until known.
    pub target_height: i32,
    /// Out-of-order blocks awaiting in-order consumption, keyed by height.
    ///
    /// Never contains heights below [`Self::ppblk_ht_next`]; consumed
    /// entries are erased immediately.
    pub pp_blocks: BTreeMap<u32, PreProcessedBlock>,
    /// The next height awaited for in-order reassembly.
    pub ppblk_ht_next: u32,
    /// First height of this run.
    pub start_height: u32,
    /// Last height this run must persist.
    pub end_height: u32,
    /// Transactions seen this run.
    pub n_tx: u64,
    /// Inputs seen this run.
    pub n_ins: u64,
    /// Outputs seen this run.
    pub n_outs: u64,
    /// How many download tasks to fan out.
    pub dl_concurrency: usize,
}

impl StateMachine {
    /// A fresh machine at [`SyncState::Begin`].
    pub fn new(dl_concurrency: usize) -> Self {
        Self {
            state: SyncState::Begin,
            target_height: -1,
            pp_blocks: BTreeMap::new(),
            ppblk_ht_next: 0,
            start_height: 0,
            end_height: 0,
            n_tx: 0,
            n_ins: 0,
            n_outs: 0,
            dl_concurrency,
        }
    }

    /// Raw-block and in-memory byte totals of the reassembly backlog.
    pub fn backlog_bytes(&self) -> (u64, u64, u64) {
        let mut raw = 0u64;
        let mut mem = 0u64;
        let mut txs = 0u64;
        for ppb in self.pp_blocks.values() {
            raw += ppb.size_bytes as u64;
            mem += ppb.estimated_mem_bytes as u64;
            txs += ppb.tx_infos.len() as u64;
        }
        (raw, mem, txs)
    }
}

/// Default download-task fan-out: one per physical core, minus one for the
/// controller, never less than one.
pub fn default_dl_concurrency() -> usize {
    num_cpus::get_physical().saturating_sub(1).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names() {
        assert_eq!(SyncState::Begin.as_str(), "Begin");
        assert_eq!(SyncState::FinishedDl.as_str(), "FinishedDL");
        assert_eq!(SyncState::Ibd.to_string(), "IBD");
    }

    #[test]
    fn fresh_machine_defaults() {
        let sm = StateMachine::new(4);
        assert_eq!(sm.state, SyncState::Begin);
        assert_eq!(sm.target_height, -1);
        assert!(sm.pp_blocks.is_empty());
        assert_eq!(sm.dl_concurrency, 4);
    }

    #[test]
    fn concurrency_is_at_least_one() {
        assert!(default_dl_concurrency() >= 1);
    }
}
