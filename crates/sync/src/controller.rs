//! The synchronization controller.
//!
//! The controller is an actor: everything it owns (the state machine, the
//! task map, the timer table) is touched only from its single run loop.
//! Tasks, timers and the upstream manager communicate with it exclusively
//! by posting [`ControllerMsg`]s onto its channel, so no external callback
//! ever executes against controller state inline. Shared resources
//! (the header vector, the chain verifier, task counters) live behind their
//! own locks and atomics and are only held across short, non-blocking
//! critical sections.
//!
//! ## Lifecycle
//!
//! On startup the controller arms the bitcoind readiness gate: it waits for
//! the first good upstream connection (logging every 10 s meanwhile), then
//! kicks the state machine after a short debounce. From there the machine
//! drives itself: Begin probes the chain, GetBlocks fans out download
//! tasks, DownloadingBlocks reassembles and persists in height order,
//! FinishedDL loops back to Begin to catch a newer tip, and the terminal
//! states re-arm the poll timer.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ember_bitcoind::{BitcoindEvent, BitcoindMgr, ChainInfo};
use ember_storage::{SaveItem, Storage};
use ember_types::PreProcessedBlock;

use crate::error::FatalError;
use crate::server::ServerManager;
use crate::state::{StateMachine, SyncState};
use crate::task::{run_chain_info_task, run_download_task, DlTaskCore, TaskId};

/// Events the controller broadcasts to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// A download run is starting.
    Synchronizing,
    /// The local store matches the remote tip.
    UpToDate,
    /// A sync cycle failed; it will be retried on the poll timer.
    SynchFailure,
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Delay between tip polls once synced (or after a failure).
    pub poll_interval: Duration,
    /// Number of download tasks to fan out per run.
    pub dl_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            dl_concurrency: crate::state::default_dl_concurrency(),
        }
    }
}

// named timers
const POLL_TIMER: &str = "pollTimer";
const WAIT_TIMER: &str = "wait4bitcoind";
const CALL_PROCESS_TIMER: &str = "callProcess";

/// Poll delay while the daemon reports initial block download.
const IBD_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Cadence of the "Waiting for bitcoind..." log while gated.
const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(10);
/// Debounce between the first good connection and the first process kick.
const PROCESS_DEBOUNCE: Duration = Duration::from_millis(100);
/// Enqueue a header flush every this many headers during a long run.
const SAVE_EVERY: u32 = 10_000;

/// Messages posted onto the controller's run loop.
#[derive(Debug)]
pub(crate) enum ControllerMsg {
    /// Drive the state machine (creating it at Begin if absent).
    Process { be_silent_if_up_to_date: bool },
    /// The chain-info probe parsed a full record.
    ChainInfoSuccess {
        task: TaskId,
        info: Box<ChainInfo>,
        be_silent_if_up_to_date: bool,
    },
    /// A download task delivered everything it was asked for.
    TaskSuccess { task: TaskId },
    /// A task failed; collapses the run into Failure unless already there.
    TaskErrored {
        task: TaskId,
        error_code: i64,
        error_message: String,
    },
    /// Periodic progress report from a download task.
    TaskProgress { task: TaskId, progress: f64 },
    /// A task's future completed; release its handle.
    TaskFinished { task: TaskId },
    /// A downloaded block, handed off for in-order reassembly.
    PutBlock {
        task: TaskId,
        block: Box<PreProcessedBlock>,
    },
    /// A named timer fired.
    TimerFired { name: &'static str },
    /// Forwarded bitcoind lifecycle event.
    Upstream(BitcoindEvent),
    /// The deferred server-manager startup failed to bind/listen.
    ServerStartupFailed(String),
    /// Stats snapshot request.
    Stats { reply: oneshot::Sender<Value> },
    /// Stop the run loop.
    Shutdown,
}

/// Handle for posting to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<ControllerMsg>,
}

impl ControllerHandle {
    /// Kicks the state machine. Normal operation drives itself through the
    /// readiness gate and the poll timer; this is for embedders and tests.
    pub fn process(&self) {
        let _ = self.tx.send(ControllerMsg::Process {
            be_silent_if_up_to_date: false,
        });
    }

    /// Requests a point-in-time stats snapshot.
    ///
    /// Returns `None` if the controller has stopped.
    pub async fn stats(&self) -> Option<Value> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ControllerMsg::Stats { reply }).ok()?;
        rx.await.ok()
    }

    /// Stops the run loop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ControllerMsg::Shutdown);
    }
}

pub(crate) struct TaskEntry {
    pub name: String,
    pub started_at: Instant,
    /// Shared counters; present for download tasks only.
    pub dl: Option<Arc<DlTaskCore>>,
    pub handle: JoinHandle<()>,
}

pub(crate) struct TimerEntry {
    pub interval: Duration,
    pub repeat: bool,
    pub handle: JoinHandle<()>,
}

/// The synchronization controller.
pub struct Controller {
    pub(crate) storage: Arc<Storage>,
    pub(crate) bitcoind: Arc<BitcoindMgr>,
    pub(crate) config: SyncConfig,
    tx: mpsc::UnboundedSender<ControllerMsg>,
    rx: mpsc::UnboundedReceiver<ControllerMsg>,
    events: broadcast::Sender<SyncEvent>,
    upstream_rx: Option<broadcast::Receiver<BitcoindEvent>>,
    pub(crate) sm: Option<StateMachine>,
    pub(crate) tasks: HashMap<TaskId, TaskEntry>,
    next_task_id: u64,
    pub(crate) timers: HashMap<&'static str, TimerEntry>,
    pub(crate) srvmgr: Option<Arc<dyn ServerManager>>,
    srv_started: bool,
    waiting_for_bitcoind: bool,
    last_warmup_log: Option<Instant>,
}

impl Controller {
    /// Creates a controller over its collaborators. Nothing runs until
    /// [`Controller::run`] (or [`Controller::startup`]) is called.
    pub fn new(storage: Arc<Storage>, bitcoind: Arc<BitcoindMgr>, config: SyncConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let upstream_rx = Some(bitcoind.subscribe());
        Self {
            storage,
            bitcoind,
            config,
            tx,
            rx,
            events,
            upstream_rx,
            sm: None,
            tasks: HashMap::new(),
            next_task_id: 1,
            timers: HashMap::new(),
            srvmgr: None,
            srv_started: false,
            waiting_for_bitcoind: false,
            last_warmup_log: None,
        }
    }

    /// Attaches the client-facing server manager; it is started once, the
    /// first time the chain reaches the up-to-date state.
    pub fn attach_server_manager(&mut self, srvmgr: Arc<dyn ServerManager>) {
        self.srvmgr = Some(srvmgr);
    }

    /// Subscribes to [`SyncEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// A handle for posting to this controller.
    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            tx: self.tx.clone(),
        }
    }

    /// Spawns the run loop. A fatal condition is logged and terminates the
    /// process; the index cannot be trusted past any of them.
    pub fn startup(self) -> ControllerHandle {
        let handle = self.handle();
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!(error = %e, "Fatal controller error; exiting");
                std::process::exit(1);
            }
        });
        handle
    }

    /// Runs the controller until shutdown or a fatal condition.
    pub async fn run(mut self) -> Result<(), FatalError> {
        // forward upstream lifecycle events into the message loop
        let forwarder = self.upstream_rx.take().map(|mut upstream| {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                loop {
                    match upstream.recv().await {
                        Ok(ev) => {
                            if tx.send(ControllerMsg::Upstream(ev)).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        });

        self.wait_for_bitcoind();

        let result = loop {
            let Some(msg) = self.rx.recv().await else {
                break Ok(());
            };
            if matches!(msg, ControllerMsg::Shutdown) {
                break Ok(());
            }
            if let Err(fatal) = self.handle_msg(msg) {
                break Err(fatal);
            }
        };

        if let Some(f) = forwarder {
            f.abort();
        }
        self.cleanup();
        result
    }

    fn cleanup(&mut self) {
        for (_, entry) in self.tasks.drain() {
            entry.handle.abort();
        }
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
        debug!("Controller stopped");
    }

    // ------------------------------------------------------------------
    // Message dispatch
    // ------------------------------------------------------------------

    fn handle_msg(&mut self, msg: ControllerMsg) -> Result<(), FatalError> {
        match msg {
            ControllerMsg::Process {
                be_silent_if_up_to_date,
            } => self.process(be_silent_if_up_to_date),

            ControllerMsg::ChainInfoSuccess {
                task,
                info,
                be_silent_if_up_to_date,
            } => self.on_chain_info(task, *info, be_silent_if_up_to_date),

            ControllerMsg::TaskSuccess { task } => {
                self.on_task_success(task);
                Ok(())
            }

            ControllerMsg::TaskErrored {
                task,
                error_code,
                error_message,
            } => {
                self.on_task_errored(task, error_code, &error_message);
                Ok(())
            }

            ControllerMsg::TaskProgress { task, progress } => {
                self.on_task_progress(task, progress);
                Ok(())
            }

            ControllerMsg::TaskFinished { task } => {
                self.rm_task(task);
                Ok(())
            }

            ControllerMsg::PutBlock { task, block } => self.on_put_block(task, *block),

            ControllerMsg::TimerFired { name } => self.on_timer(name),

            ControllerMsg::Upstream(ev) => {
                self.on_upstream(ev);
                Ok(())
            }

            ControllerMsg::ServerStartupFailed(msg) => Err(FatalError::ServerStartup(msg)),

            ControllerMsg::Stats { reply } => {
                let _ = reply.send(self.stats_snapshot());
                Ok(())
            }

            ControllerMsg::Shutdown => Ok(()), // handled in run()
        }
    }

    fn post_process(&self, be_silent_if_up_to_date: bool) {
        let _ = self.tx.send(ControllerMsg::Process {
            be_silent_if_up_to_date,
        });
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    fn process(&mut self, be_silent_if_up_to_date: bool) -> Result<(), FatalError> {
        let mut enable_poll = false;
        let mut poll_interval = self.config.poll_interval;
        self.stop_timer(POLL_TIMER);

        let dl_concurrency = self.config.dl_concurrency;
        let state = self
            .sm
            .get_or_insert_with(|| StateMachine::new(dl_concurrency))
            .state;

        match state {
            SyncState::Begin => {
                self.spawn_chain_info_task(be_silent_if_up_to_date);
            }
            SyncState::GetBlocks => {
                self.enter_get_blocks()?;
            }
            SyncState::DownloadingBlocks => {
                self.process_downloading_blocks()?;
            }
            SyncState::FinishedDl => {
                if let Some(sm) = self.sm.take() {
                    let n = (sm.end_height - sm.start_height) as u64 + 1;
                    info!(
                        "Processed {} new block(s) with {} tx(s) ({} inputs & {} outputs), verified ok",
                        n, sm.n_tx, sm.n_ins, sm.n_outs
                    );
                }
                // straight back to Begin to catch any tip that arrived
                // while we were downloading
                self.post_process(false);
                self.storage.save(SaveItem::Headers);
            }
            SyncState::End => {
                self.sm = None;
                enable_poll = true;
            }
            SyncState::Failure => {
                error!("Failed to download headers");
                self.sm = None;
                enable_poll = true;
                self.emit(SyncEvent::SynchFailure);
            }
            SyncState::Ibd => {
                self.sm = None;
                enable_poll = true;
                warn!("bitcoind is in initial block download, will try again in 1 minute");
                poll_interval = IBD_POLL_INTERVAL;
                self.emit(SyncEvent::SynchFailure);
            }
        }

        if enable_poll {
            self.call_on_timer_soon(POLL_TIMER, poll_interval, false);
        }
        Ok(())
    }

    fn on_chain_info(
        &mut self,
        task: TaskId,
        info: ChainInfo,
        be_silent_if_up_to_date: bool,
    ) -> Result<(), FatalError> {
        // the task may have been stopped from underneath us
        if self.sm.is_none() || !self.tasks.contains_key(&task) {
            return Ok(());
        }

        if info.initial_block_download {
            if let Some(sm) = self.sm.as_mut() {
                sm.state = SyncState::Ibd;
            }
            self.post_process(be_silent_if_up_to_date);
            return Ok(());
        }

        let db_chain = self.storage.get_chain();
        if db_chain.is_empty() && !info.chain.is_empty() {
            self.storage.set_chain(&info.chain);
        } else if db_chain != info.chain {
            return Err(FatalError::ChainMismatch {
                db: db_chain,
                daemon: info.chain,
            });
        }

        let old_tip = self.storage.header_count() as i64 - 1;
        let target = info.blocks as i64;
        if let Some(sm) = self.sm.as_mut() {
            sm.target_height = info.blocks;
        }

        if old_tip == target {
            if !be_silent_if_up_to_date {
                info!("Block height {target}, up-to-date");
                self.emit(SyncEvent::UpToDate);
                self.maybe_start_servers();
            }
            if let Some(sm) = self.sm.as_mut() {
                sm.state = SyncState::End;
            }
        } else if old_tip > target {
            return Err(FatalError::Regression {
                local: old_tip,
                remote: target,
            });
        } else {
            info!("Block height {target}, downloading new headers ...");
            self.emit(SyncEvent::Synchronizing);
            if let Some(sm) = self.sm.as_mut() {
                sm.state = SyncState::GetBlocks;
            }
        }

        self.post_process(be_silent_if_up_to_date);
        Ok(())
    }

    fn enter_get_blocks(&mut self) -> Result<(), FatalError> {
        let (target, dl_concurrency) = match self.sm.as_ref() {
            Some(sm) if sm.target_height >= 0 => (sm.target_height as u32, sm.dl_concurrency),
            Some(_) => {
                return Err(FatalError::InternalInvariant(
                    "target height unknown in GetBlocks".into(),
                ))
            }
            None => return Ok(()),
        };

        let base = self.storage.header_count() as u32;
        let num = target as i64 + 1 - base as i64;
        if num <= 0 {
            return Err(FatalError::InternalInvariant(
                "cannot download 0 blocks".into(),
            ));
        }
        let n_tasks = (num as usize).min(dl_concurrency).max(1);

        for i in 0..n_tasks {
            self.add_download_task(base + i as u32, target, n_tasks as u32);
        }

        if let Some(sm) = self.sm.as_mut() {
            sm.ppblk_ht_next = base;
            sm.start_height = base;
            sm.end_height = target;
            // we will be re-entered by the tasks' put-block handoffs
            sm.state = SyncState::DownloadingBlocks;
        }
        Ok(())
    }

    fn on_put_block(&mut self, task: TaskId, block: PreProcessedBlock) -> Result<(), FatalError> {
        let defunct = self.sm.is_none()
            || !self.tasks.contains_key(&task)
            || matches!(self.sm.as_ref().map(|sm| sm.state), Some(SyncState::Failure));
        if defunct {
            debug!(height = block.height, "Ignoring block for now-defunct task");
            return Ok(());
        }

        let Some(sm) = self.sm.as_mut() else {
            return Ok(());
        };
        if sm.state != SyncState::DownloadingBlocks {
            warn!(
                height = block.height,
                state = %sm.state,
                "Ignoring put-block request; not downloading"
            );
            return Ok(());
        }

        sm.pp_blocks.insert(block.height, block);
        // queue the drain instead of running it inline so other messages
        // (errors, timers, stats) interleave fairly
        self.post_process(false);
        Ok(())
    }

    fn process_downloading_blocks(&mut self) -> Result<(), FatalError> {
        loop {
            let next = {
                let Some(sm) = self.sm.as_mut() else {
                    return Ok(());
                };
                let head = sm.pp_blocks.keys().next().copied();
                match head {
                    Some(h) if h == sm.ppblk_ht_next => {
                        let ppb = sm.pp_blocks.remove(&h);
                        sm.ppblk_ht_next += 1;
                        ppb
                    }
                    _ => None,
                }
            };

            let Some(ppb) = next else { break };
            if ppb.height + 1 != self.sm.as_ref().map(|sm| sm.ppblk_ht_next).unwrap_or(0) {
                return Err(FatalError::InternalInvariant(
                    "retrieved block has the wrong height".into(),
                ));
            }
            if !self.verify_and_add_block(&ppb)? {
                // verification failed; the state machine is already in
                // Failure and a re-entry is queued
                return Ok(());
            }
        }

        if let Some(sm) = self.sm.as_mut() {
            if sm.ppblk_ht_next > sm.end_height {
                sm.state = SyncState::FinishedDl;
                self.post_process(false);
            }
        }
        Ok(())
    }

    /// Verifies one header against the shared verifier and appends it to
    /// storage. Returns `Ok(false)` when the header was rejected (the run
    /// is collapsing into Failure), `Ok(true)` otherwise.
    fn verify_and_add_block(&mut self, ppb: &PreProcessedBlock) -> Result<bool, FatalError> {
        let raw_header = {
            let mut verifier = self.storage.header_verifier();
            // snapshot for undo; the verifier is a cheap value type
            let undo = verifier.clone();
            if let Err(e) = verifier.verify(ppb.height, &ppb.header) {
                error!(error = %e, "Header verification failed");
                *verifier = undo;
                drop(verifier);
                // possible reorg point; treated as a failed run for now
                if let Some(sm) = self.sm.as_mut() {
                    sm.state = SyncState::Failure;
                }
                self.post_process(false);
                return Ok(false);
            }
            match verifier.last_header_processed() {
                Some((_, header)) => header,
                None => {
                    return Err(FatalError::InternalInvariant(
                        "verifier has no last header after a successful verify".into(),
                    ))
                }
            }
        };

        let n_left = match self.sm.as_ref() {
            Some(sm) => sm.end_height.saturating_sub(sm.ppblk_ht_next - 1),
            None => 0,
        };

        {
            let mut headers = self.storage.mutable_headers();
            let len = headers.len();
            if headers.capacity() < len + n_left as usize {
                // one reservation covers the rest of the run
                headers.reserve(n_left as usize);
            }
            headers.push(raw_header);
            debug_assert_eq!(headers.len(), ppb.height as usize + 1);
        }

        if n_left % SAVE_EVERY == 0 && n_left != 0 {
            self.storage.save(SaveItem::Headers);
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Task lifecycle
    // ------------------------------------------------------------------

    fn alloc_task_id(&mut self) -> TaskId {
        let id = TaskId(self.next_task_id);
        self.next_task_id += 1;
        id
    }

    fn spawn_chain_info_task(&mut self, be_silent_if_up_to_date: bool) {
        let id = self.alloc_task_id();
        let handle = tokio::spawn(run_chain_info_task(
            id,
            Arc::clone(&self.bitcoind),
            self.tx.clone(),
            be_silent_if_up_to_date,
        ));
        self.tasks.insert(
            id,
            TaskEntry {
                name: "Task.GetChainInfo".into(),
                started_at: Instant::now(),
                dl: None,
                handle,
            },
        );
    }

    fn add_download_task(&mut self, from: u32, to: u32, stride: u32) {
        let id = self.alloc_task_id();
        let core = Arc::new(DlTaskCore::new(from, to, stride));
        let max_q = self.bitcoind.max_clients() + 1;
        let handle = tokio::spawn(run_download_task(
            id,
            Arc::clone(&core),
            Arc::clone(&self.bitcoind),
            self.tx.clone(),
            max_q,
        ));
        self.tasks.insert(
            id,
            TaskEntry {
                name: format!("Task.DL {from} -> {to}"),
                started_at: Instant::now(),
                dl: Some(core),
                handle,
            },
        );
    }

    fn rm_task(&mut self, task: TaskId) {
        match self.tasks.remove(&task) {
            Some(entry) => entry.handle.abort(),
            None => error!(%task, "Task not found in task table"),
        }
    }

    fn on_task_success(&mut self, task: TaskId) {
        if self.sm.is_none() {
            return;
        }
        let Some(entry) = self.tasks.get(&task) else {
            return; // stale
        };
        if let Some(core) = &entry.dl {
            use std::sync::atomic::Ordering;
            let n_tx = core.n_tx.load(Ordering::Relaxed);
            let n_ins = core.n_ins.load(Ordering::Relaxed);
            let n_outs = core.n_outs.load(Ordering::Relaxed);
            let good = core.good_ct.load(Ordering::Relaxed);
            let name = entry.name.clone();
            if let Some(sm) = self.sm.as_mut() {
                sm.n_tx += n_tx;
                sm.n_ins += n_ins;
                sm.n_outs += n_outs;
                debug!(
                    task = %name,
                    headers = good,
                    n_tx,
                    n_ins,
                    n_outs,
                    totals = format!("{},{},{}", sm.n_tx, sm.n_ins, sm.n_outs),
                    "Got all headers from task"
                );
            }
        }
    }

    fn on_task_errored(&mut self, task: TaskId, error_code: i64, error_message: &str) {
        if self.sm.is_none() || !self.tasks.contains_key(&task) {
            return; // stale
        }
        if matches!(self.sm.as_ref().map(|sm| sm.state), Some(SyncState::Failure)) {
            return; // already failing; stay quiet
        }
        let name = &self.tasks[&task].name;
        error!(task = %name, code = error_code, error = %error_message, "Task errored");
        self.generic_task_errored();
    }

    fn generic_task_errored(&mut self) {
        if let Some(sm) = self.sm.as_mut() {
            if sm.state != SyncState::Failure {
                sm.state = SyncState::Failure;
                self.post_process(false);
            }
        }
    }

    fn on_task_progress(&mut self, task: TaskId, progress: f64) {
        if self.sm.is_none() {
            return;
        }
        let Some(entry) = self.tasks.get(&task) else {
            return; // stale
        };
        if let Some(core) = &entry.dl {
            let index = (core.expected_ct as f64 * progress) as u32;
            let height = core.index_to_height(index.min(core.expected_ct.saturating_sub(1)));
            info!("Downloaded height: {height}, {:.1}%", progress * 100.0);
        }
    }

    // ------------------------------------------------------------------
    // Timers & upstream gate
    // ------------------------------------------------------------------

    /// (Re)arms a named timer. Arming an already-armed name replaces it;
    /// stopping an absent name is a no-op.
    pub(crate) fn call_on_timer_soon(
        &mut self,
        name: &'static str,
        interval: Duration,
        repeat: bool,
    ) {
        self.stop_timer(name);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if tx.send(ControllerMsg::TimerFired { name }).is_err() {
                    break;
                }
                if !repeat {
                    break;
                }
            }
        });
        self.timers.insert(
            name,
            TimerEntry {
                interval,
                repeat,
                handle,
            },
        );
    }

    pub(crate) fn stop_timer(&mut self, name: &'static str) {
        if let Some(timer) = self.timers.remove(name) {
            timer.handle.abort();
        }
    }

    fn on_timer(&mut self, name: &'static str) -> Result<(), FatalError> {
        // a fire from a timer that was since stopped is stale
        let Some(entry) = self.timers.get(name) else {
            return Ok(());
        };
        if !entry.repeat {
            self.timers.remove(name);
        }

        match name {
            POLL_TIMER => {
                if self.sm.is_none() {
                    self.process(true)?;
                }
            }
            WAIT_TIMER => info!("Waiting for bitcoind..."),
            CALL_PROCESS_TIMER => self.process(false)?,
            _ => {}
        }
        Ok(())
    }

    /// Arms the readiness gate: no state-machine activity until the first
    /// good upstream connection is seen.
    fn wait_for_bitcoind(&mut self) {
        self.waiting_for_bitcoind = true;
        self.stop_timer(POLL_TIMER);
        self.stop_timer(CALL_PROCESS_TIMER);
        self.call_on_timer_soon(WAIT_TIMER, WAIT_LOG_INTERVAL, true);
    }

    fn on_upstream(&mut self, event: BitcoindEvent) {
        match event {
            BitcoindEvent::FirstGoodConnection(id) => {
                if self.waiting_for_bitcoind {
                    self.waiting_for_bitcoind = false;
                    self.stop_timer(WAIT_TIMER);
                    debug!(id, "Connected to bitcoind, proceeding with processing ...");
                    self.call_on_timer_soon(CALL_PROCESS_TIMER, PROCESS_DEBOUNCE, false);
                }
            }
            BitcoindEvent::AllConnectionsLost => {
                self.wait_for_bitcoind();
            }
            BitcoindEvent::InWarmUp(msg) => {
                // throttled so a warm-up storm does not spam the log
                let due = self
                    .last_warmup_log
                    .map_or(true, |t| t.elapsed() >= Duration::from_secs(1));
                if due {
                    self.last_warmup_log = Some(Instant::now());
                    info!("bitcoind is still warming up: {msg}");
                }
            }
        }
    }

    fn maybe_start_servers(&mut self) {
        if self.srv_started {
            return;
        }
        let Some(srvmgr) = self.srvmgr.clone() else {
            return;
        };
        self.srv_started = true;
        let tx = self.tx.clone();
        // started on the runtime the controller was created on; a bind or
        // listen failure is fatal to the process
        tokio::spawn(async move {
            info!("Starting server manager");
            if let Err(e) = srvmgr.startup().await {
                let _ = tx.send(ControllerMsg::ServerStartupFailed(e));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ember_bitcoind::{BitcoindConfig, RpcError, RpcTransport};
    use ember_storage::StorageConfig;
    use ember_types::RpcMsgId;

    /// Transport that never reaches a daemon; these tests exercise the
    /// message plumbing only.
    struct DeadTransport;

    #[async_trait]
    impl RpcTransport for DeadTransport {
        async fn send_request(
            &self,
            _id: RpcMsgId,
            _method: &str,
            _params: &[Value],
        ) -> Result<Value, RpcError> {
            Err(RpcError::Transport("dead".into()))
        }
    }

    fn test_controller(dir: &tempfile::TempDir) -> Controller {
        let storage = Storage::open(StorageConfig {
            data_dir: dir.path().to_path_buf(),
        })
        .unwrap();
        let mgr = BitcoindMgr::new(Arc::new(DeadTransport), BitcoindConfig::default());
        Controller::new(storage, mgr, SyncConfig::default())
    }

    fn block_at(height: u32) -> PreProcessedBlock {
        PreProcessedBlock {
            height,
            size_bytes: 81,
            header: [0u8; ember_types::HEADER_SIZE],
            tx_infos: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            estimated_mem_bytes: 0,
        }
    }

    #[tokio::test]
    async fn put_block_without_state_machine_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = test_controller(&dir);
        ctl.handle_msg(ControllerMsg::PutBlock {
            task: TaskId(99),
            block: Box::new(block_at(7)),
        })
        .unwrap();
        assert!(ctl.sm.is_none());
        assert_eq!(ctl.storage.header_count(), 0);
    }

    #[tokio::test]
    async fn put_block_for_removed_task_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = test_controller(&dir);
        let mut sm = StateMachine::new(1);
        sm.state = SyncState::DownloadingBlocks;
        sm.end_height = 10;
        ctl.sm = Some(sm);

        // TaskId(99) was never registered
        ctl.handle_msg(ControllerMsg::PutBlock {
            task: TaskId(99),
            block: Box::new(block_at(7)),
        })
        .unwrap();
        assert!(ctl.sm.as_ref().unwrap().pp_blocks.is_empty());
    }

    #[tokio::test]
    async fn put_block_in_failure_state_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = test_controller(&dir);
        let task = TaskId(1);
        ctl.tasks.insert(
            task,
            TaskEntry {
                name: "Task.DL 0 -> 10".into(),
                started_at: Instant::now(),
                dl: None,
                handle: tokio::spawn(async {}),
            },
        );
        let mut sm = StateMachine::new(1);
        sm.state = SyncState::Failure;
        ctl.sm = Some(sm);

        ctl.handle_msg(ControllerMsg::PutBlock {
            task,
            block: Box::new(block_at(7)),
        })
        .unwrap();
        assert!(ctl.sm.as_ref().unwrap().pp_blocks.is_empty());
    }

    #[tokio::test]
    async fn stale_errored_message_after_failure_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = test_controller(&dir);
        let task = TaskId(1);
        ctl.tasks.insert(
            task,
            TaskEntry {
                name: "Task.DL 0 -> 10".into(),
                started_at: Instant::now(),
                dl: None,
                handle: tokio::spawn(async {}),
            },
        );
        let mut sm = StateMachine::new(1);
        sm.state = SyncState::Failure;
        ctl.sm = Some(sm);

        ctl.handle_msg(ControllerMsg::TaskErrored {
            task,
            error_code: 1,
            error_message: "missing 1 headers".into(),
        })
        .unwrap();
        // still in Failure, no re-entry queued beyond what Failure did
        assert_eq!(ctl.sm.as_ref().unwrap().state, SyncState::Failure);
    }

    #[tokio::test]
    async fn timers_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = test_controller(&dir);

        // stopping an absent timer is a no-op
        ctl.stop_timer("pollTimer");

        ctl.call_on_timer_soon("pollTimer", Duration::from_secs(10), false);
        assert!(ctl.timers.contains_key("pollTimer"));
        // re-arming replaces the previous instance
        ctl.call_on_timer_soon("pollTimer", Duration::from_secs(20), false);
        assert_eq!(ctl.timers.len(), 1);
        assert_eq!(
            ctl.timers["pollTimer"].interval,
            Duration::from_secs(20)
        );

        ctl.stop_timer("pollTimer");
        ctl.stop_timer("pollTimer");
        assert!(ctl.timers.is_empty());

        // a fire from a stopped timer is stale and ignored
        ctl.handle_msg(ControllerMsg::TimerFired { name: "pollTimer" })
            .unwrap();
        assert!(ctl.sm.is_none());
    }
}
