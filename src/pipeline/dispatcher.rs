//! Stage dispatcher: admission, merging, and the worker pool.
//!
//! ```text
//!  submit(desc) ──► validate ──► prepare graph (merge top-down)
//!                                     │
//!                      ┌──────────────┴──────────────┐
//!                      ▼                             ▼
//!            ledger.try_acquire(all)          pending queue
//!                      │                             │ (retried on every release)
//!                      ▼                             │
//!               run queue ◄──────────────────────────┘
//!                 │   ▲   ▲
//!                 │   │   └──── parked ◄──┐ Blocked (backoff spent):
//!                 ▼   │ Progress          │ woken when one of its
//!             worker: task.step(quantum) ─┘ buffers changes
//!                 │
//!                 ▼ Finished / Cancelled / error
//!             finalize: close or finish output, release resources,
//!                       return stage, free packet slot, wake waiters
//! ```
//!
//! Stages are cooperative: a worker runs one quantum of a task and puts it
//! back on the queue, so any number of stages can share any number of
//! workers without one blocked stage holding a thread hostage. A stage
//! that stays blocked is parked on its buffers and costs nothing until one
//! of them changes.
//!
//! A packet becomes mergeable once its graph is admitted, never while it
//! waits in the pending queue: a request that attached to a queued packet
//! could be admitted first and hold resources the queued graph needs.

use crate::error::{Result, StageflowError};
use crate::memory::{BlockPool, IndexFreeList};
use crate::pipeline::buffer::tuple_buffer;
use crate::pipeline::id::{PacketId, StageId, WorkerId};
use crate::pipeline::operator::{AnyOperator, StageStatus};
use crate::pipeline::packet::{
    MergeSignature, PacketControl, PacketDescriptor, PacketHandle, PacketInput, PacketState,
};
use crate::pipeline::port::{InputPort, OutputPort};
use crate::pipeline::resources::{ResourceLedger, ResourceSet};
use crate::pipeline::stage::{Stage, StagePolicy, StageTask};
use crate::topology::{self, CpuHandle};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Wake, Waker};
use std::thread::JoinHandle;

/// Runtime parameters for a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker threads.
    pub workers: usize,
    /// CPUs to pin workers to, round-robin. Empty disables pinning.
    pub cpus: Vec<CpuHandle>,
    /// Total admission capacity.
    pub resources: ResourceSet,
    /// Output capacity, in tuples, for packets that do not set one.
    pub default_buffer_capacity: usize,
    /// Bytes per scratch block.
    pub scratch_block_size: usize,
    /// Maximum tuples per step.
    pub quantum_tuples: usize,
    pub stage_policy: StagePolicy,
    /// Packet table size: packets that may exist at once.
    pub max_packets: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            cpus: Vec::new(),
            resources: ResourceSet::new(64, 4096, 64),
            default_buffer_capacity: 1024,
            scratch_block_size: 64 * 1024,
            quantum_tuples: 256,
            stage_policy: StagePolicy::Reuse,
            max_packets: 1024,
        }
    }
}

impl DispatcherConfig {
    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(StageflowError::invalid("dispatcher needs at least one worker"));
        }
        if self.default_buffer_capacity == 0 || self.quantum_tuples == 0 {
            return Err(StageflowError::invalid(
                "buffer capacity and quantum must be non-zero",
            ));
        }
        if self.max_packets == 0 || self.max_packets == u32::MAX {
            return Err(StageflowError::invalid(format!(
                "packet table size {} out of range",
                self.max_packets
            )));
        }
        if self.resources.scratch_blocks > u64::from(u32::MAX - 1) {
            return Err(StageflowError::invalid("too many scratch blocks"));
        }
        Ok(())
    }
}

/// Point-in-time counters, for reports and logs.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub timestamp: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub workers: usize,
    pub submitted: u64,
    pub merged: u64,
    pub admitted: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
    /// Admitted packets not yet finalized.
    pub in_flight: u64,
    /// Graphs waiting for resources.
    pub pending_graphs: usize,
    /// Blocked tasks waiting for a buffer to change.
    pub parked_tasks: usize,
    pub stages_created: u64,
    pub idle_stages: usize,
    pub resources_total: ResourceSet,
    pub resources_in_use: ResourceSet,
    pub scratch_blocks_minted: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    merged: AtomicU64,
    admitted: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
    stages_created: AtomicU64,
}

/// Stands in for a worker when a task is torn down off the worker threads.
const NO_WORKER: WorkerId = WorkerId(u32::MAX);

enum Job {
    Run(StageTask),
    Shutdown,
}

struct PacketSlot {
    generation: u32,
    control: Option<Arc<PacketControl>>,
}

/// Generation-checked packet slots, recycled through a free-list.
struct PacketTable {
    free: IndexFreeList,
    slots: Box<[Mutex<PacketSlot>]>,
}

impl PacketTable {
    fn new(size: u32) -> Self {
        Self {
            free: IndexFreeList::with_all_free(size),
            slots: (0..size)
                .map(|_| {
                    Mutex::new(PacketSlot {
                        generation: 0,
                        control: None,
                    })
                })
                .collect(),
        }
    }

    fn allocate(&self) -> Result<PacketId> {
        let slot = self.free.pop().ok_or_else(|| {
            StageflowError::ResourceExhausted(format!(
                "packet table full ({} packets)",
                self.slots.len()
            ))
        })?;
        let mut entry = self.slots[slot as usize].lock();
        entry.generation = entry.generation.wrapping_add(1);
        Ok(PacketId::new(slot, entry.generation))
    }

    fn install(&self, control: Arc<PacketControl>) {
        let mut entry = self.slots[control.id.index()].lock();
        entry.control = Some(control);
    }

    fn get(&self, id: PacketId) -> Option<Arc<PacketControl>> {
        let entry = self.slots.get(id.index())?.lock();
        if entry.generation != id.generation {
            return None;
        }
        entry.control.clone()
    }

    fn release(&self, id: PacketId) {
        if let Some(slot) = self.slots.get(id.index()) {
            let mut entry = slot.lock();
            if entry.generation == id.generation && entry.control.take().is_some() {
                drop(entry);
                self.free.push(id.slot);
            }
        }
    }
}

/// A blocked task, held until one of its buffers wakes it.
///
/// One per task, created on its first park and dropped at finalize, so a
/// buffer never holds more than one waker for the same task.
struct ParkedTask {
    task: Mutex<Option<StageTask>>,
    shared: Weak<DispatcherShared>,
}

impl Wake for ParkedTask {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.resume(self, NO_WORKER);
        }
    }
}

/// Packets created by one submission, not yet admitted.
struct PreparedGraph {
    tasks: Vec<StageTask>,
    needs: ResourceSet,
    root: Option<Arc<PacketControl>>,
}

impl PreparedGraph {
    fn is_cancelled(&self) -> bool {
        self.root
            .as_ref()
            .is_some_and(|root| root.cancel_requested() || root.output.is_cancelled())
    }
}

/// State shared by the dispatcher, its workers and every packet handle.
pub(crate) struct DispatcherShared {
    config: DispatcherConfig,
    ledger: ResourceLedger,
    scratch: Arc<BlockPool>,
    run_tx: Sender<Job>,
    run_rx: Receiver<Job>,
    packets: PacketTable,
    /// Admitted packets open to merging.
    merges: Mutex<HashMap<MergeSignature, Arc<PacketControl>>>,
    pending: Mutex<VecDeque<PreparedGraph>>,
    parked: Mutex<HashMap<PacketId, Arc<ParkedTask>>>,
    idle_stages: Mutex<Vec<Stage>>,
    next_stage: AtomicU32,
    in_flight: AtomicU64,
    counters: Counters,
    running: AtomicBool,
    started_at: DateTime<Utc>,
}

/// Fixed pool of workers executing admitted packets.
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn the worker pool.
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        config.validate()?;

        let scratch_blocks = (config.resources.scratch_blocks as u32).max(1);
        let scratch = BlockPool::new(config.scratch_block_size, scratch_blocks)?;
        let (run_tx, run_rx) = crossbeam_channel::unbounded();

        let shared = Arc::new(DispatcherShared {
            ledger: ResourceLedger::new(config.resources),
            packets: PacketTable::new(config.max_packets),
            scratch,
            run_tx,
            run_rx,
            merges: Mutex::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            parked: Mutex::new(HashMap::new()),
            idle_stages: Mutex::new(Vec::new()),
            next_stage: AtomicU32::new(0),
            in_flight: AtomicU64::new(0),
            counters: Counters::default(),
            running: AtomicBool::new(true),
            started_at: Utc::now(),
            config,
        });

        let mut workers = Vec::with_capacity(shared.config.workers);
        for index in 0..shared.config.workers {
            let worker = WorkerId(index as u32);
            let cpu = match shared.config.cpus.as_slice() {
                [] => None,
                cpus => Some(cpus[index % cpus.len()]),
            };
            let worker_shared = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name(format!("stageflow-worker-{index}"))
                .spawn(move || worker_loop(worker_shared, worker, cpu));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    let mut partial = Self { shared, workers };
                    partial.shutdown();
                    return Err(StageflowError::Io(e).with_context("spawning worker threads"));
                }
            }
        }

        tracing::info!(
            "Dispatcher started: {} workers, resources {:?}",
            workers.len(),
            shared.ledger.total()
        );

        Ok(Self { shared, workers })
    }

    /// Submit a packet graph.
    ///
    /// The whole graph is validated first; nothing is created if that
    /// fails. Merging is resolved top-down, and the needs of every newly
    /// created packet are admitted together or queued together.
    pub fn submit(&self, desc: PacketDescriptor) -> Result<PacketHandle> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(StageflowError::invalid("dispatcher is shut down"));
        }
        let unmerged = desc.validate(self.shared.config.default_buffer_capacity)?;
        self.shared.ledger.check_feasible(&unmerged)?;

        let mut graph = PreparedGraph {
            tasks: Vec::new(),
            needs: ResourceSet::default(),
            root: None,
        };
        let handle = match self.shared.prepare(desc, &mut graph) {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.abort_graph(graph);
                return Err(err.with_context("preparing packet graph"));
            }
        };
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);

        if graph.tasks.is_empty() {
            // The root merged; nothing new to run.
            return Ok(handle);
        }
        graph.root = Some(Arc::clone(handle.control()));

        let mut pending = self.shared.pending.lock();
        match self.shared.ledger.try_acquire(&graph.needs) {
            Ok(true) => {
                drop(pending);
                self.shared.start_graph(graph)?;
            }
            Ok(false) => {
                tracing::debug!(
                    "Packet {} queued, needs {:?}, available {:?}",
                    handle.id(),
                    graph.needs,
                    self.shared.ledger.available()
                );
                pending.push_back(graph);
            }
            Err(err) => {
                drop(pending);
                self.shared.abort_graph(graph);
                return Err(err);
            }
        }
        Ok(handle)
    }

    /// State of a live packet. `None` once it has been finalized and its
    /// slot freed.
    pub fn packet_state(&self, id: PacketId) -> Option<PacketState> {
        self.shared.packets.get(id).map(|control| control.state())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> DispatcherStats {
        let shared = &self.shared;
        let c = &shared.counters;
        DispatcherStats {
            timestamp: Utc::now(),
            started_at: shared.started_at,
            workers: self.workers.len(),
            submitted: c.submitted.load(Ordering::Relaxed),
            merged: c.merged.load(Ordering::Relaxed),
            admitted: c.admitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            in_flight: shared.in_flight.load(Ordering::Relaxed),
            pending_graphs: shared.pending.lock().len(),
            parked_tasks: shared
                .parked
                .lock()
                .values()
                .filter(|p| p.task.lock().is_some())
                .count(),
            stages_created: c.stages_created.load(Ordering::Relaxed),
            idle_stages: shared.idle_stages.lock().len(),
            resources_total: shared.ledger.total(),
            resources_in_use: shared.ledger.in_use(),
            scratch_blocks_minted: shared.scratch.minted(),
        }
    }

    /// Stop the workers. Queued and running packets are cancelled.
    pub fn shutdown(&mut self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Dispatcher shutting down");

        for _ in 0..self.workers.len() {
            let _ = self.shared.run_tx.send(Job::Shutdown);
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("A worker thread panicked");
            }
        }

        let pending: Vec<_> = self.shared.pending.lock().drain(..).collect();
        for graph in pending {
            self.shared.abort_graph(graph);
        }
        while let Ok(job) = self.shared.run_rx.try_recv() {
            if let Job::Run(task) = job {
                self.shared.finalize(task, NO_WORKER, PacketState::Cancelled);
            }
        }
        let parked: Vec<_> = self.shared.parked.lock().values().cloned().collect();
        for entry in parked {
            self.shared.resume(&entry, NO_WORKER);
        }
        tracing::info!("Dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.workers.len())
            .field("ledger", &self.shared.ledger)
            .finish()
    }
}

impl DispatcherShared {
    /// Turn one descriptor into a handle, merging or creating packets.
    fn prepare(
        self: &Arc<Self>,
        desc: PacketDescriptor,
        graph: &mut PreparedGraph,
    ) -> Result<PacketHandle> {
        let signature = desc.signature();
        if let Some(sig) = &signature {
            if let Some(handle) = self.try_merge(sig) {
                return Ok(handle);
            }
        }

        let needs = desc.resolve_needs(self.config.default_buffer_capacity)?;
        let capacity = desc
            .output_capacity
            .unwrap_or(self.config.default_buffer_capacity);
        let PacketDescriptor {
            operator, inputs, ..
        } = desc;

        let mut ports = Vec::with_capacity(inputs.len());
        for input in inputs {
            let mut upstream = match input {
                PacketInput::Descriptor(child) => self.prepare(child, graph)?,
                PacketInput::Handle(handle) => handle,
            };
            let reader = upstream.take_reader().ok_or_else(|| {
                StageflowError::invalid(format!("input {} has no reader", upstream.id()))
            })?;
            ports.push(InputPort::new(reader));
        }

        graph.needs.add_set(&needs)?;
        let (writer, reader) = tuple_buffer(capacity)?;
        let id = self.packets.allocate()?;
        let control = Arc::new(PacketControl::new(id, operator.name(), writer.handle()));
        self.packets.install(Arc::clone(&control));

        tracing::debug!("Packet {} created ({})", id, operator.name());

        let stage = self.acquire_stage();
        graph.tasks.push(StageTask::new(
            stage,
            Arc::clone(&control),
            operator,
            ports,
            OutputPort::new(writer),
            needs,
            signature.clone(),
        ));

        Ok(PacketHandle::new(
            reader,
            control,
            false,
            signature,
            self.weak(),
        ))
    }

    fn weak(self: &Arc<Self>) -> Weak<Self> {
        Arc::downgrade(self)
    }

    /// Attach to an identical admitted packet whose output is still whole.
    fn try_merge(self: &Arc<Self>, sig: &MergeSignature) -> Option<PacketHandle> {
        let mut merges = self.merges.lock();
        let control = merges.get(sig)?;
        let admitted = matches!(
            control.state(),
            PacketState::Admitted | PacketState::Running
        );
        if !admitted || control.cancel_requested() {
            return None;
        }
        match control.output.attach_reader() {
            Some(reader) => {
                let control = Arc::clone(control);
                self.counters.merged.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Merged request {:?} into packet {}", sig.key(), control.id);
                Some(PacketHandle::new(
                    reader,
                    control,
                    true,
                    Some(sig.clone()),
                    self.weak(),
                ))
            }
            None => {
                merges.remove(sig);
                None
            }
        }
    }

    fn acquire_stage(&self) -> Stage {
        if self.config.stage_policy == StagePolicy::Reuse {
            if let Some(stage) = self.idle_stages.lock().pop() {
                return stage;
            }
        }
        self.counters.stages_created.fetch_add(1, Ordering::Relaxed);
        Stage::new(StageId(self.next_stage.fetch_add(1, Ordering::Relaxed)))
    }

    fn return_stage(&self, stage: Stage) {
        match self.config.stage_policy {
            StagePolicy::Reuse => self.idle_stages.lock().push(stage),
            StagePolicy::SpawnNew => drop(stage),
        }
    }

    /// Resources are already held: hand out scratch blocks and queue tasks.
    fn start_graph(&self, graph: PreparedGraph) -> Result<()> {
        let count = graph.tasks.len() as u64;
        self.counters.admitted.fetch_add(count, Ordering::Relaxed);
        self.in_flight.fetch_add(count, Ordering::Relaxed);

        let mut first_error = None;
        for mut task in graph.tasks {
            task.packet.set_state(PacketState::Admitted);
            if task.granted.scratch_blocks > 0 {
                match self.scratch.checkout() {
                    Ok(Some(block)) => task.set_scratch(block),
                    Ok(None) => {
                        first_error.get_or_insert_with(|| {
                            StageflowError::ResourceExhausted("scratch pool empty".into())
                        });
                        self.finalize(task, NO_WORKER, PacketState::Cancelled);
                        continue;
                    }
                    Err(err) => {
                        task.packet.set_error(err.to_string());
                        first_error.get_or_insert(err);
                        self.finalize(task, NO_WORKER, PacketState::Cancelled);
                        continue;
                    }
                }
            }
            if !self.running.load(Ordering::Acquire) {
                self.finalize(task, NO_WORKER, PacketState::Cancelled);
                continue;
            }
            if let Some(sig) = &task.signature {
                self.merges
                    .lock()
                    .insert(sig.clone(), Arc::clone(&task.packet));
            }
            if let Err(err) = self.run_tx.send(Job::Run(task)) {
                if let Job::Run(task) = err.into_inner() {
                    self.finalize(task, NO_WORKER, PacketState::Cancelled);
                }
                first_error.get_or_insert_with(|| {
                    StageflowError::Channel("run queue disconnected".to_string())
                });
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Undo a graph that never got resources.
    fn abort_graph(&self, graph: PreparedGraph) {
        for task in graph.tasks {
            let id = task.packet.id;
            let signature = task.signature.clone();
            let packet = Arc::clone(&task.packet);
            let (stage, _) = task.finish(NO_WORKER, PacketState::Cancelled);
            self.return_stage(stage);
            self.forget(id, signature.as_ref());
            packet.set_state(PacketState::Cancelled);
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn forget(&self, id: PacketId, signature: Option<&MergeSignature>) {
        if let Some(sig) = signature {
            let mut merges = self.merges.lock();
            if merges.get(sig).is_some_and(|control| control.id == id) {
                merges.remove(sig);
            }
        }
        self.packets.release(id);
    }

    /// Tear down a task that will not run again.
    fn finalize(&self, task: StageTask, worker: WorkerId, outcome: PacketState) {
        let id = task.packet.id;
        let signature = task.signature.clone();
        let packet = Arc::clone(&task.packet);
        let name = task.operator_name().to_string();

        let (stage, granted) = task.finish(worker, outcome);
        self.return_stage(stage);
        self.forget(id, signature.as_ref());
        self.parked.lock().remove(&id);
        self.ledger.release(&granted);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            PacketState::Completed => self.counters.completed.fetch_add(1, Ordering::Relaxed),
            _ => self.counters.cancelled.fetch_add(1, Ordering::Relaxed),
        };
        packet.set_state(outcome);
        tracing::debug!("Packet {} ({}) {:?}", id, name, outcome);

        self.admit_pending();
    }

    /// Admit queued graphs that fit now, in arrival order, skipping ones
    /// that still do not fit.
    fn admit_pending(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let ready = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return;
            }
            let mut ready = Vec::new();
            let mut dropped = Vec::new();
            let mut waiting = VecDeque::with_capacity(pending.len());
            for graph in pending.drain(..) {
                if graph.is_cancelled() {
                    dropped.push(graph);
                    continue;
                }
                match self.ledger.try_acquire(&graph.needs) {
                    Ok(true) => ready.push(graph),
                    Ok(false) => waiting.push_back(graph),
                    Err(_) => dropped.push(graph),
                }
            }
            *pending = waiting;
            drop(pending);
            for graph in dropped {
                self.abort_graph(graph);
            }
            ready
        };

        for graph in ready {
            if let Err(err) = self.start_graph(graph) {
                tracing::warn!("Failed to start queued graph: {}", err);
            }
        }
    }

    /// Suspend a blocked task until one of its buffers changes.
    ///
    /// The task is stored before the wakers are registered, and a buffer
    /// that changed since the step began refuses registration, so a change
    /// at any point either wakes the stored task or resumes it right here.
    fn park(self: &Arc<Self>, task: StageTask, worker: WorkerId) {
        let id = task.packet.id;
        let watched = task.watched().to_vec();
        let entry = Arc::clone(self.parked.lock().entry(id).or_insert_with(|| {
            Arc::new(ParkedTask {
                task: Mutex::new(None),
                shared: self.weak(),
            })
        }));
        *entry.task.lock() = Some(task);

        let waker = Waker::from(Arc::clone(&entry));
        let unchanged = watched
            .iter()
            .all(|(buffer, seen)| buffer.register_waker(&waker, *seen));
        if !unchanged || !self.running.load(Ordering::Acquire) {
            self.resume(&entry, worker);
        }
    }

    /// Put a parked task back on the run queue. A no-op if it was already
    /// resumed.
    fn resume(&self, entry: &ParkedTask, worker: WorkerId) {
        let task = entry.task.lock().take();
        let Some(task) = task else {
            return;
        };
        if self.running.load(Ordering::Acquire) {
            requeue(self, task, worker);
        } else {
            self.finalize(task, worker, PacketState::Cancelled);
        }
    }

    /// Drop queued graphs whose root was cancelled.
    pub(crate) fn prune_pending(&self) {
        let cancelled: Vec<_> = {
            let mut pending = self.pending.lock();
            let (dead, live): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(PreparedGraph::is_cancelled);
            pending.extend(live);
            dead
        };
        for graph in cancelled {
            self.abort_graph(graph);
        }
    }
}

fn worker_loop(shared: Arc<DispatcherShared>, worker: WorkerId, cpu: Option<CpuHandle>) {
    if let Some(cpu) = cpu {
        match topology::bind_to_cpu(cpu) {
            Ok(()) => tracing::debug!("{} pinned to {}", worker, cpu),
            Err(e) => tracing::warn!("{} could not be pinned to {}: {}", worker, cpu, e),
        }
    }
    tracing::debug!("{} started", worker);

    let quantum = shared.config.quantum_tuples;
    while let Ok(job) = shared.run_rx.recv() {
        let mut task = match job {
            Job::Run(task) => task,
            Job::Shutdown => break,
        };
        if !shared.running.load(Ordering::Acquire) {
            shared.finalize(task, worker, PacketState::Cancelled);
            continue;
        }

        match task.step(worker, quantum) {
            Ok(StageStatus::Progress) => {
                task.backoff().reset();
                requeue(&shared, task, worker);
            }
            Ok(StageStatus::Blocked) => {
                if task.backoff().is_completed() {
                    shared.park(task, worker);
                } else {
                    task.backoff().snooze();
                    requeue(&shared, task, worker);
                }
            }
            Ok(StageStatus::Finished) => shared.finalize(task, worker, PacketState::Completed),
            Ok(StageStatus::Cancelled) => shared.finalize(task, worker, PacketState::Cancelled),
            Err(e) => {
                tracing::warn!(
                    "Packet {} ({}) failed: {}",
                    task.packet.id,
                    task.operator_name(),
                    e
                );
                task.packet.set_error(e.to_string());
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                shared.finalize(task, worker, PacketState::Cancelled);
            }
        }
    }
    tracing::debug!("{} exiting", worker);
}

fn requeue(shared: &DispatcherShared, task: StageTask, worker: WorkerId) {
    if let Err(err) = shared.run_tx.send(Job::Run(task)) {
        if let Job::Run(task) = err.into_inner() {
            shared.finalize(task, worker, PacketState::Cancelled);
        }
    }
}
