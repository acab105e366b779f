//! Packets: units of work handed to the dispatcher.
//!
//! A [`PacketDescriptor`] names an operator, its inputs (nested descriptors
//! or already-submitted packets), the size of its output buffer, what it
//! will hold while running, and an optional merge key. Submitting a
//! descriptor yields a [`PacketHandle`] for reading the output.
//!
//! Two descriptors with the same merge key over inputs with the same merge
//! signatures describe the same computation. While the first one's output
//! has not released any tuple, the second attaches as an extra reader
//! instead of running again.

use crate::error::{Result, StageflowError};
use crate::pipeline::buffer::{BufferHandle, ReadStatus, TupleReader};
use crate::pipeline::dispatcher::DispatcherShared;
use crate::pipeline::id::PacketId;
use crate::pipeline::operator::AnyOperator;
use crate::pipeline::port::input_count;
use crate::pipeline::resources::{ResourceKind, ResourceNeed, ResourceSet};
use crate::pipeline::tuple::Tuple;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Caller-chosen name for a computation, e.g. `"scan:orders"`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MergeKey(String);

impl MergeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MergeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MergeKey({:?})", self.0)
    }
}

impl From<&str> for MergeKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Structural identity of a mergeable packet: its key plus the identity of
/// every input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergeSignature {
    key: MergeKey,
    inputs: Vec<MergeSignature>,
}

impl MergeSignature {
    pub fn key(&self) -> &MergeKey {
        &self.key
    }
}

/// Packet lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketState {
    Created = 0,
    Admitted = 1,
    Running = 2,
    Completed = 3,
    Cancelled = 4,
}

impl PacketState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => PacketState::Created,
            1 => PacketState::Admitted,
            2 => PacketState::Running,
            3 => PacketState::Completed,
            _ => PacketState::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PacketState::Completed | PacketState::Cancelled)
    }
}

/// Where a packet's input tuples come from.
pub enum PacketInput {
    /// A nested packet, submitted together with its parent.
    Descriptor(PacketDescriptor),
    /// An already-submitted packet; its reader moves to the parent.
    Handle(PacketHandle),
}

impl From<PacketDescriptor> for PacketInput {
    fn from(desc: PacketDescriptor) -> Self {
        PacketInput::Descriptor(desc)
    }
}

impl From<PacketHandle> for PacketInput {
    fn from(handle: PacketHandle) -> Self {
        PacketInput::Handle(handle)
    }
}

/// Request for an operator to process a stream of tuples.
pub struct PacketDescriptor {
    pub merge_key: Option<MergeKey>,
    pub operator: AnyOperator,
    /// Explicit declaration; `None` derives one from the operator and the
    /// output capacity.
    pub resource_needs: Option<Vec<ResourceNeed>>,
    pub inputs: Vec<PacketInput>,
    /// Output buffer capacity in tuples; `None` uses the dispatcher default.
    pub output_capacity: Option<usize>,
}

impl PacketDescriptor {
    pub fn new(operator: AnyOperator) -> Self {
        Self {
            merge_key: None,
            operator,
            resource_needs: None,
            inputs: Vec::new(),
            output_capacity: None,
        }
    }

    pub fn with_merge_key(mut self, key: impl Into<MergeKey>) -> Self {
        self.merge_key = Some(key.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<PacketInput>) -> Self {
        self.inputs.push(input.into());
        self
    }

    pub fn with_output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = Some(capacity);
        self
    }

    pub fn with_resources(mut self, needs: Vec<ResourceNeed>) -> Self {
        self.resource_needs = Some(needs);
        self
    }

    /// Merge signature, if this packet and all of its inputs are mergeable.
    pub fn signature(&self) -> Option<MergeSignature> {
        let key = self.merge_key.clone()?;
        let inputs = self
            .inputs
            .iter()
            .map(|input| match input {
                PacketInput::Descriptor(desc) => desc.signature(),
                PacketInput::Handle(handle) => handle.signature.clone(),
            })
            .collect::<Option<Vec<_>>>()?;
        Some(MergeSignature { key, inputs })
    }

    /// Resources this packet holds while running.
    pub fn resolve_needs(&self, default_capacity: usize) -> Result<ResourceSet> {
        let needs = match &self.resource_needs {
            Some(explicit) => ResourceSet::from_needs(explicit)?,
            None => {
                let capacity = self.output_capacity.unwrap_or(default_capacity);
                let bytes = capacity.saturating_mul(std::mem::size_of::<Tuple>());
                let pages = bytes.div_ceil(crate::memory::page_size()).max(1) as u64;
                let mut set = ResourceSet::new(1, pages, 0);
                if self.operator.needs_scratch() {
                    set.add(ResourceKind::ScratchBlocks, 1)?;
                }
                set
            }
        };
        if self.operator.needs_scratch() && needs.scratch_blocks == 0 {
            return Err(StageflowError::invalid(format!(
                "operator '{}' needs a scratch block but declares none",
                self.operator.name()
            )));
        }
        Ok(needs)
    }

    /// Check the whole graph without touching any shared state. Returns the
    /// needs of the graph as if nothing merged.
    pub(crate) fn validate(&self, default_capacity: usize) -> Result<ResourceSet> {
        if self.output_capacity == Some(0) {
            return Err(StageflowError::invalid(format!(
                "'{}' has zero output capacity",
                self.operator.name()
            )));
        }
        let expected = input_count(self.operator.ports());
        if self.inputs.len() != expected {
            return Err(StageflowError::invalid(format!(
                "'{}' takes {expected} inputs, got {}",
                self.operator.name(),
                self.inputs.len()
            )));
        }

        let mut total = self.resolve_needs(default_capacity)?;
        for input in &self.inputs {
            match input {
                PacketInput::Descriptor(desc) => total.add_set(&desc.validate(default_capacity)?)?,
                PacketInput::Handle(handle) => {
                    if handle.reader.is_none() {
                        return Err(StageflowError::invalid(format!(
                            "input {} has no reader left to hand over",
                            handle.id
                        )));
                    }
                }
            }
        }
        Ok(total)
    }
}

impl fmt::Debug for PacketDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketDescriptor")
            .field("operator", &self.operator.name())
            .field("merge_key", &self.merge_key)
            .field("inputs", &self.inputs.len())
            .field("output_capacity", &self.output_capacity)
            .finish()
    }
}

/// State shared between the dispatcher and every handle of one packet.
pub(crate) struct PacketControl {
    pub(crate) id: PacketId,
    pub(crate) name: String,
    state: AtomicU8,
    cancel_requested: AtomicBool,
    pub(crate) output: BufferHandle,
    error: Mutex<Option<String>>,
    done: Mutex<()>,
    done_cv: Condvar,
}

impl PacketControl {
    pub(crate) fn new(id: PacketId, name: impl Into<String>, output: BufferHandle) -> Self {
        Self {
            id,
            name: name.into(),
            state: AtomicU8::new(PacketState::Created as u8),
            cancel_requested: AtomicBool::new(false),
            output,
            error: Mutex::new(None),
            done: Mutex::new(()),
            done_cv: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> PacketState {
        PacketState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: PacketState) {
        let _guard = self.done.lock();
        self.state.store(state as u8, Ordering::Release);
        if state.is_terminal() {
            self.done_cv.notify_all();
        }
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
        self.output.close();
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    pub(crate) fn set_error(&self, message: String) {
        *self.error.lock() = Some(message);
    }

    pub(crate) fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    fn wait_until(&self, deadline: Option<Instant>) -> PacketState {
        let mut guard = self.done.lock();
        loop {
            let state = self.state();
            if state.is_terminal() {
                return state;
            }
            match deadline {
                None => self.done_cv.wait(&mut guard),
                Some(deadline) => {
                    if self.done_cv.wait_until(&mut guard, deadline).timed_out() {
                        return self.state();
                    }
                }
            }
        }
    }
}

/// Client view of a submitted packet.
///
/// The owning handle (the one whose submission created the packet) can
/// cancel the computation. A merged handle shares the output of an earlier
/// identical packet; cancelling it only detaches its own reader.
pub struct PacketHandle {
    id: PacketId,
    reader: Option<TupleReader>,
    control: Arc<PacketControl>,
    merged: bool,
    signature: Option<MergeSignature>,
    dispatcher: Weak<DispatcherShared>,
}

impl PacketHandle {
    pub(crate) fn new(
        reader: TupleReader,
        control: Arc<PacketControl>,
        merged: bool,
        signature: Option<MergeSignature>,
        dispatcher: Weak<DispatcherShared>,
    ) -> Self {
        Self {
            id: control.id,
            reader: Some(reader),
            control,
            merged,
            signature,
            dispatcher,
        }
    }

    pub fn id(&self) -> PacketId {
        self.id
    }

    pub(crate) fn control(&self) -> &Arc<PacketControl> {
        &self.control
    }

    /// Name of the operator producing this output.
    pub fn operator_name(&self) -> &str {
        &self.control.name
    }

    pub fn state(&self) -> PacketState {
        self.control.state()
    }

    /// Whether this handle attached to another submission's output.
    pub fn is_merged(&self) -> bool {
        self.merged
    }

    pub fn signature(&self) -> Option<&MergeSignature> {
        self.signature.as_ref()
    }

    /// Blocking read. Returns `Exhausted` once the reader was taken.
    pub fn read(&self) -> ReadStatus {
        self.reader
            .as_ref()
            .map_or(ReadStatus::Exhausted, TupleReader::read)
    }

    pub fn try_read(&self) -> ReadStatus {
        self.reader
            .as_ref()
            .map_or(ReadStatus::Exhausted, TupleReader::try_read)
    }

    pub fn read_timeout(&self, timeout: Duration) -> ReadStatus {
        self.reader
            .as_ref()
            .map_or(ReadStatus::Exhausted, |r| r.read_timeout(timeout))
    }

    /// Read until exhaustion.
    pub fn collect(&self) -> Vec<Tuple> {
        let mut rows = Vec::new();
        while let ReadStatus::Tuple(tuple) = self.read() {
            rows.push(tuple);
        }
        rows
    }

    /// Move the reader out, e.g. to feed it to another stage.
    pub fn take_reader(&mut self) -> Option<TupleReader> {
        self.reader.take()
    }

    /// Whether the output ended because of cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.control.output.is_cancelled()
    }

    /// Block until the packet completes or is cancelled.
    ///
    /// The output must be consumed (or its reader dropped) for a producer
    /// with a full buffer to finish.
    pub fn wait(&self) -> PacketState {
        self.control.wait_until(None)
    }

    /// Like [`wait`](Self::wait), returning the current state on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> PacketState {
        self.control.wait_until(Instant::now().checked_add(timeout))
    }

    /// Cancel the packet, or detach if this handle is merged.
    pub fn cancel(&mut self) {
        if self.merged {
            self.reader = None;
            return;
        }
        tracing::debug!("Cancel requested for packet {}", self.id);
        self.control.request_cancel();
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.prune_pending();
        }
    }

    /// Message of the operator error that cancelled the packet, if any.
    pub fn error(&self) -> Option<String> {
        self.control.error()
    }
}

impl fmt::Debug for PacketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketHandle")
            .field("id", &self.id)
            .field("operator", &self.control.name)
            .field("state", &self.state())
            .field("merged", &self.merged)
            .finish()
    }
}
