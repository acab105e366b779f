//! Operator abstraction for stages.
//!
//! Two-layer design:
//! - **`OperatorPlugin` trait**: for user-defined operators.
//! - **`BuiltinOperator` enum**: for the built-in operators. Match arms are
//!   inlined, so the per-step call has no dynamic dispatch.
//!
//! `AnyOperator` wraps either variant so the dispatcher can handle both
//! uniformly.
//!
//! Operators are cooperative. `on_data` runs one step of at most
//! `ctx.quantum` tuples and reports whether the stage made progress, is
//! waiting on a buffer, or is done.

use crate::error::{Result, StageflowError};
use crate::memory::PoolBlock;
use crate::pipeline::id::{PacketId, WorkerId};
use crate::pipeline::operators::{AggregateOperator, FilterOperator, ScanOperator};
use crate::pipeline::port::{EmitStatus, InputPoll, InputPort, OutputPort, PortDescriptor};
use crate::pipeline::tuple::Tuple;

/// What a stage step achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// Did work and can do more right away.
    Progress,
    /// Waiting for input or output space. The stage is not stepped again
    /// until one of its buffers changes.
    Blocked,
    /// Output is complete.
    Finished,
    /// An input or the output was cancelled.
    Cancelled,
}

/// Context passed to operator hooks for each step.
pub struct StageContext<'a> {
    /// Upstream buffers, in port order.
    pub inputs: &'a mut [InputPort],
    /// This packet's output buffer.
    pub output: &'a mut OutputPort,
    /// Scratch page, present when the operator asked for one.
    pub scratch: Option<&'a mut PoolBlock>,
    /// Maximum tuples to handle in this step.
    pub quantum: usize,
    pub worker: WorkerId,
    pub packet: PacketId,
}

impl<'a> StageContext<'a> {
    /// Hand a tuple downstream. On `Full` the port keeps it.
    #[inline]
    pub fn emit(&mut self, tuple: Tuple) -> Result<EmitStatus> {
        self.output.emit(tuple)
    }

    /// Poll input `port` without blocking.
    pub fn poll(&mut self, port: usize) -> Result<InputPoll> {
        self.inputs
            .get_mut(port)
            .map(InputPort::poll)
            .ok_or_else(|| StageflowError::invalid(format!("no input port {port}")))
    }

    /// The scratch page, or an error if none was checked out.
    pub fn scratch(&mut self) -> Result<&mut [u8]> {
        self.scratch
            .as_deref_mut()
            .map(|block| &mut **block)
            .ok_or_else(|| StageflowError::invalid("operator has no scratch page"))
    }
}

/// Trait for pluggable operators.
pub trait OperatorPlugin: Send {
    /// Human-readable name of this operator.
    fn name(&self) -> &str;

    /// Port descriptors for this operator.
    fn ports(&self) -> &[PortDescriptor];

    /// Whether the stage should check out a scratch page for this operator.
    fn needs_scratch(&self) -> bool {
        false
    }

    /// Called once before the first step.
    fn on_activate(&mut self, _ctx: &mut StageContext) -> Result<()> {
        Ok(())
    }

    /// Run one step.
    fn on_data(&mut self, ctx: &mut StageContext) -> Result<StageStatus>;

    /// Called once after the last step, whatever the outcome.
    fn on_deactivate(&mut self, _ctx: &mut StageContext) {}
}

/// Enum dispatch for built-in operators.
pub enum BuiltinOperator {
    Scan(ScanOperator),
    Filter(FilterOperator),
    Aggregate(AggregateOperator),
}

impl BuiltinOperator {
    pub fn name(&self) -> &str {
        match self {
            BuiltinOperator::Scan(op) => op.name(),
            BuiltinOperator::Filter(op) => op.name(),
            BuiltinOperator::Aggregate(op) => op.name(),
        }
    }

    pub fn ports(&self) -> &[PortDescriptor] {
        match self {
            BuiltinOperator::Scan(op) => op.ports(),
            BuiltinOperator::Filter(op) => op.ports(),
            BuiltinOperator::Aggregate(op) => op.ports(),
        }
    }

    pub fn needs_scratch(&self) -> bool {
        matches!(self, BuiltinOperator::Scan(_))
    }

    pub fn on_activate(&mut self, ctx: &mut StageContext) -> Result<()> {
        match self {
            BuiltinOperator::Scan(op) => op.on_activate(ctx),
            BuiltinOperator::Filter(_) | BuiltinOperator::Aggregate(_) => Ok(()),
        }
    }

    pub fn on_data(&mut self, ctx: &mut StageContext) -> Result<StageStatus> {
        match self {
            BuiltinOperator::Scan(op) => op.on_data(ctx),
            BuiltinOperator::Filter(op) => op.on_data(ctx),
            BuiltinOperator::Aggregate(op) => op.on_data(ctx),
        }
    }

    pub fn on_deactivate(&mut self, ctx: &mut StageContext) {
        match self {
            BuiltinOperator::Scan(_) | BuiltinOperator::Filter(_) => {}
            BuiltinOperator::Aggregate(op) => op.on_deactivate(ctx),
        }
    }
}

/// Wrapper that holds either a built-in operator (enum dispatch) or a
/// plugin (trait object).
pub enum AnyOperator {
    Builtin(BuiltinOperator),
    Plugin(Box<dyn OperatorPlugin>),
}

impl AnyOperator {
    pub fn scan(op: ScanOperator) -> Self {
        AnyOperator::Builtin(BuiltinOperator::Scan(op))
    }

    pub fn filter(op: FilterOperator) -> Self {
        AnyOperator::Builtin(BuiltinOperator::Filter(op))
    }

    pub fn aggregate(op: AggregateOperator) -> Self {
        AnyOperator::Builtin(BuiltinOperator::Aggregate(op))
    }

    pub fn plugin(op: impl OperatorPlugin + 'static) -> Self {
        AnyOperator::Plugin(Box::new(op))
    }

    pub fn name(&self) -> &str {
        match self {
            AnyOperator::Builtin(op) => op.name(),
            AnyOperator::Plugin(op) => op.name(),
        }
    }

    pub fn ports(&self) -> &[PortDescriptor] {
        match self {
            AnyOperator::Builtin(op) => op.ports(),
            AnyOperator::Plugin(op) => op.ports(),
        }
    }

    pub fn needs_scratch(&self) -> bool {
        match self {
            AnyOperator::Builtin(op) => op.needs_scratch(),
            AnyOperator::Plugin(op) => op.needs_scratch(),
        }
    }

    pub fn on_activate(&mut self, ctx: &mut StageContext) -> Result<()> {
        match self {
            AnyOperator::Builtin(op) => op.on_activate(ctx),
            AnyOperator::Plugin(op) => op.on_activate(ctx),
        }
    }

    pub fn on_data(&mut self, ctx: &mut StageContext) -> Result<StageStatus> {
        match self {
            AnyOperator::Builtin(op) => op.on_data(ctx),
            AnyOperator::Plugin(op) => op.on_data(ctx),
        }
    }

    pub fn on_deactivate(&mut self, ctx: &mut StageContext) {
        match self {
            AnyOperator::Builtin(op) => op.on_deactivate(ctx),
            AnyOperator::Plugin(op) => op.on_deactivate(ctx),
        }
    }
}

impl std::fmt::Debug for AnyOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AnyOperator").field(&self.name()).finish()
    }
}

/// Build a `Stage` error for operator `name`.
pub(crate) fn stage_error(name: &str, message: impl Into<String>) -> StageflowError {
    StageflowError::Stage {
        stage: name.to_string(),
        message: message.into(),
    }
}
