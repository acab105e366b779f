//! Staged dataflow pipeline.
//!
//! Tuples flow from operator to operator through bounded buffers. Each
//! operator runs inside a stage, and stages are multiplexed over a fixed
//! pool of workers by the [`Dispatcher`].
//!
//! # Architecture
//!
//! ```text
//! [Scan] ──buffer──► [Filter] ──buffer──► [Aggregate] ──buffer──► PacketHandle
//!                                                       └──────► PacketHandle (merged)
//! ```
//!
//! # Design
//!
//! - **Enum dispatch on hot path**: `BuiltinOperator` enum for the built-in operators,
//!   boxed trait objects only for plugins.
//! - **Cooperative stages**: an operator runs a bounded quantum and reports
//!   `Blocked` instead of waiting, so a worker is never parked on a buffer.
//! - **Atomic admission**: a packet graph acquires all of its resources at
//!   once or waits in the pending queue as a whole.
//! - **Merging**: identical in-flight requests share one output buffer.

pub mod buffer;
pub mod dispatcher;
pub mod id;
pub mod operator;
pub mod operators;
pub mod packet;
pub mod port;
pub mod resources;
pub mod source;
pub mod stage;
pub mod tuple;

pub use buffer::{
    tuple_buffer, BufferHandle, BufferState, ReadStatus, TupleReader, TupleWriter, WriteStatus,
};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats};
pub use id::{PacketId, StageId, WorkerId};
pub use operator::{AnyOperator, BuiltinOperator, OperatorPlugin, StageContext, StageStatus};
pub use operators::{
    AggregateFunction, AggregateOperator, AggregateSpec, CmpOp, FilterOperator, Predicate,
    ScanOperator,
};
pub use packet::{
    MergeKey, MergeSignature, PacketDescriptor, PacketHandle, PacketInput, PacketState,
};
pub use port::{EmitStatus, InputPoll, InputPort, OutputPort, PortDescriptor, PortDirection};
pub use resources::{ResourceKind, ResourceLedger, ResourceNeed, ResourceSet};
pub use source::{MemoryTable, PageId, PageSource};
pub use stage::{Stage, StagePolicy, StageStats};
pub use tuple::{Tuple, TuplePage, MAX_TUPLE_COLUMNS, TUPLE_ENCODED_SIZE};
