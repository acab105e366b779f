//! # stageflow: staged multi-threaded dataflow engine
//!
//! Queries are expressed as graphs of packets. Each packet runs one
//! operator (scan, filter, aggregate, or a plugin) inside a stage, reading
//! tuples from bounded buffers and writing to its own output buffer. A fixed
//! pool of workers multiplexes the stages cooperatively.
//!
//! ## Architecture
//!
//! - **Memory**: growable reserved regions, a lock-free versioned free-list
//!   and a block pool built on both
//! - **Pipeline**: tuple buffers with backpressure and cancellation,
//!   operators, packets with merging, and the dispatcher with atomic
//!   resource admission
//! - **Topology**: CPU discovery and worker pinning
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stageflow::pipeline::{
//!     AnyOperator, CmpOp, Dispatcher, DispatcherConfig, FilterOperator, MemoryTable,
//!     PacketDescriptor, Predicate, ScanOperator, Tuple,
//! };
//!
//! # fn main() -> stageflow::Result<()> {
//! let table: MemoryTable = (0..1000).map(|i| Tuple::pair(i % 10, i)).collect();
//! let dispatcher = Dispatcher::new(DispatcherConfig::default())?;
//!
//! let query = PacketDescriptor::new(AnyOperator::filter(FilterOperator::new(
//!     Predicate::new(0, CmpOp::Eq, 3),
//! )))
//! .with_input(PacketDescriptor::new(AnyOperator::scan(ScanOperator::new(Arc::new(table)))));
//!
//! let handle = dispatcher.submit(query)?;
//! assert_eq!(handle.collect().len(), 100);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod pipeline;
pub mod topology;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{Result, ResultExt, StageflowError};
pub use pipeline::{Dispatcher, DispatcherConfig, PacketDescriptor, PacketHandle};
