//! Built-in operator implementations.

pub mod aggregate;
pub mod filter;
pub mod scan;

pub use aggregate::{AggregateFunction, AggregateOperator, AggregateSpec};
pub use filter::{CmpOp, FilterOperator, Predicate};
pub use scan::ScanOperator;
