//! FilterOperator: passes tuples that satisfy a single-column predicate.
//!
//! A predicate compares one column against a constant. In inverted mode the
//! operator passes exactly the tuples the predicate rejects. Tuples that are
//! too narrow to have the column never pass.

use crate::error::Result;
use crate::pipeline::operator::{StageContext, StageStatus};
use crate::pipeline::port::{EmitStatus, InputPoll, PortDescriptor};
use crate::pipeline::tuple::Tuple;
use serde::{Deserialize, Serialize};

static PORTS: &[PortDescriptor] = &[PortDescriptor::input("in"), PortDescriptor::output("out")];

/// Comparison used by a [`Predicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// `tuple[column] <op> value`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Predicate {
    pub column: usize,
    pub op: CmpOp,
    pub value: i64,
}

impl Predicate {
    pub const fn new(column: usize, op: CmpOp, value: i64) -> Self {
        Self { column, op, value }
    }

    pub fn matches(&self, tuple: &Tuple) -> bool {
        let Some(lhs) = tuple.get(self.column) else {
            return false;
        };
        match self.op {
            CmpOp::Eq => lhs == self.value,
            CmpOp::Ne => lhs != self.value,
            CmpOp::Lt => lhs < self.value,
            CmpOp::Le => lhs <= self.value,
            CmpOp::Gt => lhs > self.value,
            CmpOp::Ge => lhs >= self.value,
        }
    }
}

/// Filter operator.
pub struct FilterOperator {
    predicate: Predicate,
    /// Pass rejected tuples instead of matching ones.
    invert_mode: bool,
    passed: u64,
    dropped: u64,
}

impl FilterOperator {
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            invert_mode: false,
            passed: 0,
            dropped: 0,
        }
    }

    pub fn inverted(mut self) -> Self {
        self.invert_mode = true;
        self
    }

    pub fn name(&self) -> &str {
        "Filter"
    }

    pub fn ports(&self) -> &[PortDescriptor] {
        PORTS
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// Check if invert mode is enabled.
    pub fn invert_mode(&self) -> bool {
        self.invert_mode
    }

    pub fn passed(&self) -> u64 {
        self.passed
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn on_data(&mut self, ctx: &mut StageContext) -> Result<StageStatus> {
        let mut worked = false;

        for _ in 0..ctx.quantum {
            let tuple = match ctx.poll(0)? {
                InputPoll::Tuple(tuple) => tuple,
                InputPoll::Empty => {
                    return Ok(if worked {
                        StageStatus::Progress
                    } else {
                        StageStatus::Blocked
                    })
                }
                InputPoll::Exhausted => return Ok(StageStatus::Finished),
                InputPoll::Cancelled => return Ok(StageStatus::Cancelled),
            };
            worked = true;

            // Pass if: (matches AND !invert) OR (!matches AND invert)
            if self.predicate.matches(&tuple) == self.invert_mode {
                self.dropped += 1;
                continue;
            }
            self.passed += 1;
            match ctx.emit(tuple)? {
                EmitStatus::Accepted => {}
                EmitStatus::Full => return Ok(StageStatus::Blocked),
                EmitStatus::Closed => return Ok(StageStatus::Cancelled),
            }
        }

        Ok(StageStatus::Progress)
    }
}
