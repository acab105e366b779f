//! AggregateOperator: grouped or global aggregation.
//!
//! Consumes its whole input, then emits one tuple per group in ascending key
//! order: `(key, value)` when grouping, `(value)` otherwise. A global
//! `Count` or `Sum` over empty input emits `0`; a global `Min` or `Max` over
//! empty input emits nothing.

use crate::error::Result;
use crate::pipeline::operator::{stage_error, StageContext, StageStatus};
use crate::pipeline::port::{EmitStatus, InputPoll, PortDescriptor};
use crate::pipeline::tuple::Tuple;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

static PORTS: &[PortDescriptor] = &[PortDescriptor::input("in"), PortDescriptor::output("out")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
}

/// What to aggregate and how to group it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Column whose value is the group key. `None` aggregates globally.
    pub group_by: Option<usize>,
    /// Column fed to the function. Ignored by `Count`.
    pub column: usize,
    pub function: AggregateFunction,
}

impl AggregateSpec {
    pub const fn global(function: AggregateFunction, column: usize) -> Self {
        Self {
            group_by: None,
            column,
            function,
        }
    }

    pub const fn grouped(group_by: usize, function: AggregateFunction, column: usize) -> Self {
        Self {
            group_by: Some(group_by),
            column,
            function,
        }
    }
}

enum Phase {
    Accumulating,
    Emitting { rows: Vec<Tuple>, next: usize },
}

/// Aggregation operator.
pub struct AggregateOperator {
    spec: AggregateSpec,
    groups: BTreeMap<i64, i64>,
    phase: Phase,
}

impl AggregateOperator {
    pub fn new(spec: AggregateSpec) -> Self {
        Self {
            spec,
            groups: BTreeMap::new(),
            phase: Phase::Accumulating,
        }
    }

    pub fn name(&self) -> &str {
        "Aggregate"
    }

    pub fn ports(&self) -> &[PortDescriptor] {
        PORTS
    }

    pub fn spec(&self) -> &AggregateSpec {
        &self.spec
    }

    fn column(&self, tuple: &Tuple, column: usize) -> Result<i64> {
        tuple.get(column).ok_or_else(|| {
            stage_error(
                self.name(),
                format!("tuple of arity {} has no column {column}", tuple.arity()),
            )
        })
    }

    fn accumulate(&mut self, tuple: &Tuple) -> Result<()> {
        let key = match self.spec.group_by {
            Some(column) => self.column(tuple, column)?,
            None => 0,
        };
        let value = match self.spec.function {
            AggregateFunction::Count => 1,
            _ => self.column(tuple, self.spec.column)?,
        };

        match self.groups.get_mut(&key) {
            None => {
                self.groups.insert(key, value);
            }
            Some(acc) => {
                *acc = match self.spec.function {
                    AggregateFunction::Count | AggregateFunction::Sum => {
                        acc.checked_add(value).ok_or_else(|| {
                            stage_error("Aggregate", format!("overflow in group {key}"))
                        })?
                    }
                    AggregateFunction::Min => (*acc).min(value),
                    AggregateFunction::Max => (*acc).max(value),
                };
            }
        }
        Ok(())
    }

    fn results(&mut self) -> Vec<Tuple> {
        let groups = std::mem::take(&mut self.groups);
        match self.spec.group_by {
            Some(_) => groups
                .into_iter()
                .map(|(key, value)| Tuple::pair(key, value))
                .collect(),
            None => match groups.get(&0) {
                Some(value) => vec![Tuple::single(*value)],
                None => match self.spec.function {
                    AggregateFunction::Count | AggregateFunction::Sum => vec![Tuple::single(0)],
                    AggregateFunction::Min | AggregateFunction::Max => Vec::new(),
                },
            },
        }
    }

    pub fn on_data(&mut self, ctx: &mut StageContext) -> Result<StageStatus> {
        if matches!(self.phase, Phase::Accumulating) {
            let mut worked = false;
            for _ in 0..ctx.quantum {
                match ctx.poll(0)? {
                    InputPoll::Tuple(tuple) => {
                        worked = true;
                        self.accumulate(&tuple)?;
                    }
                    InputPoll::Empty => {
                        return Ok(if worked {
                            StageStatus::Progress
                        } else {
                            StageStatus::Blocked
                        })
                    }
                    InputPoll::Cancelled => return Ok(StageStatus::Cancelled),
                    InputPoll::Exhausted => {
                        let rows = self.results();
                        tracing::debug!("Aggregate input drained, {} groups", rows.len());
                        self.phase = Phase::Emitting { rows, next: 0 };
                        break;
                    }
                }
            }
            if matches!(self.phase, Phase::Accumulating) {
                return Ok(StageStatus::Progress);
            }
        }

        let Phase::Emitting { rows, next } = &mut self.phase else {
            return Ok(StageStatus::Progress);
        };
        for _ in 0..ctx.quantum {
            let Some(row) = rows.get(*next).copied() else {
                return Ok(StageStatus::Finished);
            };
            *next += 1;
            match ctx.emit(row)? {
                EmitStatus::Accepted => {}
                EmitStatus::Full => return Ok(StageStatus::Blocked),
                EmitStatus::Closed => return Ok(StageStatus::Cancelled),
            }
        }
        if *next == rows.len() {
            Ok(StageStatus::Finished)
        } else {
            Ok(StageStatus::Progress)
        }
    }

    pub fn on_deactivate(&mut self, _ctx: &mut StageContext) {
        self.groups.clear();
        self.phase = Phase::Accumulating;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::buffer::{tuple_buffer, ReadStatus};
    use crate::pipeline::id::{PacketId, WorkerId};
    use crate::pipeline::port::{InputPort, OutputPort};

    fn aggregate(spec: AggregateSpec, rows: &[Tuple], out_capacity: usize) -> Result<Vec<Tuple>> {
        let (in_tx, in_rx) = tuple_buffer(rows.len().max(1)).unwrap();
        for row in rows {
            in_tx.write(*row).unwrap();
        }
        in_tx.finish();

        let (out_tx, out_rx) = tuple_buffer(out_capacity).unwrap();
        let mut inputs = [InputPort::new(in_rx)];
        let mut output = OutputPort::new(out_tx);
        let mut ctx = StageContext {
            inputs: &mut inputs,
            output: &mut output,
            scratch: None,
            quantum: 3,
            worker: WorkerId(0),
            packet: PacketId::new(0, 0),
        };
        let mut op = AggregateOperator::new(spec);
        let mut out = Vec::new();
        loop {
            ctx.output.flush()?;
            let status = op.on_data(&mut ctx)?;
            while let ReadStatus::Tuple(t) = out_rx.try_read() {
                out.push(t);
            }
            if status == StageStatus::Finished {
                break;
            }
        }
        Ok(out)
    }

    #[test]
    fn test_grouped_sum_in_key_order() {
        let rows = [
            Tuple::pair(3, 10),
            Tuple::pair(1, 5),
            Tuple::pair(3, 1),
            Tuple::pair(2, 7),
            Tuple::pair(1, 5),
        ];
        let out = aggregate(
            AggregateSpec::grouped(0, AggregateFunction::Sum, 1),
            &rows,
            1,
        )
        .unwrap();
        assert_eq!(
            out,
            vec![Tuple::pair(1, 10), Tuple::pair(2, 7), Tuple::pair(3, 11)]
        );
    }

    #[test]
    fn test_global_functions() {
        let rows: Vec<_> = [4, -2, 9].iter().map(|&v| Tuple::single(v)).collect();
        let run = |f| aggregate(AggregateSpec::global(f, 0), &rows, 4).unwrap();
        assert_eq!(run(AggregateFunction::Count), vec![Tuple::single(3)]);
        assert_eq!(run(AggregateFunction::Sum), vec![Tuple::single(11)]);
        assert_eq!(run(AggregateFunction::Min), vec![Tuple::single(-2)]);
        assert_eq!(run(AggregateFunction::Max), vec![Tuple::single(9)]);
    }

    #[test]
    fn test_empty_input() {
        let count = aggregate(AggregateSpec::global(AggregateFunction::Count, 0), &[], 4).unwrap();
        assert_eq!(count, vec![Tuple::single(0)]);
        let max = aggregate(AggregateSpec::global(AggregateFunction::Max, 0), &[], 4).unwrap();
        assert!(max.is_empty());
    }

    #[test]
    fn test_missing_column_is_stage_error() {
        let err = aggregate(
            AggregateSpec::grouped(2, AggregateFunction::Count, 0),
            &[Tuple::single(1)],
            4,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no column 2"));
    }

    #[test]
    fn test_sum_overflow_is_stage_error() {
        let rows = [Tuple::single(i64::MAX), Tuple::single(1)];
        assert!(aggregate(AggregateSpec::global(AggregateFunction::Sum, 0), &rows, 4).is_err());
    }
}
