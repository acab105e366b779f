//! User-defined operators running next to the built-ins

mod common;

use common::builders::{filter, grouped_table, scan, DispatcherBuilder};
use stageflow::pipeline::{
    AnyOperator, CmpOp, EmitStatus, InputPoll, OperatorPlugin, PacketDescriptor, PacketState,
    PortDescriptor, StageContext, StageStatus,
};
use stageflow::Result;

/// Emits all of input 0, then all of input 1.
struct Concat {
    current: usize,
}

static CONCAT_PORTS: [PortDescriptor; 3] = [
    PortDescriptor::input("left"),
    PortDescriptor::input("right"),
    PortDescriptor::output("out"),
];

impl OperatorPlugin for Concat {
    fn name(&self) -> &str {
        "Concat"
    }

    fn ports(&self) -> &[PortDescriptor] {
        &CONCAT_PORTS
    }

    fn on_data(&mut self, ctx: &mut StageContext) -> Result<StageStatus> {
        for _ in 0..ctx.quantum {
            let tuple = match ctx.poll(self.current)? {
                InputPoll::Tuple(t) => t,
                InputPoll::Empty => return Ok(StageStatus::Blocked),
                InputPoll::Exhausted if self.current == 0 => {
                    self.current = 1;
                    continue;
                }
                InputPoll::Exhausted => return Ok(StageStatus::Finished),
                InputPoll::Cancelled => return Ok(StageStatus::Cancelled),
            };
            match ctx.emit(tuple)? {
                EmitStatus::Accepted => {}
                EmitStatus::Full => return Ok(StageStatus::Blocked),
                EmitStatus::Closed => return Ok(StageStatus::Cancelled),
            }
        }
        Ok(StageStatus::Progress)
    }
}

/// Fails on the first tuple it sees.
struct Exploding;

static ONE_INPUT: [PortDescriptor; 2] = [
    PortDescriptor::input("in"),
    PortDescriptor::output("out"),
];

impl OperatorPlugin for Exploding {
    fn name(&self) -> &str {
        "Exploding"
    }

    fn ports(&self) -> &[PortDescriptor] {
        &ONE_INPUT
    }

    fn on_data(&mut self, ctx: &mut StageContext) -> Result<StageStatus> {
        match ctx.poll(0)? {
            InputPoll::Tuple(t) => Err(stageflow::StageflowError::Stage {
                stage: "Exploding".to_string(),
                message: format!("refusing {:?}", t.values()),
            }),
            InputPoll::Empty => Ok(StageStatus::Blocked),
            InputPoll::Exhausted => Ok(StageStatus::Finished),
            InputPoll::Cancelled => Ok(StageStatus::Cancelled),
        }
    }
}

#[test]
fn test_two_input_plugin() {
    let table = grouped_table(1_000, 4);
    let dispatcher = DispatcherBuilder::new().workers(3).build();

    let desc = PacketDescriptor::new(AnyOperator::plugin(Concat { current: 0 }))
        .with_input(filter(0, CmpOp::Eq, 1).with_input(scan(&table)))
        .with_input(filter(0, CmpOp::Eq, 2).with_input(scan(&table)));
    let handle = dispatcher.submit(desc).unwrap();
    assert_eq!(handle.operator_name(), "Concat");

    let rows = handle.collect();
    assert_eq!(rows.len(), 500);
    assert!(rows[..250].iter().all(|t| t.get(0) == Some(1)));
    assert!(rows[250..].iter().all(|t| t.get(0) == Some(2)));
    assert_eq!(handle.wait(), PacketState::Completed);
}

#[test]
fn test_plugin_arity_checked_before_submission() {
    let table = grouped_table(10, 2);
    let dispatcher = DispatcherBuilder::new().build();
    let desc = PacketDescriptor::new(AnyOperator::plugin(Concat { current: 0 }))
        .with_input(scan(&table));
    assert!(dispatcher.submit(desc).unwrap_err().is_invalid_argument());
    assert_eq!(dispatcher.stats().submitted, 0);
}

#[test]
fn test_plugin_error_cancels_graph() {
    let table = grouped_table(10_000, 2);
    let dispatcher = DispatcherBuilder::new().buffer_capacity(16).build();
    let handle = dispatcher
        .submit(
            PacketDescriptor::new(AnyOperator::plugin(Exploding))
                .with_input(scan(&table)),
        )
        .unwrap();

    assert!(handle.collect().is_empty());
    assert_eq!(handle.wait(), PacketState::Cancelled);
    assert!(handle.error().unwrap().contains("refusing [0, 0]"));

    assert!(common::wait_for(|| dispatcher.stats().in_flight == 0));
    assert_eq!(dispatcher.stats().failed, 1);
    assert!(dispatcher.stats().resources_in_use.is_empty());
}
