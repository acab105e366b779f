//! Stages and the runnable tasks that bind them to packets.
//!
//! A [`Stage`] is a reusable execution container: it runs one packet at a
//! time and only keeps statistics between packets. A [`StageTask`] is what
//! sits in the run queue: the stage plus everything the running packet owns
//! (operator, ports, scratch block, granted resources).

use crate::error::Result;
use crate::memory::PoolBlock;
use crate::pipeline::buffer::BufferHandle;
use crate::pipeline::id::{StageId, WorkerId};
use crate::pipeline::operator::{AnyOperator, StageContext, StageStatus};
use crate::pipeline::packet::{MergeSignature, PacketControl, PacketState};
use crate::pipeline::port::{EmitStatus, InputPort, OutputPort};
use crate::pipeline::resources::ResourceSet;
use crossbeam_utils::Backoff;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Whether finished stages go back to an idle pool or are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePolicy {
    #[default]
    Reuse,
    SpawnNew,
}

/// Counters a stage accumulates across the packets it runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub packets_run: u64,
    pub steps: u64,
    pub blocked_steps: u64,
    pub tuples_in: u64,
    pub tuples_out: u64,
}

/// Reusable execution container.
#[derive(Debug)]
pub struct Stage {
    id: StageId,
    stats: StageStats,
}

impl Stage {
    pub fn new(id: StageId) -> Self {
        Self {
            id,
            stats: StageStats::default(),
        }
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn stats(&self) -> &StageStats {
        &self.stats
    }
}

/// One admitted packet bound to a stage.
pub struct StageTask {
    pub(crate) stage: Stage,
    pub(crate) packet: Arc<PacketControl>,
    operator: AnyOperator,
    inputs: Vec<InputPort>,
    output: OutputPort,
    scratch: Option<PoolBlock>,
    pub(crate) granted: ResourceSet,
    pub(crate) signature: Option<MergeSignature>,
    activated: bool,
    /// The operator reported `Finished` while its last tuple was held back.
    finishing: bool,
    backoff: Backoff,
    /// Every buffer the task touches, with its version when the current
    /// step began.
    watched: Vec<(BufferHandle, u64)>,
}

impl StageTask {
    pub(crate) fn new(
        stage: Stage,
        packet: Arc<PacketControl>,
        operator: AnyOperator,
        inputs: Vec<InputPort>,
        output: OutputPort,
        granted: ResourceSet,
        signature: Option<MergeSignature>,
    ) -> Self {
        let watched = inputs
            .iter()
            .map(InputPort::handle)
            .chain(std::iter::once(output.handle().clone()))
            .map(|buffer| (buffer, 0))
            .collect();
        Self {
            stage,
            packet,
            operator,
            inputs,
            output,
            scratch: None,
            granted,
            signature,
            activated: false,
            finishing: false,
            backoff: Backoff::new(),
            watched,
        }
    }

    pub(crate) fn set_scratch(&mut self, block: PoolBlock) {
        self.scratch = Some(block);
    }

    pub fn operator_name(&self) -> &str {
        self.operator.name()
    }

    pub(crate) fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Buffers to park on after a blocked step, with the versions seen at
    /// the start of that step.
    pub(crate) fn watched(&self) -> &[(BufferHandle, u64)] {
        &self.watched
    }

    /// Run one quantum.
    pub(crate) fn step(&mut self, worker: WorkerId, quantum: usize) -> Result<StageStatus> {
        for (buffer, seen) in &mut self.watched {
            *seen = buffer.version();
        }
        self.stage.stats.steps += 1;
        if self.packet.cancel_requested() {
            return Ok(StageStatus::Cancelled);
        }

        let mut ctx = StageContext {
            inputs: &mut self.inputs,
            output: &mut self.output,
            scratch: self.scratch.as_mut(),
            quantum,
            worker,
            packet: self.packet.id,
        };

        if !self.activated {
            self.packet.set_state(PacketState::Running);
            self.operator.on_activate(&mut ctx)?;
            self.activated = true;
            tracing::debug!(
                "Packet {} ({}) running on {} / {}",
                self.packet.id,
                self.operator.name(),
                self.stage.id,
                worker
            );
        }

        match ctx.output.flush()? {
            EmitStatus::Accepted => {}
            EmitStatus::Full => return Ok(self.blocked()),
            EmitStatus::Closed => return Ok(StageStatus::Cancelled),
        }
        if self.finishing {
            return Ok(StageStatus::Finished);
        }
        if ctx.output.is_closed() {
            return Ok(StageStatus::Cancelled);
        }

        let status = self.operator.on_data(&mut ctx)?;
        match status {
            StageStatus::Finished if self.output.has_pending() => {
                self.finishing = true;
                Ok(self.blocked())
            }
            StageStatus::Blocked => Ok(self.blocked()),
            other => Ok(other),
        }
    }

    fn blocked(&mut self) -> StageStatus {
        self.stage.stats.blocked_steps += 1;
        StageStatus::Blocked
    }

    /// Tear down after the last step. Returns the stage for reuse.
    pub(crate) fn finish(mut self, worker: WorkerId, outcome: PacketState) -> (Stage, ResourceSet) {
        if self.activated {
            let mut ctx = StageContext {
                inputs: &mut self.inputs,
                output: &mut self.output,
                scratch: self.scratch.as_mut(),
                quantum: 0,
                worker,
                packet: self.packet.id,
            };
            self.operator.on_deactivate(&mut ctx);
        }

        if outcome == PacketState::Completed {
            self.output.finish();
        } else {
            self.output.close();
            // An upstream shared with merged readers keeps running; this
            // stage's reader just detaches below.
            for input in &self.inputs {
                if input.handle().reader_count() <= 1 {
                    input.close();
                }
            }
        }

        let stats = &mut self.stage.stats;
        stats.packets_run += 1;
        stats.tuples_in += self.inputs.iter().map(InputPort::consumed).sum::<u64>();
        stats.tuples_out += self.output.emitted();

        // Readers detach and the scratch block goes back to the pool here.
        drop(self.inputs);
        drop(self.scratch);
        (self.stage, self.granted)
    }
}

impl std::fmt::Debug for StageTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageTask")
            .field("stage", &self.stage.id)
            .field("packet", &self.packet.id)
            .field("operator", &self.operator.name())
            .finish()
    }
}
