//! Ports connect a running stage to its buffers.
//!
//! Each operator declares its ports via a static `PortDescriptor` array; the
//! dispatcher uses these to validate that a packet brings exactly as many
//! inputs as the operator consumes. At run time the stage sees its inputs as
//! [`InputPort`]s and its output as an [`OutputPort`].

use crate::error::{Result, StageflowError};
use crate::pipeline::buffer::{BufferHandle, ReadStatus, TupleReader, TupleWriter, WriteStatus};
use crate::pipeline::tuple::Tuple;

/// Whether a port is an input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// Static descriptor for an operator's port.
#[derive(Debug, Clone)]
pub struct PortDescriptor {
    pub name: &'static str,
    pub direction: PortDirection,
}

impl PortDescriptor {
    pub const fn input(name: &'static str) -> Self {
        Self {
            name,
            direction: PortDirection::Input,
        }
    }

    pub const fn output(name: &'static str) -> Self {
        Self {
            name,
            direction: PortDirection::Output,
        }
    }
}

/// Number of input ports in a descriptor list.
pub fn input_count(ports: &[PortDescriptor]) -> usize {
    ports
        .iter()
        .filter(|p| p.direction == PortDirection::Input)
        .count()
}

/// Result of polling an input without blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputPoll {
    Tuple(Tuple),
    /// Nothing buffered right now; the upstream stage is still producing.
    Empty,
    /// Upstream finished normally and everything has been read.
    Exhausted,
    /// Upstream was cancelled.
    Cancelled,
}

/// Consumer side of one upstream buffer.
#[derive(Debug)]
pub struct InputPort {
    reader: TupleReader,
    consumed: u64,
    done: bool,
}

impl InputPort {
    pub fn new(reader: TupleReader) -> Self {
        Self {
            reader,
            consumed: 0,
            done: false,
        }
    }

    pub fn poll(&mut self) -> InputPoll {
        if self.done {
            return self.terminal();
        }
        match self.reader.try_read() {
            ReadStatus::Tuple(tuple) => {
                self.consumed += 1;
                InputPoll::Tuple(tuple)
            }
            ReadStatus::Empty => InputPoll::Empty,
            ReadStatus::Exhausted => {
                self.done = true;
                self.terminal()
            }
        }
    }

    fn terminal(&self) -> InputPoll {
        if self.reader.is_cancelled() {
            InputPoll::Cancelled
        } else {
            InputPoll::Exhausted
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Cancel the upstream buffer.
    pub fn close(&self) {
        self.reader.close();
    }

    pub fn handle(&self) -> BufferHandle {
        self.reader.handle()
    }
}

/// Result of handing a tuple to the output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitStatus {
    Accepted,
    /// The buffer is full. The port kept the tuple; the operator must yield
    /// with `Blocked` and the port retries it before the next step.
    Full,
    /// Every downstream reader is gone or the buffer was cancelled.
    Closed,
}

/// Producer side of the stage's output buffer.
#[derive(Debug)]
pub struct OutputPort {
    writer: Option<TupleWriter>,
    handle: BufferHandle,
    pending: Option<Tuple>,
    emitted: u64,
}

impl OutputPort {
    pub fn new(writer: TupleWriter) -> Self {
        Self {
            handle: writer.handle(),
            writer: Some(writer),
            pending: None,
            emitted: 0,
        }
    }

    pub fn emit(&mut self, tuple: Tuple) -> Result<EmitStatus> {
        if self.pending.is_some() {
            return Err(StageflowError::invalid(
                "emit called while an earlier tuple is still pending",
            ));
        }
        self.push(tuple)
    }

    /// Retry the held-back tuple, if any.
    pub fn flush(&mut self) -> Result<EmitStatus> {
        match self.pending.take() {
            Some(tuple) => self.push(tuple),
            None => Ok(EmitStatus::Accepted),
        }
    }

    fn push(&mut self, tuple: Tuple) -> Result<EmitStatus> {
        let Some(writer) = self.writer.as_ref() else {
            return Ok(EmitStatus::Closed);
        };
        match writer.try_write(tuple)? {
            WriteStatus::Written => {
                self.emitted += 1;
                Ok(EmitStatus::Accepted)
            }
            WriteStatus::Full => {
                self.pending = Some(tuple);
                Ok(EmitStatus::Full)
            }
            WriteStatus::Closed => Ok(EmitStatus::Closed),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Signal end of stream to downstream readers.
    pub fn finish(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.finish();
        }
    }

    /// Cancel the output buffer.
    pub fn close(&mut self) {
        self.handle.close();
        self.writer = None;
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub fn handle(&self) -> &BufferHandle {
        &self.handle
    }
}
