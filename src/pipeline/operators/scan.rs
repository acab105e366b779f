//! ScanOperator: streams a page source into the output buffer.
//!
//! Pages are fetched one at a time into the stage's scratch block and decoded
//! in place. The page cursor survives across steps, so a scan that hits a
//! full output buffer resumes with the next tuple of the same page.

use crate::error::Result;
use crate::pipeline::operator::{stage_error, StageContext, StageStatus};
use crate::pipeline::port::{EmitStatus, PortDescriptor};
use crate::pipeline::source::{PageId, PageSource};
use crate::pipeline::tuple::TuplePage;
use std::sync::Arc;

static PORTS: &[PortDescriptor] = &[PortDescriptor::output("out")];

/// Sequential scan over every page of a source.
pub struct ScanOperator {
    source: Arc<dyn PageSource>,
    next_page: PageId,
    /// Tuples in the page currently held in scratch.
    page_len: usize,
    /// Next tuple to emit from that page.
    page_pos: usize,
    pages_read: u64,
}

impl ScanOperator {
    pub fn new(source: Arc<dyn PageSource>) -> Self {
        Self {
            source,
            next_page: PageId(0),
            page_len: 0,
            page_pos: 0,
            pages_read: 0,
        }
    }

    pub fn name(&self) -> &str {
        "Scan"
    }

    pub fn ports(&self) -> &[PortDescriptor] {
        PORTS
    }

    pub fn pages_read(&self) -> u64 {
        self.pages_read
    }

    pub fn on_activate(&mut self, ctx: &mut StageContext) -> Result<()> {
        // Fail at activation, not mid-stream, if no scratch page was given.
        ctx.scratch()?;
        self.next_page = PageId(0);
        self.page_len = 0;
        self.page_pos = 0;
        Ok(())
    }

    pub fn on_data(&mut self, ctx: &mut StageContext) -> Result<StageStatus> {
        let source = Arc::clone(&self.source);

        for _ in 0..ctx.quantum {
            if self.page_pos == self.page_len {
                let fetched = source
                    .fetch_page(self.next_page, ctx.scratch()?)
                    .map_err(|e| stage_error(self.name(), e.to_string()))?;
                match fetched {
                    None => return Ok(StageStatus::Finished),
                    Some(count) => {
                        tracing::trace!("Scan fetched {:?} ({} tuples)", self.next_page, count);
                        self.next_page = self.next_page.next();
                        self.page_len = count;
                        self.page_pos = 0;
                        self.pages_read += 1;
                        continue;
                    }
                }
            }

            let tuple = TuplePage::parse(ctx.scratch()?)?.get(self.page_pos)?;
            self.page_pos += 1;
            match ctx.emit(tuple)? {
                EmitStatus::Accepted => {}
                EmitStatus::Full => return Ok(StageStatus::Blocked),
                EmitStatus::Closed => return Ok(StageStatus::Cancelled),
            }
        }

        Ok(StageStatus::Progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageflowError;
    use crate::memory::BlockPool;
    use crate::pipeline::buffer::{tuple_buffer, ReadStatus};
    use crate::pipeline::id::{PacketId, WorkerId};
    use crate::pipeline::port::OutputPort;
    use crate::pipeline::source::{MemoryTable, MockPageSource};
    use crate::pipeline::tuple::{Tuple, PAGE_HEADER_SIZE, TUPLE_ENCODED_SIZE};

    fn run_to_end(op: &mut ScanOperator, capacity: usize, page_bytes: usize) -> Vec<Tuple> {
        let pool = BlockPool::new(page_bytes, 1).unwrap();
        let mut block = pool.checkout().unwrap().unwrap();
        let (tx, rx) = tuple_buffer(capacity).unwrap();
        let mut out = OutputPort::new(tx);
        let mut seen = Vec::new();

        let mut ctx = StageContext {
            inputs: &mut [],
            output: &mut out,
            scratch: Some(&mut block),
            quantum: 5,
            worker: WorkerId(0),
            packet: PacketId::new(0, 0),
        };
        op.on_activate(&mut ctx).unwrap();
        loop {
            ctx.output.flush().unwrap();
            let status = op.on_data(&mut ctx).unwrap();
            while let ReadStatus::Tuple(t) = rx.try_read() {
                seen.push(t);
            }
            if status == StageStatus::Finished {
                break;
            }
        }
        seen
    }

    #[test]
    fn test_scan_emits_every_row_in_order() {
        let rows: Vec<_> = (0..23).map(|i| Tuple::pair(i, i * 10)).collect();
        let table = Arc::new(MemoryTable::new(rows.clone()));
        let mut op = ScanOperator::new(table);

        let page_bytes = PAGE_HEADER_SIZE + 4 * TUPLE_ENCODED_SIZE;
        let seen = run_to_end(&mut op, 3, page_bytes);
        assert_eq!(seen, rows);
        assert_eq!(op.pages_read(), 6);
    }

    #[test]
    fn test_scan_requires_scratch() {
        let mut op = ScanOperator::new(Arc::new(MemoryTable::default()));
        let (tx, _rx) = tuple_buffer(1).unwrap();
        let mut out = OutputPort::new(tx);
        let mut ctx = StageContext {
            inputs: &mut [],
            output: &mut out,
            scratch: None,
            quantum: 1,
            worker: WorkerId(0),
            packet: PacketId::new(0, 0),
        };
        assert!(op.on_activate(&mut ctx).is_err());
    }

    #[test]
    fn test_scan_surfaces_source_errors() {
        let mut source = MockPageSource::new();
        source
            .expect_fetch_page()
            .returning(|_, _| Err(StageflowError::Source("disk gone".into())));
        let mut op = ScanOperator::new(Arc::new(source));

        let pool = BlockPool::new(256, 1).unwrap();
        let mut block = pool.checkout().unwrap().unwrap();
        let (tx, _rx) = tuple_buffer(4).unwrap();
        let mut out = OutputPort::new(tx);
        let mut ctx = StageContext {
            inputs: &mut [],
            output: &mut out,
            scratch: Some(&mut block),
            quantum: 4,
            worker: WorkerId(0),
            packet: PacketId::new(0, 0),
        };
        let err = op.on_data(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn test_scan_stops_when_output_closed() {
        let table = Arc::new(MemoryTable::new(vec![Tuple::single(1); 4]));
        let mut op = ScanOperator::new(table);
        let pool = BlockPool::new(512, 1).unwrap();
        let mut block = pool.checkout().unwrap().unwrap();
        let (tx, rx) = tuple_buffer(4).unwrap();
        let mut out = OutputPort::new(tx);
        drop(rx);

        let mut ctx = StageContext {
            inputs: &mut [],
            output: &mut out,
            scratch: Some(&mut block),
            quantum: 8,
            worker: WorkerId(0),
            packet: PacketId::new(0, 0),
        };
        assert_eq!(op.on_data(&mut ctx).unwrap(), StageStatus::Cancelled);
    }
}
