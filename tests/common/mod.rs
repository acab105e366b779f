//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use stageflow::pipeline::{ReadStatus, Tuple, TupleReader};
use std::time::{Duration, Instant};

/// Upper bound for anything a test waits on
pub fn test_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Drain a reader, failing the test if it stalls
pub fn drain(reader: &TupleReader) -> Vec<Tuple> {
    let deadline = Instant::now() + test_timeout();
    let mut rows = Vec::new();
    loop {
        match reader.read_timeout(Duration::from_millis(50)) {
            ReadStatus::Tuple(t) => rows.push(t),
            ReadStatus::Exhausted => return rows,
            ReadStatus::Empty => assert!(Instant::now() < deadline, "reader stalled"),
        }
    }
}

/// Poll `cond` until it holds or the test timeout passes
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + test_timeout();
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}
