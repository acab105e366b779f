//! Tuple buffer backpressure and cancellation across threads

mod common;

use stageflow::pipeline::{tuple_buffer, BufferState, ReadStatus, Tuple, WriteStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_writer_blocks_at_capacity_until_read() {
    const K: usize = 4;
    let (tx, rx) = tuple_buffer(K).unwrap();
    for i in 0..K as i64 {
        assert_eq!(tx.try_write(Tuple::single(i)).unwrap(), WriteStatus::Written);
    }

    let written = Arc::new(AtomicUsize::new(0));
    let producer = {
        let written = Arc::clone(&written);
        std::thread::spawn(move || {
            let status = tx.write(Tuple::single(K as i64)).unwrap();
            written.fetch_add(1, Ordering::SeqCst);
            status
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(written.load(Ordering::SeqCst), 0, "K+1-th write did not block");

    assert_eq!(rx.read(), ReadStatus::Tuple(Tuple::single(0)));
    assert_eq!(producer.join().unwrap(), WriteStatus::Written);

    let rest = common::drain(&rx);
    assert_eq!(
        rest,
        (1..=K as i64).map(Tuple::single).collect::<Vec<_>>()
    );
}

#[test]
fn test_close_unblocks_reader() {
    let (tx, rx) = tuple_buffer(4).unwrap();
    let handle = tx.handle();
    let reader = std::thread::spawn(move || rx.read());

    std::thread::sleep(Duration::from_millis(20));
    handle.close();

    assert_eq!(reader.join().unwrap(), ReadStatus::Exhausted);
    assert!(handle.is_cancelled());
    assert_eq!(handle.state(), BufferState::Closed);
    assert_eq!(tx.write(Tuple::single(1)).unwrap(), WriteStatus::Closed);
}

#[test]
fn test_close_unblocks_full_writer() {
    let (tx, rx) = tuple_buffer(1).unwrap();
    tx.write(Tuple::single(1)).unwrap();
    let writer = std::thread::spawn(move || tx.write(Tuple::single(2)).unwrap());

    std::thread::sleep(Duration::from_millis(20));
    rx.close();
    assert_eq!(writer.join().unwrap(), WriteStatus::Closed);
}

#[test]
fn test_streaming_many_tuples_through_small_buffer() {
    const N: i64 = 20_000;
    let (tx, rx) = tuple_buffer(8).unwrap();
    let producer = std::thread::spawn(move || {
        for i in 0..N {
            assert_eq!(tx.write(Tuple::pair(i, -i)).unwrap(), WriteStatus::Written);
        }
        tx.finish();
    });

    let rows = common::drain(&rx);
    producer.join().unwrap();

    assert_eq!(rows.len(), N as usize);
    assert!(rows
        .iter()
        .enumerate()
        .all(|(i, t)| *t == Tuple::pair(i as i64, -(i as i64))));
    assert!(!rx.is_cancelled());
}

#[test]
fn test_late_reader_attaches_only_before_first_release() {
    let (tx, rx) = tuple_buffer(8).unwrap();
    let handle = tx.handle();
    tx.write(Tuple::single(1)).unwrap();

    let early = handle.attach_reader().expect("nothing released yet");
    assert_eq!(early.read(), ReadStatus::Tuple(Tuple::single(1)));
    assert_eq!(rx.read(), ReadStatus::Tuple(Tuple::single(1)));

    assert!(handle.attach_reader().is_none());
    tx.finish();
    assert_eq!(early.read(), ReadStatus::Exhausted);
}
