//! Bounded tuple buffer with backpressure and close-for-cancellation.
//!
//! A buffer is a ring of `capacity` tuple slots carved out of a
//! [`MemoryRegion`]. Slots are committed lazily as the write position first
//! reaches them; once the whole ring has been touched the buffer is a plain
//! bounded queue.
//!
//! Writers may be cloned (fan-in). Readers each keep their own cursor
//! (fan-out): every reader sees every tuple, and a slot is only reused once
//! all readers have moved past it.
//!
//! ```text
//!            tail (oldest slot still needed)      head (next write)
//!             │                                    │
//! reader A ───┘        reader B ──────┐            │
//!             ▼                       ▼            ▼
//!           [ t4 | t5 | t6 | t7 | t8 | t9 | t10 |    |    ]
//! ```
//!
//! State machine, stored in an `AtomicU8` and only moved by CAS:
//!
//! - `Open → Draining` when the last writer finishes.
//! - `Draining → Closed` when the last attached reader sees it is drained.
//! - any → `Closed` on [`close`](BufferHandle::close) (cancellation).
//!
//! Every change a blocked stage could be waiting for (a write, a freed slot,
//! a state transition) bumps the buffer's version and wakes the registered
//! [`Waker`]s. The dispatcher parks blocked stages this way instead of
//! polling them.

use crate::error::{Result, StageflowError};
use crate::memory::MemoryRegion;
use crate::pipeline::tuple::Tuple;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::time::{Duration, Instant};

const SLOT_SIZE: usize = std::mem::size_of::<Tuple>();

/// Lifecycle of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferState {
    /// Writers may still produce.
    Open = 0,
    /// All writers finished; readers are consuming what is left.
    Draining = 1,
    /// Terminal. Writes are refused and reads report exhaustion.
    Closed = 2,
}

impl BufferState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => BufferState::Open,
            1 => BufferState::Draining,
            _ => BufferState::Closed,
        }
    }
}

/// Outcome of a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written,
    /// Only from non-blocking or timed writes.
    Full,
    /// The buffer was cancelled or every reader went away.
    Closed,
}

/// Outcome of a read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Tuple(Tuple),
    /// Only from non-blocking or timed reads.
    Empty,
    /// No more tuples will ever arrive for this reader.
    Exhausted,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    position: u64,
    exhausted: bool,
}

struct Ring {
    region: MemoryRegion,
    /// Total tuples ever written.
    head: u64,
    /// Smallest reader cursor. Slots below it are free.
    tail: u64,
    readers: Vec<Option<Cursor>>,
    writers: usize,
    /// Woken, and cleared, on the next change.
    wakers: Vec<Waker>,
}

impl Ring {
    fn slot_offset(&self, position: u64, capacity: usize) -> usize {
        (position % capacity as u64) as usize * SLOT_SIZE
    }

    fn live_readers(&self) -> impl Iterator<Item = &Cursor> {
        self.readers.iter().flatten()
    }

    fn recompute_tail(&mut self) -> bool {
        let tail = self
            .live_readers()
            .map(|c| c.position)
            .min()
            .unwrap_or(self.head);
        let advanced = tail > self.tail;
        self.tail = tail;
        advanced
    }

    fn all_readers_exhausted(&self) -> bool {
        self.live_readers().all(|c| c.exhausted)
    }
}

struct Shared {
    capacity: usize,
    state: AtomicU8,
    cancelled: AtomicBool,
    /// Bumped under the ring lock on every change.
    version: AtomicU64,
    ring: Mutex<Ring>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl Shared {
    fn state(&self) -> BufferState {
        BufferState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: BufferState, to: BufferState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record a change while holding the ring lock. The returned wakers
    /// must be woken after the lock is released.
    fn changed(&self, ring: &mut Ring) -> Vec<Waker> {
        self.version.fetch_add(1, Ordering::AcqRel);
        std::mem::take(&mut ring.wakers)
    }

    /// Cancel the buffer. A stream that already drained and closed keeps
    /// its normal ending.
    fn close(&self) {
        // Under the lock so a waiter between its state check and its wait
        // cannot miss the wakeup.
        let mut ring = self.ring.lock();
        let mut current = self.state.load(Ordering::Acquire);
        while current != BufferState::Closed as u8 {
            match self.state.compare_exchange(
                current,
                BufferState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.cancelled.store(true, Ordering::Release);
                    break;
                }
                Err(actual) => current = actual,
            }
        }
        let wakers = self.changed(&mut ring);
        drop(ring);
        self.not_full.notify_all();
        self.not_empty.notify_all();
        wake_all(wakers);
    }

    fn write(&self, tuple: Tuple, deadline: Wait) -> Result<WriteStatus> {
        let mut ring = self.ring.lock();
        loop {
            if self.state() != BufferState::Open {
                return Ok(WriteStatus::Closed);
            }
            if ring.head - ring.tail < self.capacity as u64 {
                let offset = ring.slot_offset(ring.head, self.capacity);
                ring.region.ensure_capacity(offset + SLOT_SIZE)?;
                // SAFETY: the slot is committed, aligned for Tuple (base is
                // page aligned, SLOT_SIZE a multiple of 8) and no reader
                // still needs it.
                unsafe {
                    let slot = ring.region.as_mut_ptr().add(offset) as *mut Tuple;
                    slot.write(tuple);
                }
                ring.head += 1;
                let wakers = self.changed(&mut ring);
                drop(ring);
                self.not_empty.notify_all();
                wake_all(wakers);
                return Ok(WriteStatus::Written);
            }
            if !deadline.wait(&self.not_full, &mut ring) {
                return Ok(WriteStatus::Full);
            }
        }
    }

    fn read(&self, reader: usize, deadline: Wait) -> ReadStatus {
        let mut ring = self.ring.lock();
        loop {
            let Some(cursor) = ring.readers.get(reader).copied().flatten() else {
                return ReadStatus::Exhausted;
            };
            if cursor.exhausted || self.cancelled.load(Ordering::Acquire) {
                let wakers = self.mark_exhausted(&mut ring, reader);
                drop(ring);
                wake_all(wakers);
                return ReadStatus::Exhausted;
            }

            if cursor.position < ring.head {
                let offset = ring.slot_offset(cursor.position, self.capacity);
                // SAFETY: written slot inside the committed prefix; it is not
                // overwritten until every cursor passes it.
                let tuple = unsafe { (ring.region.as_ptr().add(offset) as *const Tuple).read() };
                if let Some(Some(c)) = ring.readers.get_mut(reader) {
                    c.position += 1;
                }
                if cursor.position == ring.tail && ring.recompute_tail() {
                    let wakers = self.changed(&mut ring);
                    drop(ring);
                    self.not_full.notify_all();
                    wake_all(wakers);
                }
                return ReadStatus::Tuple(tuple);
            }

            if self.state() != BufferState::Open {
                let wakers = self.mark_exhausted(&mut ring, reader);
                drop(ring);
                wake_all(wakers);
                return ReadStatus::Exhausted;
            }
            if !deadline.wait(&self.not_empty, &mut ring) {
                return ReadStatus::Empty;
            }
        }
    }

    fn mark_exhausted(&self, ring: &mut Ring, reader: usize) -> Vec<Waker> {
        if let Some(Some(c)) = ring.readers.get_mut(reader) {
            c.exhausted = true;
        }
        if ring.all_readers_exhausted() && self.transition(BufferState::Draining, BufferState::Closed)
        {
            tracing::trace!("buffer drained and closed");
            return self.changed(ring);
        }
        Vec::new()
    }

    fn add_reader(&self, ring: &mut Ring, position: u64) -> usize {
        let cursor = Cursor {
            position,
            exhausted: false,
        };
        match ring.readers.iter().position(Option::is_none) {
            Some(free) => {
                ring.readers[free] = Some(cursor);
                free
            }
            None => {
                ring.readers.push(Some(cursor));
                ring.readers.len() - 1
            }
        }
    }

    fn detach_reader(&self, reader: usize) {
        let mut ring = self.ring.lock();
        if let Some(slot) = ring.readers.get_mut(reader) {
            *slot = None;
        }
        if ring.live_readers().next().is_none() {
            drop(ring);
            self.close();
            return;
        }
        let freed = ring.recompute_tail();
        let drained = ring.all_readers_exhausted()
            && self.transition(BufferState::Draining, BufferState::Closed);
        if freed || drained {
            let wakers = self.changed(&mut ring);
            drop(ring);
            self.not_full.notify_all();
            wake_all(wakers);
        }
    }

    fn writer_done(&self) {
        let mut ring = self.ring.lock();
        ring.writers -= 1;
        if ring.writers == 0 && self.transition(BufferState::Open, BufferState::Draining) {
            let wakers = self.changed(&mut ring);
            drop(ring);
            self.not_empty.notify_all();
            wake_all(wakers);
        }
    }
}

fn wake_all(wakers: Vec<Waker>) {
    for waker in wakers {
        waker.wake();
    }
}

/// How long a blocking call may wait.
#[derive(Clone, Copy)]
enum Wait {
    Never,
    Forever,
    Until(Instant),
}

impl Wait {
    fn after(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Wait::Until(deadline),
            None => Wait::Forever,
        }
    }

    /// Returns false once the caller should give up.
    fn wait(self, condvar: &Condvar, guard: &mut MutexGuard<'_, Ring>) -> bool {
        match self {
            Wait::Never => false,
            Wait::Forever => {
                condvar.wait(guard);
                true
            }
            Wait::Until(deadline) => {
                if Instant::now() >= deadline {
                    return false;
                }
                condvar.wait_until(guard, deadline);
                true
            }
        }
    }
}

/// Create a buffer holding at most `capacity` unread tuples.
pub fn tuple_buffer(capacity: usize) -> Result<(TupleWriter, TupleReader)> {
    if capacity == 0 {
        return Err(StageflowError::invalid("buffer capacity must be non-zero"));
    }
    let bytes = capacity
        .checked_mul(SLOT_SIZE)
        .ok_or_else(|| StageflowError::invalid(format!("buffer capacity {capacity} overflows")))?;
    let region = MemoryRegion::reserve(bytes.max(crate::memory::page_size()), 8)?;

    let shared = Arc::new(Shared {
        capacity,
        state: AtomicU8::new(BufferState::Open as u8),
        cancelled: AtomicBool::new(false),
        version: AtomicU64::new(0),
        ring: Mutex::new(Ring {
            region,
            head: 0,
            tail: 0,
            readers: vec![Some(Cursor {
                position: 0,
                exhausted: false,
            })],
            writers: 1,
            wakers: Vec::new(),
        }),
        not_full: Condvar::new(),
        not_empty: Condvar::new(),
    });

    Ok((
        TupleWriter {
            shared: Arc::clone(&shared),
        },
        TupleReader { shared, id: 0 },
    ))
}

/// Producer end. Clone it for fan-in; the buffer drains once every clone is
/// finished or dropped.
pub struct TupleWriter {
    shared: Arc<Shared>,
}

impl TupleWriter {
    /// Write one tuple, blocking while the buffer is full.
    pub fn write(&self, tuple: Tuple) -> Result<WriteStatus> {
        self.shared.write(tuple, Wait::Forever)
    }

    pub fn try_write(&self, tuple: Tuple) -> Result<WriteStatus> {
        self.shared.write(tuple, Wait::Never)
    }

    /// Returns `Full` if no slot frees up within `timeout`.
    pub fn write_timeout(&self, tuple: Tuple, timeout: Duration) -> Result<WriteStatus> {
        self.shared.write(tuple, Wait::after(timeout))
    }

    /// Signal end of stream from this writer.
    pub fn finish(self) {
        drop(self);
    }

    /// Cancel the buffer.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn handle(&self) -> BufferHandle {
        BufferHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Clone for TupleWriter {
    fn clone(&self) -> Self {
        self.shared.ring.lock().writers += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for TupleWriter {
    fn drop(&mut self) {
        self.shared.writer_done();
    }
}

impl std::fmt::Debug for TupleWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleWriter")
            .field("state", &self.shared.state())
            .finish()
    }
}

/// Consumer end with its own cursor. Dropping it detaches the cursor; the
/// buffer closes when its last reader goes away.
pub struct TupleReader {
    shared: Arc<Shared>,
    id: usize,
}

impl TupleReader {
    /// Read one tuple, blocking while the buffer is empty and may still
    /// receive data.
    pub fn read(&self) -> ReadStatus {
        self.shared.read(self.id, Wait::Forever)
    }

    pub fn try_read(&self) -> ReadStatus {
        self.shared.read(self.id, Wait::Never)
    }

    /// Returns `Empty` if nothing arrives within `timeout`.
    pub fn read_timeout(&self, timeout: Duration) -> ReadStatus {
        self.shared.read(self.id, Wait::after(timeout))
    }

    /// Cancel the buffer. Upstream writers will see `Closed`.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    pub fn handle(&self) -> BufferHandle {
        BufferHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for TupleReader {
    fn drop(&mut self) {
        self.shared.detach_reader(self.id);
    }
}

impl std::fmt::Debug for TupleReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleReader")
            .field("id", &self.id)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// Control handle that neither produces nor consumes.
#[derive(Clone)]
pub struct BufferHandle {
    shared: Arc<Shared>,
}

impl BufferHandle {
    /// Attach another reader that will see the whole stream.
    ///
    /// Only possible while no slot has been released yet; returns `None`
    /// once the window has passed or the buffer is closed.
    pub fn attach_reader(&self) -> Option<TupleReader> {
        let mut ring = self.shared.ring.lock();
        if ring.tail != 0 || self.shared.state() == BufferState::Closed {
            return None;
        }
        let id = self.shared.add_reader(&mut ring, 0);
        Some(TupleReader {
            shared: Arc::clone(&self.shared),
            id,
        })
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    pub fn state(&self) -> BufferState {
        self.shared.state()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Tuples not yet consumed by the slowest reader.
    pub fn len(&self) -> usize {
        let ring = self.shared.ring.lock();
        (ring.head - ring.tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn committed_bytes(&self) -> usize {
        self.shared.ring.lock().region.committed()
    }

    pub fn reader_count(&self) -> usize {
        self.shared.ring.lock().live_readers().count()
    }

    /// Change counter. Any write, freed slot or state transition bumps it.
    pub fn version(&self) -> u64 {
        self.shared.version.load(Ordering::Acquire)
    }

    /// Wake `waker` on the next change.
    ///
    /// Returns false, registering nothing, if the buffer already changed
    /// since `seen` was read from [`version`](Self::version).
    pub fn register_waker(&self, waker: &Waker, seen: u64) -> bool {
        let mut ring = self.shared.ring.lock();
        if self.shared.version.load(Ordering::Acquire) != seen {
            return false;
        }
        if !ring.wakers.iter().any(|w| w.will_wake(waker)) {
            ring.wakers.push(waker.clone());
        }
        true
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("capacity", &self.shared.capacity)
            .field("state", &self.shared.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(tuple_buffer(0).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_fifo_and_drain() {
        let (tx, rx) = tuple_buffer(4).unwrap();
        for i in 0..3 {
            assert_eq!(tx.write(Tuple::single(i)).unwrap(), WriteStatus::Written);
        }
        let handle = rx.handle();
        tx.finish();
        assert_eq!(handle.state(), BufferState::Draining);

        for i in 0..3 {
            assert_eq!(rx.read(), ReadStatus::Tuple(Tuple::single(i)));
        }
        assert_eq!(rx.read(), ReadStatus::Exhausted);
        assert_eq!(handle.state(), BufferState::Closed);
        assert!(!rx.is_cancelled());
    }

    #[test]
    fn test_try_write_reports_full() {
        let (tx, rx) = tuple_buffer(2).unwrap();
        tx.write(Tuple::single(1)).unwrap();
        tx.write(Tuple::single(2)).unwrap();
        assert_eq!(tx.try_write(Tuple::single(3)).unwrap(), WriteStatus::Full);
        assert_eq!(
            tx.write_timeout(Tuple::single(3), Duration::from_millis(10))
                .unwrap(),
            WriteStatus::Full
        );

        assert_eq!(rx.read(), ReadStatus::Tuple(Tuple::single(1)));
        assert_eq!(tx.try_write(Tuple::single(3)).unwrap(), WriteStatus::Written);
    }

    #[test]
    fn test_try_read_reports_empty() {
        let (_tx, rx) = tuple_buffer(2).unwrap();
        assert_eq!(rx.try_read(), ReadStatus::Empty);
        assert_eq!(rx.read_timeout(Duration::from_millis(5)), ReadStatus::Empty);
    }

    #[test]
    fn test_ring_wraps_around() {
        let (tx, rx) = tuple_buffer(3).unwrap();
        for i in 0..10 {
            tx.write(Tuple::single(i)).unwrap();
            assert_eq!(rx.read(), ReadStatus::Tuple(Tuple::single(i)));
        }
        assert_eq!(rx.handle().len(), 0);
    }

    #[test]
    fn test_commit_grows_with_write_position() {
        let page = crate::memory::page_size();
        let per_page = page / SLOT_SIZE;
        let (tx, rx) = tuple_buffer(per_page * 4).unwrap();
        let handle = rx.handle();
        assert_eq!(handle.committed_bytes(), 0);

        tx.write(Tuple::single(0)).unwrap();
        assert_eq!(handle.committed_bytes(), page);

        for i in 1..=per_page as i64 {
            tx.write(Tuple::single(i)).unwrap();
        }
        assert_eq!(handle.committed_bytes(), 2 * page);
    }

    #[test]
    fn test_close_unblocks_writer() {
        let (tx, rx) = tuple_buffer(1).unwrap();
        tx.write(Tuple::single(0)).unwrap();

        let writer = thread::spawn(move || tx.write(Tuple::single(1)).unwrap());
        thread::sleep(Duration::from_millis(20));
        rx.close();

        assert_eq!(writer.join().unwrap(), WriteStatus::Closed);
        assert!(rx.is_cancelled());
        assert_eq!(rx.read(), ReadStatus::Exhausted);
    }

    #[test]
    fn test_last_reader_drop_closes() {
        let (tx, rx) = tuple_buffer(2).unwrap();
        drop(rx);
        assert_eq!(tx.write(Tuple::single(0)).unwrap(), WriteStatus::Closed);
        assert_eq!(tx.handle().state(), BufferState::Closed);
    }

    #[test]
    fn test_fan_in_drains_after_last_writer() {
        let (tx, rx) = tuple_buffer(8).unwrap();
        let tx2 = tx.clone();
        tx.write(Tuple::single(1)).unwrap();
        tx.finish();
        assert_eq!(rx.handle().state(), BufferState::Open);

        tx2.write(Tuple::single(2)).unwrap();
        drop(tx2);
        assert_eq!(rx.handle().state(), BufferState::Draining);

        assert_eq!(rx.read(), ReadStatus::Tuple(Tuple::single(1)));
        assert_eq!(rx.read(), ReadStatus::Tuple(Tuple::single(2)));
        assert_eq!(rx.read(), ReadStatus::Exhausted);
    }

    #[test]
    fn test_fan_out_readers_each_see_every_tuple() {
        let (tx, rx) = tuple_buffer(2).unwrap();
        let second = rx.handle().attach_reader().unwrap();

        tx.write(Tuple::single(1)).unwrap();
        tx.write(Tuple::single(2)).unwrap();
        // The slow reader keeps both slots alive.
        assert_eq!(rx.read(), ReadStatus::Tuple(Tuple::single(1)));
        assert_eq!(rx.read(), ReadStatus::Tuple(Tuple::single(2)));
        assert_eq!(tx.try_write(Tuple::single(3)).unwrap(), WriteStatus::Full);

        assert_eq!(second.read(), ReadStatus::Tuple(Tuple::single(1)));
        assert_eq!(tx.try_write(Tuple::single(3)).unwrap(), WriteStatus::Written);
        tx.finish();

        assert_eq!(rx.read(), ReadStatus::Tuple(Tuple::single(3)));
        assert_eq!(rx.read(), ReadStatus::Exhausted);
        assert_eq!(rx.handle().state(), BufferState::Draining);

        assert_eq!(second.read(), ReadStatus::Tuple(Tuple::single(2)));
        assert_eq!(second.read(), ReadStatus::Tuple(Tuple::single(3)));
        assert_eq!(second.read(), ReadStatus::Exhausted);
        assert_eq!(rx.handle().state(), BufferState::Closed);
    }

    #[test]
    fn test_attach_window_closes_after_release() {
        let (tx, rx) = tuple_buffer(4).unwrap();
        let handle = rx.handle();
        tx.write(Tuple::single(1)).unwrap();
        assert!(handle.attach_reader().is_some());

        // The attached reader above was dropped immediately; consume once.
        rx.read();
        assert!(handle.attach_reader().is_none());
    }

    #[test]
    fn test_dropping_reader_after_drain_keeps_normal_ending() {
        let (tx, rx) = tuple_buffer(2).unwrap();
        let handle = rx.handle();
        tx.write(Tuple::single(1)).unwrap();
        tx.finish();
        assert_eq!(rx.read(), ReadStatus::Tuple(Tuple::single(1)));
        assert_eq!(rx.read(), ReadStatus::Exhausted);
        assert_eq!(handle.state(), BufferState::Closed);
        assert!(!rx.is_cancelled());

        drop(rx);
        assert!(!handle.is_cancelled());
        handle.close();
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn test_dropping_reader_mid_stream_cancels() {
        let (tx, rx) = tuple_buffer(2).unwrap();
        tx.write(Tuple::single(1)).unwrap();
        tx.finish();
        let handle = rx.handle();
        drop(rx);
        assert!(handle.is_cancelled());
    }

    struct Flag(AtomicBool);

    impl std::task::Wake for Flag {
        fn wake(self: Arc<Self>) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn flag_waker() -> (Arc<Flag>, Waker) {
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        let waker = Waker::from(Arc::clone(&flag));
        (flag, waker)
    }

    #[test]
    fn test_waker_fires_on_write_not_on_failed_poll() {
        let (flag, waker) = flag_waker();
        let (tx, rx) = tuple_buffer(1).unwrap();
        let handle = tx.handle();
        let seen = handle.version();

        assert!(handle.register_waker(&waker, seen));
        assert!(handle.register_waker(&waker, seen));
        assert_eq!(rx.try_read(), ReadStatus::Empty);
        assert_eq!(handle.version(), seen);
        assert!(!flag.0.load(Ordering::SeqCst));

        tx.write(Tuple::single(1)).unwrap();
        assert!(flag.0.load(Ordering::SeqCst));
        assert!(!handle.register_waker(&waker, seen));
    }

    #[test]
    fn test_waker_fires_when_slot_frees_or_buffer_closes() {
        let (tx, rx) = tuple_buffer(1).unwrap();
        let handle = tx.handle();
        tx.write(Tuple::single(1)).unwrap();
        assert_eq!(tx.try_write(Tuple::single(2)).unwrap(), WriteStatus::Full);

        let (freed, waker) = flag_waker();
        assert!(handle.register_waker(&waker, handle.version()));
        rx.read();
        assert!(freed.0.load(Ordering::SeqCst));

        let (closed, waker) = flag_waker();
        assert!(handle.register_waker(&waker, handle.version()));
        rx.close();
        assert!(closed.0.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dropping_one_of_two_readers_keeps_buffer_open() {
        let (tx, rx) = tuple_buffer(2).unwrap();
        let second = rx.handle().attach_reader().unwrap();
        drop(rx);
        assert_eq!(tx.write(Tuple::single(9)).unwrap(), WriteStatus::Written);
        assert_eq!(second.read(), ReadStatus::Tuple(Tuple::single(9)));
    }
}
