//! Per-thread trace buffering (single producer, single reader)
//!
//! The instrumented thread appends [`CallRecord`]s to its *active* buffer
//! without taking locks: every append stores the record and then publishes the
//! new length through the buffer's `committed` counter with release ordering.
//!
//! ## Buffer life cycle
//!
//! ```text
//!   empty pool ──take──► active ──full──► ready queue ──read──► empty pool
//!        ▲                                                   │
//!        └──────────── trimmed / refilled by the reader ─────┘
//! ```
//!
//! Buffers travel between the producer and the reader through
//! `crossbeam-channel` queues, so ownership moves rather than data being copied.
//! A queue never owns more than `max_buffers` buffers; when all of them are in
//! flight the producer blocks until the reader recycles one.
//!
//! The reader may also consume the committed prefix of the active buffer. Its
//! position in every buffer is tracked by a reader-side `consumed` counter so
//! each record is delivered exactly once.

// Records are written through `UnsafeCell`s by the producer and read back as
// plain slices once published; the unsafe blocks below uphold that contract.
#![allow(unsafe_code)]

use super::policy::BufferingPolicy;
use callscope_common::{CallRecord, BUFFER_SIZE};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Fixed-capacity record buffer
struct TraceBuffer {
    records: Box<[UnsafeCell<CallRecord>]>,
    /// Records published by the producer.
    committed: AtomicUsize,
    /// Records already handed to the reader. Only the reader touches this.
    consumed: AtomicUsize,
}

// SAFETY: slots below `committed` are never written again until the reader
// recycles the buffer, and slots at or above it are only touched by the producer.
unsafe impl Sync for TraceBuffer {}
unsafe impl Send for TraceBuffer {}

impl TraceBuffer {
    fn new() -> Arc<Self> {
        let records = (0..BUFFER_SIZE).map(|_| UnsafeCell::new(CallRecord::default())).collect();
        Arc::new(Self { records, committed: AtomicUsize::new(0), consumed: AtomicUsize::new(0) })
    }

    /// Hand the not-yet-consumed, committed records to `read`.
    fn consume(&self, read: &mut dyn FnMut(&[CallRecord])) -> usize {
        let end = self.committed.load(Ordering::Acquire);
        let start = self.consumed.load(Ordering::Relaxed);
        if end <= start {
            return 0;
        }
        // SAFETY: [start, end) was published with release ordering and is
        // immutable until this buffer is recycled by the reader (us).
        // `UnsafeCell<CallRecord>` has the same layout as `CallRecord`.
        let chunk = unsafe {
            std::slice::from_raw_parts(self.records.as_ptr().add(start).cast::<CallRecord>(), end - start)
        };
        read(chunk);
        self.consumed.store(end, Ordering::Relaxed);
        end - start
    }

    fn reset(&self) {
        self.committed.store(0, Ordering::Relaxed);
        self.consumed.store(0, Ordering::Relaxed);
    }
}

/// Counters exposed for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub allocated: usize,
    pub empty: usize,
    pub ready: usize,
}

pub struct BuffersQueue {
    /// Producer-owned handle keeping the active buffer alive.
    active: UnsafeCell<Arc<TraceBuffer>>,
    /// Same buffer as `active`, published for the reader.
    active_ptr: AtomicPtr<TraceBuffer>,
    /// Bumped after every completed flush.
    generation: AtomicUsize,
    allocated: AtomicUsize,
    max_buffers: AtomicUsize,
    policy: Mutex<BufferingPolicy>,
    ready_tx: Sender<Arc<TraceBuffer>>,
    ready_rx: Receiver<Arc<TraceBuffer>>,
    empty_tx: Sender<Arc<TraceBuffer>>,
    empty_rx: Receiver<Arc<TraceBuffer>>,
}

// SAFETY: `active` is only accessed by the single producer (see `push`);
// everything else is atomics, channels or behind a mutex.
unsafe impl Sync for BuffersQueue {}
unsafe impl Send for BuffersQueue {}

impl BuffersQueue {
    #[must_use]
    pub fn new(policy: BufferingPolicy) -> Self {
        let active = TraceBuffer::new();
        let active_ptr = AtomicPtr::new(Arc::as_ptr(&active).cast_mut());
        let (ready_tx, ready_rx) = unbounded();
        let (empty_tx, empty_rx) = unbounded();
        let queue = Self {
            active: UnsafeCell::new(active),
            active_ptr,
            generation: AtomicUsize::new(0),
            allocated: AtomicUsize::new(1),
            max_buffers: AtomicUsize::new(policy.max_buffers()),
            policy: Mutex::new(policy),
            ready_tx,
            ready_rx,
            empty_tx,
            empty_rx,
        };
        queue.adjust_empty_buffers(&policy, 0);
        queue
    }

    /// Append a record to the active buffer, flushing it when full
    ///
    /// # Safety
    /// Must only ever be called from one thread (the queue's producer).
    #[inline]
    pub unsafe fn push(&self, record: CallRecord) {
        // SAFETY: producer-only access per the contract above.
        let active = unsafe { &*self.active.get() };
        let index = active.committed.load(Ordering::Relaxed);
        // SAFETY: slot `index` is not yet published, so the reader never looks at it.
        unsafe { *active.records[index].get() = record };
        active.committed.store(index + 1, Ordering::Release);

        if index + 1 == BUFFER_SIZE {
            // SAFETY: forwarded producer contract.
            unsafe { self.flush() };
        }
    }

    /// Move the active buffer to the ready queue and take a fresh one
    ///
    /// Blocks while every buffer the policy allows is already in flight.
    unsafe fn flush(&self) {
        // SAFETY: producer-only access.
        let slot = unsafe { &mut *self.active.get() };
        // Publish first: with a one-buffer budget the reader has to recycle
        // this very buffer before `take_empty_buffer` can return.
        // The receiver lives in `self`, so sending cannot fail.
        let _ = self.ready_tx.send(Arc::clone(slot));
        *slot = self.take_empty_buffer();
        self.active_ptr.store(Arc::as_ptr(slot).cast_mut(), Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn take_empty_buffer(&self) -> Arc<TraceBuffer> {
        if let Ok(buffer) = self.empty_rx.try_recv() {
            return buffer;
        }
        let limit = self.max_buffers.load(Ordering::Relaxed);
        if self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| (n < limit).then_some(n + 1))
            .is_ok()
        {
            return TraceBuffer::new();
        }
        match self.empty_rx.recv() {
            Ok(buffer) => buffer,
            // Unreachable while `self` holds the sender; fall back to growing.
            Err(_) => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                TraceBuffer::new()
            }
        }
    }

    /// Deliver everything published so far, in order, in one or more chunks
    ///
    /// Must not be called concurrently with itself; the collector serializes
    /// readers behind its registry lock. Returns the number of records read.
    pub fn read_collected(&self, read: &mut dyn FnMut(&[CallRecord])) -> usize {
        let generation = self.generation.load(Ordering::Acquire);
        let mut total = 0;
        let mut ready_seen = 0;

        while let Ok(buffer) = self.ready_rx.try_recv() {
            total += buffer.consume(read);
            ready_seen += 1;
            buffer.reset();
            let _ = self.empty_tx.send(buffer);
        }

        let active = self.active_ptr.load(Ordering::Acquire);
        // A flush completed since we started draining: a newer ready buffer may
        // precede the active one, so leave the active prefix for the next pass.
        if self.generation.load(Ordering::Acquire) == generation {
            // SAFETY: a flushed buffer stays referenced by the ready queue or
            // the empty pool, and only this reader drops buffers from there.
            total += unsafe { &*active }.consume(read);
        }

        let policy = *self.policy.lock().unwrap_or_else(PoisonError::into_inner);
        self.adjust_empty_buffers(&policy, ready_seen);
        total
    }

    fn adjust_empty_buffers(&self, policy: &BufferingPolicy, base: usize) {
        let high = policy.max_empty() + base;
        let low = policy.min_empty() + base;

        while self.empty_rx.len() > high {
            if self.empty_rx.try_recv().is_err() {
                break;
            }
            self.allocated.fetch_sub(1, Ordering::AcqRel);
        }

        let limit = self.max_buffers.load(Ordering::Relaxed);
        while self.empty_rx.len() < low {
            if self
                .allocated
                .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| (n < limit).then_some(n + 1))
                .is_err()
            {
                break;
            }
            let _ = self.empty_tx.send(TraceBuffer::new());
        }
    }

    pub fn set_buffering_policy(&self, policy: BufferingPolicy) {
        self.max_buffers.store(policy.max_buffers(), Ordering::Relaxed);
        *self.policy.lock().unwrap_or_else(PoisonError::into_inner) = policy;
        self.adjust_empty_buffers(&policy, 0);
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            empty: self.empty_rx.len(),
            ready: self.ready_rx.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn policy(buffers: usize, max_f: f64, min_f: f64) -> BufferingPolicy {
        BufferingPolicy::new(buffers * BUFFER_SIZE, max_f, min_f).unwrap()
    }

    fn collect(queue: &BuffersQueue) -> Vec<CallRecord> {
        let mut out = Vec::new();
        queue.read_collected(&mut |chunk| out.extend_from_slice(chunk));
        out
    }

    fn record(i: usize) -> CallRecord {
        CallRecord::enter(i + 1, i as u64)
    }

    #[test]
    fn test_reads_partial_active_buffer_once() {
        let queue = BuffersQueue::new(policy(4, 1.0, 0.0));
        for i in 0..10 {
            unsafe { queue.push(record(i)) };
        }
        assert_eq!(collect(&queue).len(), 10);
        assert!(collect(&queue).is_empty());

        unsafe { queue.push(record(10)) };
        assert_eq!(collect(&queue), vec![record(10)]);
    }

    #[test]
    fn test_full_buffers_preserve_order() {
        let queue = BuffersQueue::new(policy(8, 1.0, 0.0));
        let n = BUFFER_SIZE * 3 + 17;
        for i in 0..n {
            unsafe { queue.push(record(i)) };
        }
        let read = collect(&queue);
        assert_eq!(read.len(), n);
        assert!(read.iter().enumerate().all(|(i, r)| *r == record(i)));
    }

    #[test]
    fn test_prefix_then_rest_of_flushed_buffer() {
        let queue = BuffersQueue::new(policy(4, 1.0, 0.0));
        for i in 0..100 {
            unsafe { queue.push(record(i)) };
        }
        assert_eq!(collect(&queue).len(), 100);
        for i in 100..BUFFER_SIZE + 5 {
            unsafe { queue.push(record(i)) };
        }
        let rest = collect(&queue);
        assert_eq!(rest.len(), BUFFER_SIZE + 5 - 100);
        assert_eq!(rest[0], record(100));
    }

    #[test]
    fn test_empty_pool_prefilled_to_low_watermark() {
        let queue = BuffersQueue::new(policy(10, 0.5, 0.3));
        assert_eq!(queue.stats(), QueueStats { allocated: 4, empty: 3, ready: 0 });
    }

    #[test]
    fn test_allocation_never_exceeds_max_buffers() {
        let queue = BuffersQueue::new(policy(3, 1.0, 0.0));
        for i in 0..BUFFER_SIZE * 2 {
            unsafe { queue.push(record(i)) };
        }
        assert!(queue.stats().allocated <= 3);
        assert_eq!(collect(&queue).len(), BUFFER_SIZE * 2);
    }

    #[test]
    fn test_trims_spare_buffers_to_high_watermark() {
        let queue = BuffersQueue::new(policy(10, 1.0, 0.0));
        for i in 0..BUFFER_SIZE * 6 {
            unsafe { queue.push(record(i)) };
        }
        collect(&queue);
        queue.set_buffering_policy(policy(10, 0.1, 0.0));
        assert_eq!(queue.stats().empty, 1);
    }

    #[test]
    fn test_producer_waits_for_reader_at_limit() {
        let queue = Arc::new(BuffersQueue::new(policy(1, 1.0, 0.0)));
        let total = BUFFER_SIZE * 5;

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..total {
                    unsafe { queue.push(record(i)) };
                }
            })
        };

        let mut read = Vec::new();
        while read.len() < total {
            queue.read_collected(&mut |chunk| read.extend_from_slice(chunk));
            assert!(queue.stats().allocated <= 1);
            thread::yield_now();
        }
        producer.join().unwrap();

        assert_eq!(read.len(), total);
        assert!(read.iter().enumerate().all(|(i, r)| *r == record(i)));
    }
}
