//! # Calls Collector
//!
//! Entry point of the instrumentation hooks. Each thunk calls [`on_enter`]
//! with the collector, the callee address and the stack slot holding the
//! caller's return address. The hook saves that address on a per-thread
//! *return stack* and overwrites the slot with the exit stub, so the function
//! returns into the stub, which calls [`on_exit`] and resumes at the saved
//! address.
//!
//! ## Per-thread state
//!
//! Every thread that enters an instrumented function gets a [`ThreadTrace`]:
//! its [`BuffersQueue`] and its return stack. The collector keeps all traces
//! in a registry (so the reader can drain threads that already exited) and
//! the calling thread caches a pointer to its own trace in a thread-local.
//!
//! ## Tail calls
//!
//! A function that tail-calls another instrumented function re-enters a thunk
//! with the same return slot. The collector then records an exit for the
//! function being replaced instead of pushing another return entry.

// The hooks are called from generated code with raw pointers to stack slots.
#![allow(unsafe_code)]

use super::buffers_queue::BuffersQueue;
use super::policy::BufferingPolicy;
use super::thread_monitor::ThreadMonitor;
use crate::clock::read_tick_counter;
use crate::domain::ThreadId;
use callscope_common::CallRecord;
use std::cell::{Cell, UnsafeCell};
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

static NEXT_COLLECTOR_ID: AtomicUsize = AtomicUsize::new(1);

const RETURN_STACK_RESERVE: usize = 1024;
const CALIBRATION_ROUNDS: usize = 10_000;
const CALIBRATION_CALLEE: usize = 0xCA11;

thread_local! {
    /// `(collector id, trace)` for the last collector this thread reported to.
    static CURRENT_TRACE: Cell<(usize, *const ThreadTrace)> =
        const { Cell::new((0, std::ptr::null())) };
}

/// Consumer of per-thread call traces
pub trait CallsAcceptor {
    /// Receive the next chunk of `thread_id`'s trace
    ///
    /// Chunks of one thread arrive in chronological order; a call may start in
    /// one chunk and end in a later one.
    fn accept_calls(&mut self, thread_id: ThreadId, calls: &[CallRecord]);
}

/// Hook latency split around the recorded timestamps
///
/// `inner` is the part of the enter/exit cost that falls between the two
/// timestamps of a call (so it inflates the callee's time); `outer` is the rest,
/// which the caller pays for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Overhead {
    pub inner: u64,
    pub outer: u64,
}

impl Overhead {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.inner + self.outer
    }
}

#[derive(Clone, Copy)]
struct ReturnEntry {
    slot: usize,
    return_address: usize,
}

/// Trace state of one producer thread
pub struct ThreadTrace {
    thread_id: ThreadId,
    native: std::thread::ThreadId,
    queue: BuffersQueue,
    /// Only touched by the owning thread.
    return_stack: UnsafeCell<Vec<ReturnEntry>>,
}

// SAFETY: `return_stack` and the producer side of `queue` are only used from
// the owning thread; the reader side of `queue` is thread-safe.
unsafe impl Sync for ThreadTrace {}
unsafe impl Send for ThreadTrace {}

impl ThreadTrace {
    fn new(thread_id: ThreadId, policy: BufferingPolicy) -> Self {
        let mut return_stack = Vec::with_capacity(RETURN_STACK_RESERVE);
        // Sentinel: never popped because no slot compares above it.
        return_stack.push(ReturnEntry { slot: usize::MAX, return_address: 0 });
        Self {
            thread_id,
            native: std::thread::current().id(),
            queue: BuffersQueue::new(policy),
            return_stack: UnsafeCell::new(return_stack),
        }
    }

    #[inline]
    fn track(&self, callee: usize, timestamp: u64) {
        // SAFETY: only called on the owning thread.
        unsafe { self.queue.push(CallRecord { callee, timestamp }) };
    }

    /// # Safety
    /// Owning thread only; `return_slot` must point at a readable, writable slot.
    #[inline]
    unsafe fn enter(&self, callee: usize, return_slot: *mut *const c_void, exit_stub: *const c_void) {
        let timestamp = read_tick_counter();
        // SAFETY: owning thread.
        let stack = unsafe { &mut *self.return_stack.get() };
        let slot = return_slot as usize;

        if stack.last().is_some_and(|top| top.slot == slot) {
            self.track(0, timestamp);
        } else {
            // SAFETY: caller guarantees the slot is valid.
            let return_address = unsafe { *return_slot } as usize;
            stack.push(ReturnEntry { slot, return_address });
            unsafe { *return_slot = exit_stub };
        }
        self.track(callee, timestamp);
    }

    /// Pop every frame at or below `return_slot`, one exit record each
    ///
    /// Returns the return address saved for the outermost popped frame, or
    /// null if nothing matched.
    #[inline]
    unsafe fn exit(&self, return_slot: *mut *const c_void) -> *const c_void {
        let timestamp = read_tick_counter();
        // SAFETY: owning thread.
        let stack = unsafe { &mut *self.return_stack.get() };
        let slot = return_slot as usize;
        let mut return_address = 0;

        while stack.last().is_some_and(|top| top.slot <= slot) {
            if let Some(entry) = stack.pop() {
                return_address = entry.return_address;
                self.track(0, timestamp);
            }
        }
        return_address as *const c_void
    }

    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

pub struct CallsCollector {
    id: usize,
    monitor: Arc<ThreadMonitor>,
    policy: Mutex<BufferingPolicy>,
    traces: Mutex<Vec<Arc<ThreadTrace>>>,
}

impl CallsCollector {
    #[must_use]
    pub fn new(monitor: Arc<ThreadMonitor>, policy: BufferingPolicy) -> Self {
        Self {
            id: NEXT_COLLECTOR_ID.fetch_add(1, Ordering::Relaxed),
            monitor,
            policy: Mutex::new(policy),
            traces: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn thread_monitor(&self) -> &Arc<ThreadMonitor> {
        &self.monitor
    }

    #[inline]
    fn current_trace(&self) -> &ThreadTrace {
        let (id, trace) = CURRENT_TRACE.with(Cell::get);
        if id == self.id && !trace.is_null() {
            // SAFETY: the registry keeps the trace alive as long as `self`.
            return unsafe { &*trace };
        }
        self.construct_thread_trace()
    }

    #[cold]
    fn construct_thread_trace(&self) -> &ThreadTrace {
        let native = std::thread::current().id();
        let mut traces = self.traces.lock().unwrap_or_else(PoisonError::into_inner);

        let trace = if let Some(trace) = traces.iter().find(|t| t.native == native) {
            Arc::as_ptr(trace)
        } else {
            let thread_id = self.monitor.register_self();
            let policy = *self.policy.lock().unwrap_or_else(PoisonError::into_inner);
            let trace = Arc::new(ThreadTrace::new(thread_id, policy));
            let ptr = Arc::as_ptr(&trace);
            traces.push(trace);
            log::debug!("collector {}: tracing thread {thread_id}", self.id);
            ptr
        };

        CURRENT_TRACE.with(|current| current.set((self.id, trace)));
        // SAFETY: entries are never removed from the registry while `self` lives.
        unsafe { &*trace }
    }

    /// Record a raw event for the calling thread
    ///
    /// `callee == 0` records an exit. Used by calibration and by callers that
    /// feed the collector without going through patched code.
    pub fn track(&self, callee: usize) {
        self.current_trace().track(callee, read_tick_counter());
    }

    /// Drain every thread's published records into `acceptor`
    ///
    /// Serialized by the registry lock: concurrent readers take turns.
    pub fn read_collected(&self, acceptor: &mut dyn CallsAcceptor) -> usize {
        let traces = self.traces.lock().unwrap_or_else(PoisonError::into_inner);
        let mut total = 0;
        for trace in traces.iter() {
            let thread_id = trace.thread_id;
            total += trace.queue.read_collected(&mut |calls| acceptor.accept_calls(thread_id, calls));
        }
        total
    }

    /// Apply `policy` to existing and future thread queues
    pub fn set_buffering_policy(&self, policy: BufferingPolicy) {
        *self.policy.lock().unwrap_or_else(PoisonError::into_inner) = policy;
        let traces = self.traces.lock().unwrap_or_else(PoisonError::into_inner);
        for trace in traces.iter() {
            trace.queue.set_buffering_policy(policy);
        }
    }

    /// Ids of all threads that reported to this collector
    #[must_use]
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        let traces = self.traces.lock().unwrap_or_else(PoisonError::into_inner);
        traces.iter().map(|t| t.thread_id).collect()
    }

    /// Measure the hooks' own latency
    ///
    /// Runs enter/exit pairs through a private collector on the calling thread.
    /// `inner` is the minimum gap between an enter and its exit record; the
    /// total is the minimum wall time of a whole pair as seen by a caller.
    #[must_use]
    pub fn calibrate() -> Overhead {
        struct Gaps {
            inner: u64,
        }

        impl CallsAcceptor for Gaps {
            fn accept_calls(&mut self, _: ThreadId, calls: &[CallRecord]) {
                for pair in calls.chunks_exact(2) {
                    self.inner = self.inner.min(pair[1].timestamp.saturating_sub(pair[0].timestamp));
                }
            }
        }

        let private = Self::new(Arc::new(ThreadMonitor::new()), BufferingPolicy::default());
        let mut total = u64::MAX;
        let mut gaps = Gaps { inner: u64::MAX };

        for round in 0..CALIBRATION_ROUNDS {
            let mut slot = CALIBRATION_CALLEE as *const c_void;
            let slot_ptr: *mut *const c_void = &mut slot;
            let start = read_tick_counter();
            // SAFETY: `slot` is a live local; `private` outlives both calls.
            unsafe {
                on_enter(&private, CALIBRATION_CALLEE as *const c_void, slot_ptr, std::ptr::null());
                on_exit(&private, slot_ptr);
            }
            total = total.min(read_tick_counter().saturating_sub(start));

            if round % 256 == 255 {
                private.read_collected(&mut gaps);
            }
        }
        private.read_collected(&mut gaps);

        let inner = if gaps.inner == u64::MAX { 0 } else { gaps.inner };
        let overhead = Overhead { inner, outer: total.saturating_sub(inner) };
        log::debug!("hook overhead calibrated: inner {} / outer {} ticks", overhead.inner, overhead.outer);
        overhead
    }
}

/// Enter hook called by every thunk
///
/// Saves `*return_slot`, replaces it with `exit_stub` and records the entry.
///
/// # Safety
/// `collector` must be live; `return_slot` must be the current frame's return
/// address slot.
pub unsafe extern "C" fn on_enter(
    collector: *const CallsCollector,
    callee: *const c_void,
    return_slot: *mut *const c_void,
    exit_stub: *const c_void,
) {
    // SAFETY: forwarded caller contract.
    unsafe { (*collector).current_trace().enter(callee as usize, return_slot, exit_stub) };
}

/// Exit hook called by the exit stub
///
/// Records the exit and returns where the instrumented function should have
/// returned to.
///
/// # Safety
/// `collector` must be live; `return_slot` must be the slot `on_enter`
/// rewrote for the returning frame.
pub unsafe extern "C" fn on_exit(
    collector: *const CallsCollector,
    return_slot: *mut *const c_void,
) -> *const c_void {
    // SAFETY: forwarded caller contract.
    let return_address = unsafe { (*collector).current_trace().exit(return_slot) };
    if return_address.is_null() {
        log::error!("return stack underflow at slot {return_slot:p}");
        std::process::abort();
    }
    return_address
}
