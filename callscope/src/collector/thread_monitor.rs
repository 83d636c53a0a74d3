//! Thread identity and timing for instrumented threads
//!
//! Every thread that makes an instrumented call registers itself once and gets
//! a dense [`ThreadId`]. The monitor remembers the OS thread id, the thread's
//! name, when it started, when it ended (set from a thread-local destructor)
//! and its CPU time, refreshed on every query while the thread is alive.

// pthread_getcpuclockid/clock_gettime/gettid are plain libc calls
#![allow(unsafe_code)]

use crate::domain::{CollectorError, ThreadId};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, SystemTime};

static NEXT_MONITOR_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    /// OS thread id (`gettid`)
    pub native_id: u64,
    pub description: String,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub cpu_time: Duration,
}

impl ThreadInfo {
    #[must_use]
    pub fn complete(&self) -> bool {
        self.end_time.is_some()
    }
}

struct ThreadEntry {
    info: ThreadInfo,
    cpu_clock: Option<libc::clockid_t>,
}

#[derive(Default)]
struct MonitorInner {
    threads: Mutex<Vec<ThreadEntry>>,
}

impl MonitorInner {
    fn finish(&self, id: ThreadId) {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = threads.get_mut(id.0 as usize) {
            if let Some(cpu) = entry.cpu_clock.and_then(read_cpu_clock) {
                entry.info.cpu_time = cpu;
            }
            entry.cpu_clock = None;
            entry.info.end_time = Some(SystemTime::now());
        }
    }
}

/// Marks the thread finished when its thread-local storage is torn down
struct ExitGuard {
    monitor_id: usize,
    monitor: Weak<MonitorInner>,
    thread_id: ThreadId,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.finish(self.thread_id);
        }
    }
}

thread_local! {
    static EXIT_GUARDS: RefCell<Vec<ExitGuard>> = const { RefCell::new(Vec::new()) };
}

pub struct ThreadMonitor {
    id: usize,
    inner: Arc<MonitorInner>,
}

impl ThreadMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self { id: NEXT_MONITOR_ID.fetch_add(1, Ordering::Relaxed), inner: Arc::default() }
    }

    /// Register the calling thread, returning its id
    ///
    /// Idempotent: calling again from the same thread returns the same id.
    pub fn register_self(&self) -> ThreadId {
        let existing = EXIT_GUARDS.with(|guards| {
            guards.borrow().iter().find(|g| g.monitor_id == self.id).map(|g| g.thread_id)
        });
        if let Some(id) = existing {
            return id;
        }

        let cpu_clock = current_cpu_clock();
        let info = ThreadInfo {
            native_id: current_native_id(),
            description: std::thread::current().name().unwrap_or_default().to_string(),
            start_time: SystemTime::now(),
            end_time: None,
            cpu_time: cpu_clock.and_then(read_cpu_clock).unwrap_or_default(),
        };

        let id = {
            let mut threads = self.inner.threads.lock().unwrap_or_else(PoisonError::into_inner);
            let id = ThreadId(u32::try_from(threads.len()).unwrap_or(u32::MAX));
            threads.push(ThreadEntry { info, cpu_clock });
            id
        };

        log::debug!("registered thread {id} (native {})", current_native_id());
        let guard = ExitGuard { monitor_id: self.id, monitor: Arc::downgrade(&self.inner), thread_id: id };
        // Fails only while the thread is already tearing down its TLS.
        let _ = EXIT_GUARDS.try_with(|guards| guards.borrow_mut().push(guard));
        id
    }

    /// Current information about a registered thread
    ///
    /// # Errors
    /// Returns [`CollectorError::UnknownThread`] for ids this monitor never issued.
    pub fn get_info(&self, id: ThreadId) -> Result<ThreadInfo, CollectorError> {
        let mut threads = self.inner.threads.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = threads.get_mut(id.0 as usize).ok_or(CollectorError::UnknownThread(id))?;
        if let Some(cpu) = entry.cpu_clock.and_then(read_cpu_clock) {
            entry.info.cpu_time = cpu;
        }
        Ok(entry.info.clone())
    }

    /// Information about several threads, skipping unknown ids
    #[must_use]
    pub fn get_infos(&self, ids: &[ThreadId]) -> Vec<(ThreadId, ThreadInfo)> {
        ids.iter().filter_map(|&id| self.get_info(id).ok().map(|info| (id, info))).collect()
    }
}

impl Default for ThreadMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn current_native_id() -> u64 {
    // SAFETY: gettid takes no arguments and cannot fail
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    u64::try_from(tid).unwrap_or_default()
}

fn current_cpu_clock() -> Option<libc::clockid_t> {
    let mut clock: libc::clockid_t = 0;
    // SAFETY: pthread_self is always valid for the calling thread; `clock` is a valid out pointer
    let rc = unsafe { libc::pthread_getcpuclockid(libc::pthread_self(), &mut clock) };
    (rc == 0).then_some(clock)
}

fn read_cpu_clock(clock: libc::clockid_t) -> Option<Duration> {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `ts` is a valid out pointer; a stale clock id yields EINVAL, not UB
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    if rc != 0 {
        return None;
    }
    let secs = u64::try_from(ts.tv_sec).ok()?;
    let nanos = u32::try_from(ts.tv_nsec).ok()?;
    Some(Duration::new(secs, nanos))
}
