/*!
 * Process Reaper
 *
 * Turns asynchronous child-death signals into a queryable status stream.
 *
 * The SIGCHLD handler harvests children with a non-blocking wait and
 * stores their statuses in a fixed pool of dead-child records. Records
 * live on exactly one of two intrusive lists (free, occupied); the
 * occupied list is kept most-recent-first so eviction always takes the
 * tail. Access is mediated by a binary semaphore: the handler only
 * try-acquires it, and whoever releases it re-runs the drain so no
 * signal is lost.
 */

use crate::core::errors::{RpcErrno, ToRpcErrno};
use crate::core::limits::{DEFAULT_DEAD_CHILDREN, MAX_DEAD_CHILDREN};
use crate::core::types::{Pid, TimestampMs, WaitStatus};
use libc::c_int;
use miette::Diagnostic;
use nix::errno::Errno;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Once, OnceLock};
use thiserror::Error;
use tracing::{debug, info, warn};

pub type ReaperResult<T> = Result<T, ReaperError>;

#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum ReaperError {
    #[error("Process groups are not supported (pid {0})")]
    #[diagnostic(code(reaper::invalid_pid), help("Wait for -1 or a specific pid."))]
    InvalidPid(Pid),

    #[error("Unsupported wait options {0:#x}")]
    #[diagnostic(code(reaper::invalid_options), help("Only WNOHANG is supported."))]
    UnsupportedOptions(c_int),

    #[error("No child {0} to wait for")]
    #[diagnostic(code(reaper::no_child))]
    NoChild(Pid),

    #[error("{call}() failed: {errno}")]
    #[diagnostic(code(reaper::os_error))]
    Os { call: &'static str, errno: Errno },

    #[error("Shell command {cmd:?} failed: {reason}")]
    #[diagnostic(code(reaper::shell_cmd))]
    ShellCmd { cmd: String, reason: String },
}

impl ToRpcErrno for ReaperError {
    fn rpc_errno(&self) -> RpcErrno {
        match self {
            ReaperError::InvalidPid(_) | ReaperError::UnsupportedOptions(_) => RpcErrno::InvalidArg,
            ReaperError::NoChild(_) => RpcErrno::NoChild,
            ReaperError::Os { errno, .. } => RpcErrno::from(*errno),
            ReaperError::ShellCmd { .. } => RpcErrno::ShellCmd,
        }
    }
}

// ============================================================================
// Dead-child table
// ============================================================================

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct DeadChild {
    pid: Pid,
    status: c_int,
    captured_ms: TimestampMs,
    valid: bool,
    next: u32,
}

impl DeadChild {
    const EMPTY: DeadChild = DeadChild {
        pid: 0,
        status: 0,
        captured_ms: 0,
        valid: false,
        next: NIL,
    };
}

/// A harvested status handed back to a waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadChildRecord {
    pub pid: Pid,
    pub status: c_int,
    pub captured_ms: TimestampMs,
}

/// Fixed-capacity pool of dead-child records
///
/// Storage is allocated once; `record`, `take` and `reset` never allocate
/// and are safe to run inside a signal handler.
pub struct DeadChildTable {
    slots: Box<[DeadChild]>,
    capacity: usize,
    free: u32,
    occupied: u32,
}

impl DeadChildTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_DEAD_CHILDREN);
        let mut table = Self {
            slots: vec![DeadChild::EMPTY; capacity].into_boxed_slice(),
            capacity,
            free: NIL,
            occupied: NIL,
        };
        table.reset(capacity);
        table
    }

    /// Drop every record and rebuild the free list over `capacity` slots
    ///
    /// `capacity` is clamped to the allocated storage.
    pub fn reset(&mut self, capacity: usize) {
        self.capacity = capacity.clamp(1, self.slots.len());
        self.occupied = NIL;
        self.free = NIL;
        for i in (0..self.capacity).rev() {
            self.slots[i] = DeadChild {
                next: self.free,
                ..DeadChild::EMPTY
            };
            self.free = i as u32;
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.iter_occupied().count()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == NIL
    }

    fn iter_occupied(&self) -> impl Iterator<Item = &DeadChild> + '_ {
        let mut cur = self.occupied;
        std::iter::from_fn(move || {
            if cur == NIL {
                return None;
            }
            let slot = &self.slots[cur as usize];
            cur = slot.next;
            Some(slot)
        })
    }

    /// Pids on the occupied list, most recent first
    pub fn pids(&self) -> Vec<Pid> {
        self.iter_occupied().map(|d| d.pid).collect()
    }

    /// Unlink `idx` whose predecessor is `prev` from the occupied list
    fn unlink(&mut self, prev: u32, idx: u32) {
        let next = self.slots[idx as usize].next;
        if prev == NIL {
            self.occupied = next;
        } else {
            self.slots[prev as usize].next = next;
        }
    }

    /// Store a status; returns the pid of a record that had to be evicted
    /// to make room (a stale record of the same pid is replaced silently)
    pub fn record(&mut self, pid: Pid, status: c_int, captured_ms: TimestampMs) -> Option<Pid> {
        let mut prev = NIL;
        let mut cur = self.occupied;
        let mut oldest = (NIL, NIL);
        let mut slot = NIL;

        while cur != NIL {
            let entry = self.slots[cur as usize];
            oldest = (prev, cur);
            if entry.pid == pid && entry.valid {
                self.unlink(prev, cur);
                slot = cur;
                break;
            }
            prev = cur;
            cur = entry.next;
        }

        let mut evicted = None;
        if slot == NIL && self.free != NIL {
            slot = self.free;
            self.free = self.slots[slot as usize].next;
        }
        if slot == NIL {
            let (prev, tail) = oldest;
            evicted = Some(self.slots[tail as usize].pid);
            self.unlink(prev, tail);
            slot = tail;
        }

        self.slots[slot as usize] = DeadChild {
            pid,
            status,
            captured_ms,
            valid: true,
            next: self.occupied,
        };
        self.occupied = slot;
        evicted
    }

    /// Remove and return the most recent record for `pid` (`None` = any)
    pub fn take(&mut self, pid: Option<Pid>) -> Option<DeadChildRecord> {
        let mut prev = NIL;
        let mut cur = self.occupied;

        while cur != NIL {
            let entry = self.slots[cur as usize];
            if pid.map_or(true, |p| p == entry.pid) {
                self.unlink(prev, cur);
                self.slots[cur as usize].valid = false;
                self.slots[cur as usize].next = self.free;
                self.free = cur;
                return Some(DeadChildRecord {
                    pid: entry.pid,
                    status: entry.status,
                    captured_ms: entry.captured_ms,
                });
            }
            prev = cur;
            cur = entry.next;
        }
        None
    }
}

// ============================================================================
// Reaper
// ============================================================================

/// Semaphore-guarded dead-child table shared with the SIGCHLD handler
pub struct Reaper {
    busy: AtomicBool,
    table: UnsafeCell<DeadChildTable>,
}

// SAFETY: the table is only touched while `busy` is held
unsafe impl Sync for Reaper {}

fn monotonic_ms() -> TimestampMs {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: clock_gettime is async-signal-safe and ts is a valid out pointer
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as TimestampMs * 1000 + ts.tv_nsec as TimestampMs / 1_000_000
}

impl Reaper {
    pub fn new(capacity: usize) -> Self {
        Self {
            busy: AtomicBool::new(false),
            // The pool is sized for the largest capacity so it can be
            // reconfigured without reallocating.
            table: UnsafeCell::new({
                let mut t = DeadChildTable::new(MAX_DEAD_CHILDREN);
                t.reset(capacity);
                t
            }),
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn acquire(&self) {
        while !self.try_acquire() {
            std::thread::yield_now();
        }
    }

    #[inline]
    fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Run `f` on the table with the semaphore held, then re-drain
    fn with_table<R>(&self, f: impl FnOnce(&mut DeadChildTable) -> R) -> R {
        self.acquire();
        // SAFETY: busy is held
        let result = f(unsafe { &mut *self.table.get() });
        self.release();
        // A handler that found the semaphore busy returned without work
        self.drain();
        result
    }

    /// Harvest every dead child into the table
    ///
    /// Async-signal-safe; errno is preserved. Returns immediately if the
    /// semaphore is held elsewhere.
    pub fn drain(&self) {
        let saved_errno = Errno::last_raw();
        if !self.try_acquire() {
            return;
        }

        loop {
            let mut status: c_int = 0;
            // SAFETY: waitpid is async-signal-safe
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            // SAFETY: busy is held
            let table = unsafe { &mut *self.table.get() };
            table.record(pid, status, monotonic_ms());
        }

        self.release();
        Errno::set_raw(saved_errno);
    }

    /// Remove a stored status for `pid` (`-1` = any)
    pub fn find_dead_child(&self, pid: Pid) -> Option<DeadChildRecord> {
        let wanted = (pid != -1).then_some(pid);
        self.with_table(|table| table.take(wanted))
    }

    /// Forget every stored status and optionally resize the pool
    pub fn reset(&self, capacity: usize) {
        self.with_table(|table| table.reset(capacity));
    }

    pub fn capacity(&self) -> usize {
        self.with_table(|table| table.capacity())
    }

    /// Pids with a stored status, most recent first
    pub fn pending(&self) -> Vec<Pid> {
        self.with_table(|table| table.pids())
    }

    /// Child side of fork: statuses of the parent are not inherited
    fn reset_after_fork(&self) {
        self.busy.store(false, Ordering::Release);
        // SAFETY: the child is single-threaded right after fork
        let table = unsafe { &mut *self.table.get() };
        let capacity = table.capacity();
        table.reset(capacity);
    }

    /// Wait for a child, consulting the table when the kernel no longer
    /// has it
    ///
    /// Returns `Ok(None)` when `WNOHANG` is given and the child is alive.
    pub fn waitpid(&self, pid: Pid, options: c_int) -> ReaperResult<Option<(Pid, c_int)>> {
        if pid < -1 || pid == 0 {
            return Err(ReaperError::InvalidPid(pid));
        }
        if options & !libc::WNOHANG != 0 {
            return Err(ReaperError::UnsupportedOptions(options));
        }

        let saved_errno = Errno::last_raw();
        let mut status: c_int = 0;
        // SAFETY: status is a valid out pointer
        let rc = unsafe { libc::waitpid(pid, &mut status, options) };

        if rc > 0 {
            log_child_death(rc, status);
            // Any stored status for this pid is stale now
            if pid != -1 {
                let _ = self.find_dead_child(pid);
            }
            return Ok(Some((rc, status)));
        }
        if rc == 0 {
            return Ok(None);
        }

        let errno = Errno::last();
        if errno != Errno::ECHILD {
            return Err(ReaperError::Os { call: "waitpid", errno });
        }
        Errno::set_raw(saved_errno);

        match self.find_dead_child(pid) {
            Some(record) => {
                log_child_death(record.pid, record.status);
                Ok(Some((record.pid, record.status)))
            }
            None => Err(ReaperError::NoChild(pid)),
        }
    }
}

fn log_child_death(pid: Pid, status: c_int) {
    match WaitStatus::from_raw(status) {
        WaitStatus::Exited(code) if code == 0 => debug!(pid, code, "child exited"),
        WaitStatus::Exited(code) => info!(pid, code, "child exited"),
        WaitStatus::Signaled { signal, core_dumped } => {
            warn!(pid, signal, core_dumped, "child killed by signal")
        }
        other => warn!(pid, status = ?other, "child terminated for unknown reason"),
    }
}

// ============================================================================
// Process-wide instance
// ============================================================================

static REAPER: OnceLock<Reaper> = OnceLock::new();

/// Process-wide reaper; created with the default capacity on first use
pub fn reaper() -> &'static Reaper {
    REAPER.get_or_init(|| Reaper::new(DEFAULT_DEAD_CHILDREN))
}

extern "C" fn sigchld_handler(_signum: c_int) {
    if let Some(reaper) = REAPER.get() {
        reaper.drain();
    }
}

extern "C" fn after_fork_child() {
    if let Some(reaper) = REAPER.get() {
        reaper.reset_after_fork();
    }
}

/// Install the SIGCHLD handler and the fork hook
///
/// May be called again to change the pool capacity; stored statuses are
/// dropped in that case.
pub fn install(capacity: usize) -> ReaperResult<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    static HOOKS: Once = Once::new();

    let reaper = reaper();
    reaper.reset(capacity);

    let mut result: ReaperResult<()> = Ok(());
    HOOKS.call_once(|| {
        let action = SigAction::new(
            SigHandler::Handler(sigchld_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: the handler only calls async-signal-safe functions
        if let Err(errno) = unsafe { sigaction(Signal::SIGCHLD, &action) } {
            result = Err(ReaperError::Os { call: "sigaction", errno });
            return;
        }
        // SAFETY: the hook only resets plain memory
        let rc = unsafe { libc::pthread_atfork(None, None, Some(after_fork_child)) };
        if rc != 0 {
            result = Err(ReaperError::Os {
                call: "pthread_atfork",
                errno: Errno::from_raw(rc),
            });
        }
    });
    result?;

    info!(capacity = reaper.capacity(), "process reaper installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_every_slot_on_one_list() {
        let mut table = DeadChildTable::new(4);
        assert!(table.is_empty());

        table.record(10, 0, 1);
        table.record(11, 0, 2);
        assert_eq!(table.len(), 2);
        assert_eq!(table.pids(), vec![11, 10]);

        assert!(table.take(Some(10)).is_some());
        assert_eq!(table.len(), 1);
        // Freed slot is reusable: fill to capacity without eviction
        assert_eq!(table.record(12, 0, 3), None);
        assert_eq!(table.record(13, 0, 4), None);
        assert_eq!(table.record(14, 0, 5), None);
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_oldest_is_evicted_when_full() {
        let mut table = DeadChildTable::new(4);
        for pid in 1..=4 {
            assert_eq!(table.record(pid, pid, pid as u64), None);
        }

        assert_eq!(table.record(5, 5, 5), Some(1));
        assert_eq!(table.pids(), vec![5, 4, 3, 2]);
        assert!(table.take(Some(1)).is_none());
        assert_eq!(table.take(Some(2)).map(|r| r.status), Some(2));
    }

    #[test]
    fn test_same_pid_replaces_stale_record() {
        let mut table = DeadChildTable::new(4);
        table.record(7, 1, 1);
        table.record(8, 0, 2);
        assert_eq!(table.record(7, 2, 3), None);

        assert_eq!(table.len(), 2);
        assert_eq!(table.pids(), vec![7, 8]);
        assert_eq!(table.take(Some(7)).map(|r| r.status), Some(2));
        assert!(table.take(Some(7)).is_none());
    }

    #[test]
    fn test_take_any_returns_most_recent() {
        let mut table = DeadChildTable::new(8);
        table.record(1, 0, 1);
        table.record(2, 0, 2);

        assert_eq!(table.take(None).map(|r| r.pid), Some(2));
        assert_eq!(table.take(None).map(|r| r.pid), Some(1));
        assert_eq!(table.take(None), None);
    }

    #[test]
    fn test_reset_clamps_capacity() {
        let mut table = DeadChildTable::new(4);
        table.reset(100);
        assert_eq!(table.capacity(), 4);
        table.reset(0);
        assert_eq!(table.capacity(), 1);
    }

    #[test]
    fn test_wait_argument_validation() {
        let reaper = Reaper::new(4);
        assert_eq!(reaper.waitpid(0, 0), Err(ReaperError::InvalidPid(0)));
        assert_eq!(reaper.waitpid(-5, 0), Err(ReaperError::InvalidPid(-5)));
        assert_eq!(
            reaper.waitpid(1, libc::WUNTRACED).unwrap_err().rpc_errno(),
            RpcErrno::InvalidArg
        );
    }
}
