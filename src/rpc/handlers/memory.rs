/*!
 * Memory Call Handler
 *
 * Descriptor sets, signal sets and raw buffers owned by the agent and
 * named by handles. Buffers remember their allocation size; any access
 * outside it is rejected before memory is touched.
 */

use crate::core::errors::{AgentError, Result, RpcErrno};
use crate::core::handles::{global, HandleEntry, HandleRegistry};
use crate::core::limits::{BUF_PATTERN_RANDOM, MAX_RPC_BUFFER_LEN};
use crate::core::types::{Address, Fd, HandleId, HandleKind};
use crate::rpc::handler::{CallContext, RpcHandler};
use crate::rpc::types::{RpcCall, RpcOutput};
use libc::{c_void, fd_set, sigset_t};
use nix::errno::Errno;
use rand::RngCore;
use tracing::debug;

/// Handler for handle-backed memory calls
pub struct MemoryHandler {
    handles: &'static HandleRegistry,
}

impl MemoryHandler {
    pub fn new() -> Self {
        Self { handles: global() }
    }

    // ------------------------------------------------------------------
    // Descriptor sets
    // ------------------------------------------------------------------

    fn fd_set_new(&self) -> Result<RpcOutput> {
        // SAFETY: an all-zero fd_set is the empty set
        let set: Box<fd_set> = Box::new(unsafe { std::mem::zeroed() });
        let addr = Box::into_raw(set) as Address;
        let id = self.handles.alloc(addr, HandleKind::FdSet)?;
        Ok(RpcOutput::Handle(id))
    }

    fn fd_set_delete(&self, id: HandleId) -> Result<RpcOutput> {
        if let Some(entry) = self.handles.free(id, HandleKind::FdSet)? {
            // SAFETY: FdSet handles are only ever created by fd_set_new
            drop(unsafe { Box::from_raw(entry.addr as *mut fd_set) });
        }
        Ok(RpcOutput::Unit)
    }

    /// Run `f` on a live descriptor set while its handle is pinned
    fn with_fd_set<R>(&self, id: HandleId, f: impl FnOnce(*mut fd_set) -> R) -> Result<R> {
        self.handles.with_entry(id, HandleKind::FdSet, |entry| match entry {
            Some(entry) => Ok(f(entry.addr as *mut fd_set)),
            None => Err(AgentError::rpc(RpcErrno::Fault, "null descriptor set")),
        })?
    }

    fn fd_in_range(fd: Fd) -> Result<()> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            return Err(AgentError::invalid_arg(format!("fd {} does not fit in fd_set", fd)));
        }
        Ok(())
    }

    fn fd_set_op(&self, call: &RpcCall) -> Result<RpcOutput> {
        // SAFETY: the closures run on a live fd_set owned by the registry
        match *call {
            RpcCall::FdZero { set } => self.with_fd_set(set, |ptr| unsafe { libc::FD_ZERO(ptr) })?,
            RpcCall::FdSet { fd, set } => {
                Self::fd_in_range(fd)?;
                self.with_fd_set(set, |ptr| unsafe { libc::FD_SET(fd, ptr) })?
            }
            RpcCall::FdClr { fd, set } => {
                Self::fd_in_range(fd)?;
                self.with_fd_set(set, |ptr| unsafe { libc::FD_CLR(fd, ptr) })?
            }
            RpcCall::FdIsSet { fd, set } => {
                Self::fd_in_range(fd)?;
                let member = self.with_fd_set(set, |ptr| unsafe { libc::FD_ISSET(fd, ptr) })?;
                return Ok(RpcOutput::Bool(member));
            }
            _ => return Err(AgentError::invalid_arg("not a descriptor-set call")),
        }
        Ok(RpcOutput::Unit)
    }

    // ------------------------------------------------------------------
    // Signal sets
    // ------------------------------------------------------------------

    fn sigset_new(&self) -> Result<RpcOutput> {
        // SAFETY: sigemptyset initializes the zeroed storage
        let mut set: Box<sigset_t> = Box::new(unsafe { std::mem::zeroed() });
        unsafe { libc::sigemptyset(set.as_mut()) };
        let id = self.handles.alloc(Box::into_raw(set) as Address, HandleKind::SigSet)?;
        Ok(RpcOutput::Handle(id))
    }

    fn sigset_delete(&self, id: HandleId) -> Result<RpcOutput> {
        if let Some(entry) = self.handles.free(id, HandleKind::SigSet)? {
            // SAFETY: SigSet handles are only ever created by sigset_new
            drop(unsafe { Box::from_raw(entry.addr as *mut sigset_t) });
        }
        Ok(RpcOutput::Unit)
    }

    fn sigset_op(&self, call: &RpcCall) -> Result<RpcOutput> {
        let (set, rpc) = match *call {
            RpcCall::SigEmptySet { set } => (set, "sigemptyset"),
            RpcCall::SigFillSet { set } => (set, "sigfillset"),
            RpcCall::SigAddSet { set, .. } => (set, "sigaddset"),
            RpcCall::SigDelSet { set, .. } => (set, "sigdelset"),
            RpcCall::SigIsMember { set, .. } => (set, "sigismember"),
            _ => return Err(AgentError::invalid_arg("not a signal-set call")),
        };
        let rc = self.handles.with_entry(set, HandleKind::SigSet, |entry| {
            let ptr = match entry {
                Some(entry) => entry.addr as *mut sigset_t,
                None => return Err(AgentError::rpc(RpcErrno::Fault, "null signal set")),
            };
            // SAFETY: ptr names a live sigset_t pinned by the registry lock
            Ok(unsafe {
                match *call {
                    RpcCall::SigEmptySet { .. } => libc::sigemptyset(ptr),
                    RpcCall::SigFillSet { .. } => libc::sigfillset(ptr),
                    RpcCall::SigAddSet { signum, .. } => libc::sigaddset(ptr, signum),
                    RpcCall::SigDelSet { signum, .. } => libc::sigdelset(ptr, signum),
                    RpcCall::SigIsMember { signum, .. } => libc::sigismember(ptr, signum),
                    _ => -1,
                }
            })
        })??;
        if rc < 0 {
            return Err(AgentError::os(rpc, Errno::last()));
        }
        match call {
            RpcCall::SigIsMember { .. } => Ok(RpcOutput::Bool(rc == 1)),
            _ => Ok(RpcOutput::Unit),
        }
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    fn malloc(&self, size: usize) -> Result<RpcOutput> {
        if size > MAX_RPC_BUFFER_LEN {
            return Err(AgentError::invalid_arg(format!("buffer of {} bytes is too large", size)));
        }
        // SAFETY: plain allocation, released by free()
        let ptr = unsafe { libc::malloc(size.max(1)) };
        if ptr.is_null() {
            return Err(AgentError::os("malloc", Errno::ENOMEM));
        }
        let id = self.handles.alloc_sized(ptr as Address, HandleKind::Buffer, size)?;
        debug!(id, size, "buffer allocated");
        Ok(RpcOutput::Handle(id))
    }

    fn memalign(&self, alignment: usize, size: usize) -> Result<RpcOutput> {
        if size > MAX_RPC_BUFFER_LEN {
            return Err(AgentError::invalid_arg(format!("buffer of {} bytes is too large", size)));
        }
        let mut ptr: *mut c_void = std::ptr::null_mut();
        // SAFETY: ptr is a valid out pointer
        let rc = unsafe { libc::posix_memalign(&mut ptr, alignment, size.max(1)) };
        if rc != 0 {
            return Err(AgentError::os("posix_memalign", Errno::from_raw(rc)));
        }
        let id = self.handles.alloc_sized(ptr as Address, HandleKind::Buffer, size)?;
        debug!(id, size, alignment, "aligned buffer allocated");
        Ok(RpcOutput::Handle(id))
    }

    fn free(&self, id: HandleId) -> Result<RpcOutput> {
        if let Some(entry) = self.handles.free(id, HandleKind::Buffer)? {
            // SAFETY: Buffer handles come from malloc or posix_memalign
            unsafe { libc::free(entry.addr as *mut c_void) };
            debug!(id, size = entry.size, "buffer released");
        }
        Ok(RpcOutput::Unit)
    }

    /// Bounds-checked pointer to `len` bytes at `offset`; None for handle 0
    /// with zero length
    fn bounded(id: HandleId, entry: Option<HandleEntry>, offset: usize, len: usize) -> Result<Option<*mut u8>> {
        let entry = match entry {
            Some(entry) => entry,
            None if len == 0 => return Ok(None),
            None => return Err(AgentError::rpc(RpcErrno::Fault, "null buffer with non-zero length")),
        };
        let end = offset
            .checked_add(len)
            .ok_or_else(|| AgentError::invalid_arg("offset overflow"))?;
        if end > entry.size {
            return Err(AgentError::invalid_arg(format!(
                "range {}..{} outside buffer {} of {} bytes",
                offset, end, id, entry.size
            )));
        }
        Ok(Some((entry.addr + offset) as *mut u8))
    }

    /// Run `f` over checked regions `(id, offset, len)` of live buffers
    ///
    /// The pointers are only valid inside `f`; a concurrent `Free` of any of
    /// the buffers waits until it returns.
    fn with_regions<R>(&self, spans: &[(HandleId, usize, usize)], f: impl FnOnce(&[Option<*mut u8>]) -> R) -> Result<R> {
        let keys: Vec<_> = spans.iter().map(|&(id, _, _)| (id, HandleKind::Buffer)).collect();
        self.handles.with_entries(&keys, |entries| {
            let regions = spans
                .iter()
                .zip(entries)
                .map(|(&(id, offset, len), entry)| Self::bounded(id, *entry, offset, len))
                .collect::<Result<Vec<_>>>()?;
            Ok(f(&regions))
        })?
    }

    fn set_buf(&self, src: &[u8], dst: HandleId, offset: usize) -> Result<RpcOutput> {
        self.with_regions(&[(dst, offset, src.len())], |regions| {
            if let Some(ptr) = regions[0] {
                // SAFETY: the destination range was checked and is pinned
                unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), ptr, src.len()) };
            }
        })?;
        Ok(RpcOutput::Unit)
    }

    fn get_buf(&self, src: HandleId, offset: usize, len: usize) -> Result<RpcOutput> {
        let data = self.with_regions(&[(src, offset, len)], |regions| match regions[0] {
            // SAFETY: the source range was checked and is pinned
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec(),
            None => Vec::new(),
        })?;
        Ok(RpcOutput::Bytes(data))
    }

    fn set_buf_pattern(&self, pattern: u32, dst: HandleId, offset: usize, len: usize) -> Result<RpcOutput> {
        self.with_regions(&[(dst, offset, len)], |regions| {
            if let Some(ptr) = regions[0] {
                // SAFETY: the destination range was checked and is pinned
                let target = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
                if pattern >= BUF_PATTERN_RANDOM {
                    rand::thread_rng().fill_bytes(target);
                } else {
                    target.fill(pattern as u8);
                }
            }
        })?;
        Ok(RpcOutput::Unit)
    }

    fn memcmp(&self, buf1: HandleId, off1: usize, buf2: HandleId, off2: usize, n: usize) -> Result<RpcOutput> {
        let diff = self.with_regions(&[(buf1, off1, n), (buf2, off2, n)], |regions| {
            let (a, b) = match (regions[0], regions[1]) {
                (Some(a), Some(b)) => (a, b),
                _ => return 0,
            };
            // SAFETY: both ranges were checked and are pinned
            let (a, b) = unsafe { (std::slice::from_raw_parts(a, n), std::slice::from_raw_parts(b, n)) };
            a.iter()
                .zip(b)
                .find(|(x, y)| x != y)
                .map_or(0, |(x, y)| i64::from(*x) - i64::from(*y))
        })?;
        Ok(RpcOutput::Int(diff))
    }
}

impl Default for MemoryHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcHandler for MemoryHandler {
    fn handle(&self, _ctx: &mut CallContext<'_>, call: &RpcCall) -> Option<Result<RpcOutput>> {
        match call {
            RpcCall::FdSetNew => Some(self.fd_set_new()),
            RpcCall::FdSetDelete { set } => Some(self.fd_set_delete(*set)),
            RpcCall::FdZero { .. } | RpcCall::FdSet { .. } | RpcCall::FdClr { .. } | RpcCall::FdIsSet { .. } => {
                Some(self.fd_set_op(call))
            }
            RpcCall::SigSetNew => Some(self.sigset_new()),
            RpcCall::SigSetDelete { set } => Some(self.sigset_delete(*set)),
            RpcCall::SigEmptySet { .. }
            | RpcCall::SigFillSet { .. }
            | RpcCall::SigAddSet { .. }
            | RpcCall::SigDelSet { .. }
            | RpcCall::SigIsMember { .. } => Some(self.sigset_op(call)),
            RpcCall::Malloc { size } => Some(self.malloc(*size)),
            RpcCall::Memalign { alignment, size } => Some(self.memalign(*alignment, *size)),
            RpcCall::Free { buf } => Some(self.free(*buf)),
            RpcCall::SetBuf { src, dst, offset } => Some(self.set_buf(src, *dst, *offset)),
            RpcCall::GetBuf { src, offset, len } => Some(self.get_buf(*src, *offset, *len)),
            RpcCall::SetBufPattern {
                pattern,
                dst,
                offset,
                len,
            } => Some(self.set_buf_pattern(*pattern, *dst, *offset, *len)),
            RpcCall::Memcmp {
                buf1,
                off1,
                buf2,
                off2,
                n,
            } => Some(self.memcmp(*buf1, *off1, *buf2, *off2, *n)),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        "memory_handler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ToRpcErrno;
    use crate::symbols::Primitives;
    use pretty_assertions::assert_eq;

    fn run(call: RpcCall) -> Result<RpcOutput> {
        let prims = Primitives::new(true);
        let mut ctx = CallContext::new(&prims, 0);
        MemoryHandler::new().handle(&mut ctx, &call).unwrap()
    }

    fn handle_of(out: RpcOutput) -> HandleId {
        match out {
            RpcOutput::Handle(id) => id,
            other => panic!("expected a handle, got {:?}", other),
        }
    }

    #[test]
    fn test_set_then_get_buf() {
        let buf = handle_of(run(RpcCall::Malloc { size: 64 }).unwrap());
        run(RpcCall::SetBuf {
            src: b"abcdef".to_vec(),
            dst: buf,
            offset: 10,
        })
        .unwrap();
        let out = run(RpcCall::GetBuf {
            src: buf,
            offset: 10,
            len: 4,
        })
        .unwrap();
        assert_eq!(out, RpcOutput::Bytes(b"abcd".to_vec()));
        run(RpcCall::Free { buf }).unwrap();
    }

    #[test]
    fn test_out_of_bounds_and_null() {
        let buf = handle_of(run(RpcCall::Malloc { size: 8 }).unwrap());
        let err = run(RpcCall::GetBuf {
            src: buf,
            offset: 4,
            len: 5,
        })
        .unwrap_err();
        assert_eq!(err.rpc_errno(), RpcErrno::InvalidArg);

        let err = run(RpcCall::GetBuf {
            src: 0,
            offset: 0,
            len: 1,
        })
        .unwrap_err();
        assert_eq!(err.rpc_errno(), RpcErrno::Fault);

        assert_eq!(
            run(RpcCall::GetBuf {
                src: 0,
                offset: 0,
                len: 0
            })
            .unwrap(),
            RpcOutput::Bytes(Vec::new())
        );
        run(RpcCall::Free { buf }).unwrap();

        let err = run(RpcCall::Free { buf }).unwrap_err();
        assert_eq!(err.rpc_errno(), RpcErrno::InvalidArg);
    }

    #[test]
    fn test_pattern_and_memcmp() {
        let a = handle_of(run(RpcCall::Memalign { alignment: 64, size: 32 }).unwrap());
        let b = handle_of(run(RpcCall::Malloc { size: 32 }).unwrap());
        for dst in [a, b] {
            run(RpcCall::SetBufPattern {
                pattern: 0x5A,
                dst,
                offset: 0,
                len: 32,
            })
            .unwrap();
        }
        let cmp = RpcCall::Memcmp {
            buf1: a,
            off1: 0,
            buf2: b,
            off2: 0,
            n: 32,
        };
        assert_eq!(run(cmp.clone()).unwrap(), RpcOutput::Int(0));

        run(RpcCall::SetBuf {
            src: vec![0x5B],
            dst: b,
            offset: 7,
        })
        .unwrap();
        assert_eq!(run(cmp).unwrap(), RpcOutput::Int(-1));

        run(RpcCall::Free { buf: a }).unwrap();
        run(RpcCall::Free { buf: b }).unwrap();
    }

    #[test]
    fn test_free_races_with_buffer_access() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let stop = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    let mut served = 0u32;
                    while !stop.load(Ordering::Relaxed) {
                        let buf = handle_of(run(RpcCall::Malloc { size: 4096 }).unwrap());
                        let writer = std::thread::spawn(move || {
                            run(RpcCall::SetBufPattern {
                                pattern: 0x11,
                                dst: buf,
                                offset: 0,
                                len: 4096,
                            })
                        });
                        run(RpcCall::Free { buf }).unwrap();
                        // Either the fill finished before the free or it sees
                        // an unknown handle; it never touches released memory
                        match writer.join().unwrap() {
                            Ok(out) => assert_eq!(out, RpcOutput::Unit),
                            Err(err) => assert_eq!(err.rpc_errno(), RpcErrno::InvalidArg),
                        }
                        served += 1;
                    }
                    served
                })
            })
            .collect();

        std::thread::sleep(std::time::Duration::from_millis(200));
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
    }

    #[test]
    fn test_fd_set_ops() {
        let set = handle_of(run(RpcCall::FdSetNew).unwrap());
        run(RpcCall::FdSet { fd: 5, set }).unwrap();
        assert_eq!(run(RpcCall::FdIsSet { fd: 5, set }).unwrap(), RpcOutput::Bool(true));
        run(RpcCall::FdClr { fd: 5, set }).unwrap();
        assert_eq!(run(RpcCall::FdIsSet { fd: 5, set }).unwrap(), RpcOutput::Bool(false));

        let err = run(RpcCall::FdSet { fd: -1, set }).unwrap_err();
        assert_eq!(err.rpc_errno(), RpcErrno::InvalidArg);

        // A signal-set call on a descriptor-set handle is a kind mismatch
        let err = run(RpcCall::SigEmptySet { set }).unwrap_err();
        assert_eq!(err.rpc_errno(), RpcErrno::InvalidArg);

        run(RpcCall::FdSetDelete { set }).unwrap();
    }

    #[test]
    fn test_sigset_ops() {
        let set = handle_of(run(RpcCall::SigSetNew).unwrap());
        run(RpcCall::SigAddSet {
            set,
            signum: libc::SIGUSR2,
        })
        .unwrap();
        assert_eq!(
            run(RpcCall::SigIsMember {
                set,
                signum: libc::SIGUSR2
            })
            .unwrap(),
            RpcOutput::Bool(true)
        );
        let err = run(RpcCall::SigAddSet { set, signum: 1000 }).unwrap_err();
        assert_eq!(err.rpc_errno(), RpcErrno::InvalidArg);
        run(RpcCall::SigSetDelete { set }).unwrap();
    }
}
