/*!
 * Asynchronous I/O Call Handler
 *
 * POSIX AIO control blocks owned by the agent and named by handles. A
 * control block points at a buffer handle; that buffer must outlive every
 * request submitted through the block, exactly as with native AIO.
 */

use crate::core::errors::{AgentError, Result, RpcErrno};
use crate::core::handles::{global, HandleRegistry};
use crate::core::types::{Address, HandleId, HandleKind};
use crate::rpc::handler::{CallContext, RpcHandler};
use crate::rpc::types::{AiocbParams, RpcCall, RpcOutput};
use crate::symbols::Primitives;
use libc::aiocb;
use std::time::Duration;
use tracing::{debug, warn};

/// Handler for AIO control-block calls
pub struct AioHandler {
    handles: &'static HandleRegistry,
}

impl AioHandler {
    pub fn new() -> Self {
        Self { handles: global() }
    }

    fn create(&self) -> Result<RpcOutput> {
        // SAFETY: an all-zero aiocb is an unfilled control block
        let mut cb: Box<aiocb> = Box::new(unsafe { std::mem::zeroed() });
        cb.aio_sigevent.sigev_notify = libc::SIGEV_NONE;
        let addr = Box::into_raw(cb) as Address;
        let id = self.handles.alloc(addr, HandleKind::AioControlBlock)?;
        Ok(RpcOutput::Handle(id))
    }

    /// Run `f` on a live control block while its handle is pinned
    fn with_cb<R>(&self, id: HandleId, f: impl FnOnce(*mut aiocb) -> Result<R>) -> Result<R> {
        self.handles.with_entry(id, HandleKind::AioControlBlock, |entry| match entry {
            Some(entry) => f(entry.addr as *mut aiocb),
            None => Err(AgentError::rpc(RpcErrno::Fault, "null control block")),
        })?
    }

    fn fill(&self, params: &AiocbParams) -> Result<RpcOutput> {
        let buf = self.handles.with_entry(params.buf, HandleKind::Buffer, |entry| match entry {
            Some(entry) if params.nbytes > entry.size => Err(AgentError::invalid_arg(format!(
                "{} bytes do not fit buffer {} of {} bytes",
                params.nbytes, params.buf, entry.size
            ))),
            Some(entry) => Ok(entry.addr),
            None if params.nbytes == 0 => Ok(0),
            None => Err(AgentError::rpc(RpcErrno::Fault, "null buffer with non-zero length")),
        })??;

        self.with_cb(params.cb, |cb| {
            // SAFETY: cb is pinned by the registry lock
            let cb = unsafe { &mut *cb };
            cb.aio_fildes = params.fd;
            cb.aio_lio_opcode = params.opcode;
            cb.aio_reqprio = params.reqprio;
            cb.aio_buf = buf as *mut libc::c_void;
            cb.aio_nbytes = params.nbytes;
            cb.aio_offset = params.offset as libc::off_t;
            Ok(())
        })?;
        debug!(cb = params.cb, fd = params.fd, nbytes = params.nbytes, "control block filled");
        Ok(RpcOutput::Unit)
    }

    /// Cancel a request still in flight, then release the block
    fn delete(&self, prims: &Primitives, id: HandleId) -> Result<RpcOutput> {
        if id == 0 {
            return Ok(RpcOutput::Unit);
        }
        self.with_cb(id, |cb| {
            if prims.aio_error(cb)? != libc::EINPROGRESS {
                return Ok(());
            }
            // SAFETY: cb is pinned by the registry lock
            let fd = unsafe { (*cb).aio_fildes };
            prims.aio_cancel(fd, cb)?;
            if prims.aio_error(cb)? == libc::EINPROGRESS {
                warn!(cb = id, fd, "request still in flight; control block kept");
                return Err(AgentError::rpc(RpcErrno::Busy, "request still in flight"));
            }
            Ok(())
        })?;

        if let Some(entry) = self.handles.free(id, HandleKind::AioControlBlock)? {
            // SAFETY: AioControlBlock handles are only ever created by create()
            drop(unsafe { Box::from_raw(entry.addr as *mut aiocb) });
        }
        Ok(RpcOutput::Unit)
    }

    fn suspend(&self, prims: &Primitives, ids: &[HandleId], timeout_ms: Option<u32>) -> Result<RpcOutput> {
        let keys: Vec<_> = ids.iter().map(|&id| (id, HandleKind::AioControlBlock)).collect();
        // Null entries are skipped by aio_suspend
        let cbs: Vec<*const aiocb> = self.handles.with_entries(&keys, |entries| {
            entries
                .iter()
                .map(|entry| entry.map_or(std::ptr::null(), |e| e.addr as *const aiocb))
                .collect()
        })?;
        let timeout = timeout_ms.map(|ms| {
            let d = Duration::from_millis(u64::from(ms));
            libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            }
        });
        // The wait runs unlocked; a block that is deleted meanwhile has no
        // request in flight, which ends the wait
        prims.aio_suspend(&cbs, timeout.as_ref())?;
        Ok(RpcOutput::Unit)
    }

    fn request(&self, prims: &Primitives, call: &RpcCall) -> Result<RpcOutput> {
        match *call {
            RpcCall::AioRead { cb } => self.with_cb(cb, |cb| prims.aio_read(cb)).map(|_| RpcOutput::Unit),
            RpcCall::AioWrite { cb } => self.with_cb(cb, |cb| prims.aio_write(cb)).map(|_| RpcOutput::Unit),
            RpcCall::AioError { cb } => self
                .with_cb(cb, |cb| prims.aio_error(cb))
                .map(|errno| RpcOutput::Status(RpcErrno::from_errno(errno))),
            RpcCall::AioReturn { cb } => self
                .with_cb(cb, |cb| prims.aio_return(cb))
                .map(|n| RpcOutput::Int(n as i64)),
            RpcCall::AioCancel { fd, cb } => {
                let rc = if cb == 0 {
                    prims.aio_cancel(fd, std::ptr::null_mut())?
                } else {
                    self.with_cb(cb, |cb| prims.aio_cancel(fd, cb))?
                };
                Ok(RpcOutput::Int(i64::from(rc)))
            }
            RpcCall::AioFsync { op, cb } => self.with_cb(cb, |cb| prims.aio_fsync(op, cb)).map(|_| RpcOutput::Unit),
            _ => Err(AgentError::invalid_arg("not an AIO request")),
        }
    }
}

impl Default for AioHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcHandler for AioHandler {
    fn handle(&self, ctx: &mut CallContext<'_>, call: &RpcCall) -> Option<Result<RpcOutput>> {
        let prims = ctx.prims;
        match call {
            RpcCall::AiocbNew => Some(self.create()),
            RpcCall::AiocbFill(params) => Some(self.fill(params)),
            RpcCall::AiocbDelete { cb } => Some(self.delete(prims, *cb)),
            RpcCall::AioSuspend { cbs, timeout_ms } => Some(self.suspend(prims, cbs, *timeout_ms)),
            RpcCall::AioRead { .. }
            | RpcCall::AioWrite { .. }
            | RpcCall::AioError { .. }
            | RpcCall::AioReturn { .. }
            | RpcCall::AioCancel { .. }
            | RpcCall::AioFsync { .. } => Some(self.request(prims, call)),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        "aio_handler"
    }
}
