/*!
 * I/O Call Handler
 *
 * Descriptor primitives resolved per call. Buffers handed to the callee
 * are registered as checked arguments first, so a primitive that writes
 * past `len` is reported as corrupted.
 */

use crate::core::errors::{AgentError, Result};
use crate::core::types::Fd;
use crate::iomux::{Flavor, IoEvents, Iomux};
use crate::rpc::handler::{CallContext, RpcHandler};
use crate::rpc::types::{IoVec, PollFd, RpcCall, RpcOutput};
use libc::{c_int, pollfd};
use nix::errno::Errno;
use std::ffi::CString;
use std::ops::Range;
use tracing::debug;

fn check_len(rpc: &str, buf: &[u8], len: usize) -> Result<()> {
    if len > buf.len() {
        return Err(AgentError::invalid_arg(format!(
            "{}: length {} exceeds buffer of {} bytes",
            rpc,
            len,
            buf.len()
        )));
    }
    Ok(())
}

/// Handler for descriptor I/O calls
pub struct IoHandler;

impl IoHandler {
    fn read_into(&self, ctx: &mut CallContext<'_>, fd: Fd, buf: &[u8], len: usize, flags: Option<c_int>) -> Result<RpcOutput> {
        let rpc = if flags.is_some() { "recv" } else { "read" };
        check_len(rpc, buf, len)?;
        let prims = ctx.prims;
        let slot = ctx.install_output("buf", buf.to_vec(), len);
        let target = &mut ctx.buffer_mut(slot)[..len];
        let n = match flags {
            Some(flags) => prims.recv(fd, target, flags)?,
            None => prims.read(fd, target)?,
        };
        Ok(RpcOutput::Io {
            rc: n as i64,
            buf: Vec::new(),
        })
    }

    fn write_from(&self, ctx: &mut CallContext<'_>, fd: Fd, buf: &[u8], len: usize, flags: Option<c_int>) -> Result<RpcOutput> {
        let rpc = if flags.is_some() { "send" } else { "write" };
        check_len(rpc, buf, len)?;
        let prims = ctx.prims;
        let slot = ctx.install_input("buf", buf.to_vec(), len);
        let source = &ctx.buffer(slot)[..len];
        let n = match flags {
            Some(flags) => prims.send(fd, source, flags)?,
            None => prims.write(fd, source)?,
        };
        Ok(RpcOutput::Int(n as i64))
    }

    fn open(&self, ctx: &CallContext<'_>, path: &str, flags: i32, mode: u32) -> Result<RpcOutput> {
        let cpath = CString::new(path).map_err(|_| AgentError::invalid_arg("path contains NUL"))?;
        let fd = ctx.prims.open(&cpath, flags, mode as libc::mode_t)?;
        debug!(path, fd, "opened");
        Ok(RpcOutput::Fd(fd))
    }

    fn fcntl(&self, ctx: &CallContext<'_>, fd: Fd, cmd: i32, arg: i32) -> Result<RpcOutput> {
        let f = ctx.prims.fcntl_fn()?;
        // SAFETY: every supported fcntl command takes at most one int
        let rc = unsafe { f(fd, cmd, arg) };
        if rc < 0 {
            return Err(AgentError::os("fcntl", Errno::last()));
        }
        Ok(RpcOutput::Int(i64::from(rc)))
    }

    fn poll(&self, ctx: &CallContext<'_>, fds: &[PollFd], timeout_ms: i32) -> Result<RpcOutput> {
        let mut raw: Vec<pollfd> = fds
            .iter()
            .map(|p| pollfd {
                fd: p.fd,
                events: p.events.to_poll(),
                revents: 0,
            })
            .collect();
        ctx.prims.poll(&mut raw, timeout_ms)?;
        Ok(RpcOutput::Ready(
            raw.iter()
                .filter(|p| p.revents != 0)
                .map(|p| (p.fd, IoEvents::from_poll(p.revents)))
                .collect(),
        ))
    }

    /// Install every vector as a checked argument; returns their slots
    fn install_vectors(ctx: &mut CallContext<'_>, rpc: &str, iov: &[IoVec]) -> Result<Range<usize>> {
        for v in iov {
            check_len(rpc, &v.buf, v.len)?;
        }
        let first = ctx.checked_mut().len();
        for (i, v) in iov.iter().enumerate() {
            ctx.install_input(&format!("iov[{}]", i), v.buf.clone(), v.len);
        }
        Ok(first..first + iov.len())
    }

    fn readv(&self, ctx: &mut CallContext<'_>, fd: Fd, iov: &[IoVec]) -> Result<RpcOutput> {
        let slots = Self::install_vectors(ctx, "readv", iov)?;
        let prims = ctx.prims;
        let n = prims.readv(fd, &mut ctx.buffers_mut(slots.clone()))?;
        let bufs = slots.map(|slot| ctx.buffer(slot).to_vec()).collect();
        Ok(RpcOutput::Vectors { rc: n as i64, bufs })
    }

    fn writev(&self, ctx: &mut CallContext<'_>, fd: Fd, iov: &[IoVec]) -> Result<RpcOutput> {
        let slots = Self::install_vectors(ctx, "writev", iov)?;
        let n = ctx.prims.writev(fd, &ctx.buffers(slots))?;
        Ok(RpcOutput::Int(n as i64))
    }

    fn sendfile(&self, ctx: &CallContext<'_>, out_fd: Fd, in_fd: Fd, offset: Option<i64>, count: usize) -> Result<RpcOutput> {
        let mut off = offset.map(|o| o as libc::off_t);
        let n = ctx.prims.sendfile(out_fd, in_fd, off.as_mut(), count)?;
        debug!(out_fd, in_fd, sent = n, "sendfile");
        Ok(RpcOutput::Sendfile {
            rc: n as i64,
            offset: off.map(i64::from),
        })
    }

    fn socket_call(&self, ctx: &CallContext<'_>, call: &RpcCall) -> Result<RpcOutput> {
        let prims = ctx.prims;
        match call {
            RpcCall::Socket { domain, ty, protocol } => prims.socket(*domain, *ty, *protocol).map(RpcOutput::Fd),
            RpcCall::Bind { fd, addr } => {
                prims.bind(*fd, addr)?;
                debug!(fd, %addr, "bound");
                Ok(RpcOutput::Unit)
            }
            RpcCall::Connect { fd, addr } => prims.connect(*fd, addr).map(|_| RpcOutput::Unit),
            RpcCall::Listen { fd, backlog } => prims.listen(*fd, *backlog).map(|_| RpcOutput::Unit),
            RpcCall::Accept { fd } => {
                let (conn, peer) = prims.accept(*fd)?;
                debug!(listener = fd, fd = conn, %peer, "accepted");
                Ok(RpcOutput::Accepted { fd: conn, peer })
            }
            RpcCall::GetSockName { fd } => prims.getsockname(*fd).map(RpcOutput::Addr),
            RpcCall::GetPeerName { fd } => prims.getpeername(*fd).map(RpcOutput::Addr),
            RpcCall::Shutdown { fd, how } => prims.shutdown(*fd, *how).map(|_| RpcOutput::Unit),
            RpcCall::GetSockOpt { fd, level, optname } => prims
                .getsockopt(*fd, *level, *optname)
                .map(|v| RpcOutput::Int(i64::from(v))),
            RpcCall::SetSockOpt {
                fd,
                level,
                optname,
                value,
            } => prims.setsockopt(*fd, *level, *optname, *value).map(|_| RpcOutput::Unit),
            _ => Err(AgentError::invalid_arg("not a socket call")),
        }
    }

    fn iomux_wait(&self, ctx: &CallContext<'_>, flavor: Flavor, fds: &[PollFd], timeout_ms: i32) -> Result<RpcOutput> {
        let mut mux = Iomux::create(ctx.prims, flavor)?;
        for p in fds {
            mux.add(p.fd, p.events)?;
        }
        let (_, ret) = mux.wait(timeout_ms)?;
        let ready = mux.ready(&ret);
        mux.close()?;
        Ok(RpcOutput::Ready(ready))
    }
}

impl RpcHandler for IoHandler {
    fn handle(&self, ctx: &mut CallContext<'_>, call: &RpcCall) -> Option<Result<RpcOutput>> {
        let prims = ctx.prims;
        match call {
            RpcCall::Read { fd, buf, len } => Some(self.read_into(ctx, *fd, buf, *len, None)),
            RpcCall::Recv { fd, buf, len, flags } => Some(self.read_into(ctx, *fd, buf, *len, Some(*flags))),
            RpcCall::Write { fd, buf, len } => Some(self.write_from(ctx, *fd, buf, *len, None)),
            RpcCall::Send { fd, buf, len, flags } => Some(self.write_from(ctx, *fd, buf, *len, Some(*flags))),
            RpcCall::Open { path, flags, mode } => Some(self.open(ctx, path, *flags, *mode)),
            RpcCall::Close { fd } => Some(prims.close(*fd).map(|_| RpcOutput::Unit)),
            RpcCall::Pipe => Some(prims.pipe().map(|(r, w)| RpcOutput::FdPair(r, w))),
            RpcCall::SocketPair { domain, ty, protocol } => Some(
                prims
                    .socketpair(*domain, *ty, *protocol)
                    .map(|(a, b)| RpcOutput::FdPair(a, b)),
            ),
            RpcCall::Fcntl { fd, cmd, arg } => Some(self.fcntl(ctx, *fd, *cmd, *arg)),
            RpcCall::Poll { fds, timeout_ms } => Some(self.poll(ctx, fds, *timeout_ms)),
            RpcCall::IomuxWait { flavor, fds, timeout_ms } => Some(self.iomux_wait(ctx, *flavor, fds, *timeout_ms)),
            RpcCall::Readv { fd, iov } => Some(self.readv(ctx, *fd, iov)),
            RpcCall::Writev { fd, iov } => Some(self.writev(ctx, *fd, iov)),
            RpcCall::Sendfile {
                out_fd,
                in_fd,
                offset,
                count,
            } => Some(self.sendfile(ctx, *out_fd, *in_fd, *offset, *count)),
            RpcCall::Socket { .. }
            | RpcCall::Bind { .. }
            | RpcCall::Connect { .. }
            | RpcCall::Listen { .. }
            | RpcCall::Accept { .. }
            | RpcCall::GetSockName { .. }
            | RpcCall::GetPeerName { .. }
            | RpcCall::Shutdown { .. }
            | RpcCall::GetSockOpt { .. }
            | RpcCall::SetSockOpt { .. } => Some(self.socket_call(ctx, call)),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        "io_handler"
    }
}
