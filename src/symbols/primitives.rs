/*!
 * Typed Primitives
 *
 * Function pointers for the I/O and readiness primitives, resolved lazily
 * through the resolver so that every call honors the per-call use_libc
 * selection. One table lives for the duration of one RPC.
 */

use super::resolver::{resolver, Resolver};
use crate::core::errors::{AgentError, Result};
use crate::core::sockaddr::SockAddr;
use crate::core::types::{Address, Fd};
use libc::{
    aiocb, c_char, c_int, c_void, epoll_event, fd_set, iovec, nfds_t, off_t, pollfd, sigset_t, size_t, sockaddr,
    socklen_t, ssize_t, timespec, timeval,
};
use nix::errno::Errno;
use nix::sys::socket::{SockaddrLike, SockaddrStorage};
use std::cell::OnceCell;
use std::ffi::CStr;

type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
type SendFn = unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
type SelectFn = unsafe extern "C" fn(c_int, *mut fd_set, *mut fd_set, *mut fd_set, *mut timeval) -> c_int;
type PselectFn =
    unsafe extern "C" fn(c_int, *mut fd_set, *mut fd_set, *mut fd_set, *const timespec, *const sigset_t) -> c_int;
type PollFn = unsafe extern "C" fn(*mut pollfd, nfds_t, c_int) -> c_int;
type PpollFn = unsafe extern "C" fn(*mut pollfd, nfds_t, *const timespec, *const sigset_t) -> c_int;
type EpollCreateFn = unsafe extern "C" fn(c_int) -> c_int;
type EpollCtlFn = unsafe extern "C" fn(c_int, c_int, c_int, *mut epoll_event) -> c_int;
type EpollWaitFn = unsafe extern "C" fn(c_int, *mut epoll_event, c_int, c_int) -> c_int;
type EpollPwaitFn = unsafe extern "C" fn(c_int, *mut epoll_event, c_int, c_int, *const sigset_t) -> c_int;
/// fcntl is variadic in C
pub type FcntlFn = unsafe extern "C" fn(c_int, c_int, ...) -> c_int;
type OpenFn = unsafe extern "C" fn(*const c_char, c_int, ...) -> c_int;
type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
type PipeFn = unsafe extern "C" fn(*mut c_int) -> c_int;
type SocketpairFn = unsafe extern "C" fn(c_int, c_int, c_int, *mut c_int) -> c_int;
type SocketFn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
type AddrInFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
type AddrOutFn = unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int;
type FdIntFn = unsafe extern "C" fn(c_int, c_int) -> c_int;
type GetsockoptFn = unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int;
type SetsockoptFn = unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int;
type IovFn = unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
type SendfileFn = unsafe extern "C" fn(c_int, c_int, *mut off_t, size_t) -> ssize_t;
type AioFn = unsafe extern "C" fn(*mut aiocb) -> c_int;
type AioReturnFn = unsafe extern "C" fn(*mut aiocb) -> ssize_t;
type AioCancelFn = unsafe extern "C" fn(c_int, *mut aiocb) -> c_int;
type AioFsyncFn = unsafe extern "C" fn(c_int, *mut aiocb) -> c_int;
type AioSuspendFn = unsafe extern "C" fn(*const *const aiocb, c_int, *const timespec) -> c_int;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
enum Prim {
    Read,
    Write,
    Send,
    Recv,
    Select,
    Pselect,
    Poll,
    Ppoll,
    EpollCreate,
    EpollCtl,
    EpollWait,
    EpollPwait,
    Fcntl,
    Open,
    Close,
    Pipe,
    Socketpair,
    Socket,
    Bind,
    Connect,
    Listen,
    Accept,
    Getsockname,
    Getpeername,
    Shutdown,
    Getsockopt,
    Setsockopt,
    Readv,
    Writev,
    Sendfile,
    AioRead,
    AioWrite,
    AioError,
    AioReturn,
    AioCancel,
    AioFsync,
    AioSuspend,
}

impl Prim {
    const COUNT: usize = Prim::AioSuspend as usize + 1;

    const fn symbol(self) -> &'static str {
        match self {
            Prim::Read => "read",
            Prim::Write => "write",
            Prim::Send => "send",
            Prim::Recv => "recv",
            Prim::Select => "select",
            Prim::Pselect => "pselect",
            Prim::Poll => "poll",
            Prim::Ppoll => "ppoll",
            Prim::EpollCreate => "epoll_create",
            Prim::EpollCtl => "epoll_ctl",
            Prim::EpollWait => "epoll_wait",
            Prim::EpollPwait => "epoll_pwait",
            Prim::Fcntl => "fcntl",
            Prim::Open => "open",
            Prim::Close => "close",
            Prim::Pipe => "pipe",
            Prim::Socketpair => "socketpair",
            Prim::Socket => "socket",
            Prim::Bind => "bind",
            Prim::Connect => "connect",
            Prim::Listen => "listen",
            Prim::Accept => "accept",
            Prim::Getsockname => "getsockname",
            Prim::Getpeername => "getpeername",
            Prim::Shutdown => "shutdown",
            Prim::Getsockopt => "getsockopt",
            Prim::Setsockopt => "setsockopt",
            Prim::Readv => "readv",
            Prim::Writev => "writev",
            Prim::Sendfile => "sendfile",
            Prim::AioRead => "aio_read",
            Prim::AioWrite => "aio_write",
            Prim::AioError => "aio_error",
            Prim::AioReturn => "aio_return",
            Prim::AioCancel => "aio_cancel",
            Prim::AioFsync => "aio_fsync",
            Prim::AioSuspend => "aio_suspend",
        }
    }
}

/// Map a C return convention (`-1` plus errno) onto a Result
#[inline]
fn check<T: Copy + PartialOrd + Default>(call: &'static str, ret: T) -> Result<T> {
    if ret < T::default() {
        Err(AgentError::os(call, Errno::last()))
    } else {
        Ok(ret)
    }
}

/// Lazily resolved primitive table for one call
pub struct Primitives {
    resolver: &'static Resolver,
    use_libc: bool,
    cache: [OnceCell<Address>; Prim::COUNT],
}

macro_rules! resolved {
    ($self:ident, $prim:expr, $ty:ty) => {{
        let addr = $self.addr($prim)?;
        // SAFETY: the address was exported under the POSIX name whose
        // signature $ty spells out
        unsafe { std::mem::transmute::<Address, $ty>(addr) }
    }};
}

impl Primitives {
    pub fn new(use_libc: bool) -> Self {
        Self::with_resolver(resolver(), use_libc)
    }

    pub fn with_resolver(resolver: &'static Resolver, use_libc: bool) -> Self {
        Self {
            resolver,
            use_libc,
            cache: std::array::from_fn(|_| OnceCell::new()),
        }
    }

    #[inline]
    pub fn use_libc(&self) -> bool {
        self.use_libc
    }

    #[inline]
    pub fn resolver(&self) -> &'static Resolver {
        self.resolver
    }

    fn addr(&self, prim: Prim) -> Result<Address> {
        let cell = &self.cache[prim as usize];
        if let Some(addr) = cell.get() {
            return Ok(*addr);
        }
        let addr = self.resolver.resolve(self.use_libc, prim.symbol())?;
        let _ = cell.set(addr);
        Ok(addr)
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let f = resolved!(self, Prim::Read, ReadFn);
        check("read", unsafe { f(fd, buf.as_mut_ptr().cast(), buf.len()) }).map(|n| n as usize)
    }

    pub fn write(&self, fd: Fd, buf: &[u8]) -> Result<usize> {
        let f = resolved!(self, Prim::Write, WriteFn);
        check("write", unsafe { f(fd, buf.as_ptr().cast(), buf.len()) }).map(|n| n as usize)
    }

    pub fn send(&self, fd: Fd, buf: &[u8], flags: c_int) -> Result<usize> {
        let f = resolved!(self, Prim::Send, SendFn);
        check("send", unsafe { f(fd, buf.as_ptr().cast(), buf.len(), flags) }).map(|n| n as usize)
    }

    pub fn recv(&self, fd: Fd, buf: &mut [u8], flags: c_int) -> Result<usize> {
        let f = resolved!(self, Prim::Recv, RecvFn);
        check("recv", unsafe { f(fd, buf.as_mut_ptr().cast(), buf.len(), flags) }).map(|n| n as usize)
    }

    pub fn select(
        &self,
        nfds: c_int,
        read: &mut fd_set,
        write: &mut fd_set,
        except: &mut fd_set,
        timeout: Option<&mut timeval>,
    ) -> Result<c_int> {
        let f = resolved!(self, Prim::Select, SelectFn);
        let tv = timeout.map_or(std::ptr::null_mut(), |t| t as *mut timeval);
        check("select", unsafe { f(nfds, read, write, except, tv) })
    }

    pub fn pselect(
        &self,
        nfds: c_int,
        read: &mut fd_set,
        write: &mut fd_set,
        except: &mut fd_set,
        timeout: Option<&timespec>,
        sigmask: Option<&sigset_t>,
    ) -> Result<c_int> {
        let f = resolved!(self, Prim::Pselect, PselectFn);
        let ts = timeout.map_or(std::ptr::null(), |t| t as *const timespec);
        let mask = sigmask.map_or(std::ptr::null(), |m| m as *const sigset_t);
        check("pselect", unsafe { f(nfds, read, write, except, ts, mask) })
    }

    pub fn poll(&self, fds: &mut [pollfd], timeout_ms: c_int) -> Result<c_int> {
        let f = resolved!(self, Prim::Poll, PollFn);
        check("poll", unsafe { f(fds.as_mut_ptr(), fds.len() as nfds_t, timeout_ms) })
    }

    pub fn ppoll(&self, fds: &mut [pollfd], timeout: Option<&timespec>, sigmask: Option<&sigset_t>) -> Result<c_int> {
        let f = resolved!(self, Prim::Ppoll, PpollFn);
        let ts = timeout.map_or(std::ptr::null(), |t| t as *const timespec);
        let mask = sigmask.map_or(std::ptr::null(), |m| m as *const sigset_t);
        check("ppoll", unsafe { f(fds.as_mut_ptr(), fds.len() as nfds_t, ts, mask) })
    }

    pub fn epoll_create(&self, size_hint: c_int) -> Result<Fd> {
        let f = resolved!(self, Prim::EpollCreate, EpollCreateFn);
        check("epoll_create", unsafe { f(size_hint) })
    }

    pub fn epoll_ctl(&self, epfd: Fd, op: c_int, fd: Fd, event: &mut epoll_event) -> Result<()> {
        let f = resolved!(self, Prim::EpollCtl, EpollCtlFn);
        check("epoll_ctl", unsafe { f(epfd, op, fd, event) }).map(|_| ())
    }

    pub fn epoll_wait(&self, epfd: Fd, events: &mut [epoll_event], timeout_ms: c_int) -> Result<c_int> {
        let f = resolved!(self, Prim::EpollWait, EpollWaitFn);
        check("epoll_wait", unsafe { f(epfd, events.as_mut_ptr(), events.len() as c_int, timeout_ms) })
    }

    pub fn epoll_pwait(
        &self,
        epfd: Fd,
        events: &mut [epoll_event],
        timeout_ms: c_int,
        sigmask: Option<&sigset_t>,
    ) -> Result<c_int> {
        let f = resolved!(self, Prim::EpollPwait, EpollPwaitFn);
        let mask = sigmask.map_or(std::ptr::null(), |m| m as *const sigset_t);
        check("epoll_pwait", unsafe {
            f(epfd, events.as_mut_ptr(), events.len() as c_int, timeout_ms, mask)
        })
    }

    pub fn fcntl_getfl(&self, fd: Fd) -> Result<c_int> {
        let f = self.fcntl_fn()?;
        check("fcntl", unsafe { f(fd, libc::F_GETFL) })
    }

    pub fn fcntl_setfl(&self, fd: Fd, flags: c_int) -> Result<()> {
        let f = self.fcntl_fn()?;
        check("fcntl", unsafe { f(fd, libc::F_SETFL, flags) }).map(|_| ())
    }

    /// Raw fcntl pointer, for callers that outlive this table
    pub fn fcntl_fn(&self) -> Result<FcntlFn> {
        Ok(resolved!(self, Prim::Fcntl, FcntlFn))
    }

    pub fn open(&self, path: &CStr, flags: c_int, mode: libc::mode_t) -> Result<Fd> {
        let f = resolved!(self, Prim::Open, OpenFn);
        check("open", unsafe { f(path.as_ptr(), flags, mode as c_int) })
    }

    pub fn close(&self, fd: Fd) -> Result<()> {
        let f = resolved!(self, Prim::Close, CloseFn);
        check("close", unsafe { f(fd) }).map(|_| ())
    }

    pub fn pipe(&self) -> Result<(Fd, Fd)> {
        let f = resolved!(self, Prim::Pipe, PipeFn);
        let mut fds = [-1 as c_int; 2];
        check("pipe", unsafe { f(fds.as_mut_ptr()) })?;
        Ok((fds[0], fds[1]))
    }

    pub fn socketpair(&self, domain: c_int, ty: c_int, protocol: c_int) -> Result<(Fd, Fd)> {
        let f = resolved!(self, Prim::Socketpair, SocketpairFn);
        let mut fds = [-1 as c_int; 2];
        check("socketpair", unsafe { f(domain, ty, protocol, fds.as_mut_ptr()) })?;
        Ok((fds[0], fds[1]))
    }

    // ------------------------------------------------------------------
    // Sockets
    // ------------------------------------------------------------------

    pub fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> Result<Fd> {
        let f = resolved!(self, Prim::Socket, SocketFn);
        check("socket", unsafe { f(domain, ty, protocol) })
    }

    pub fn bind(&self, fd: Fd, addr: &SockAddr) -> Result<()> {
        let f = resolved!(self, Prim::Bind, AddrInFn);
        let storage = addr.to_storage()?;
        check("bind", unsafe { f(fd, storage.as_ptr(), storage.len()) }).map(|_| ())
    }

    pub fn connect(&self, fd: Fd, addr: &SockAddr) -> Result<()> {
        let f = resolved!(self, Prim::Connect, AddrInFn);
        let storage = addr.to_storage()?;
        check("connect", unsafe { f(fd, storage.as_ptr(), storage.len()) }).map(|_| ())
    }

    pub fn listen(&self, fd: Fd, backlog: c_int) -> Result<()> {
        let f = resolved!(self, Prim::Listen, FdIntFn);
        check("listen", unsafe { f(fd, backlog) }).map(|_| ())
    }

    /// Accepted descriptor and the peer address
    pub fn accept(&self, fd: Fd) -> Result<(Fd, SockAddr)> {
        let f = resolved!(self, Prim::Accept, AddrOutFn);
        let mut peer = SockAddr::Unspec;
        let conn = Self::address_out("accept", |addr, len| unsafe { f(fd, addr, len) }, &mut peer)?;
        Ok((conn, peer))
    }

    pub fn getsockname(&self, fd: Fd) -> Result<SockAddr> {
        let f = resolved!(self, Prim::Getsockname, AddrOutFn);
        let mut local = SockAddr::Unspec;
        Self::address_out("getsockname", |addr, len| unsafe { f(fd, addr, len) }, &mut local)?;
        Ok(local)
    }

    pub fn getpeername(&self, fd: Fd) -> Result<SockAddr> {
        let f = resolved!(self, Prim::Getpeername, AddrOutFn);
        let mut peer = SockAddr::Unspec;
        Self::address_out("getpeername", |addr, len| unsafe { f(fd, addr, len) }, &mut peer)?;
        Ok(peer)
    }

    /// Call a primitive that reports an address through `(sockaddr *, socklen_t *)`
    fn address_out(
        call: &'static str,
        f: impl FnOnce(*mut sockaddr, *mut socklen_t) -> c_int,
        out: &mut SockAddr,
    ) -> Result<c_int> {
        // SAFETY: an all-zero sockaddr_storage is a valid AF_UNSPEC address
        let mut raw: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let ret = check(call, f((&mut raw as *mut libc::sockaddr_storage).cast(), &mut len))?;
        // SAFETY: the primitive initialized len bytes of raw
        let storage = unsafe { SockaddrStorage::from_raw((&raw as *const libc::sockaddr_storage).cast(), Some(len)) };
        *out = storage.map_or(SockAddr::Unspec, |s| SockAddr::from_storage(&s));
        Ok(ret)
    }

    pub fn shutdown(&self, fd: Fd, how: c_int) -> Result<()> {
        let f = resolved!(self, Prim::Shutdown, FdIntFn);
        check("shutdown", unsafe { f(fd, how) }).map(|_| ())
    }

    /// Integer-valued socket option
    pub fn getsockopt(&self, fd: Fd, level: c_int, name: c_int) -> Result<c_int> {
        let f = resolved!(self, Prim::Getsockopt, GetsockoptFn);
        let mut value: c_int = 0;
        let mut len = std::mem::size_of::<c_int>() as socklen_t;
        check("getsockopt", unsafe { f(fd, level, name, (&mut value as *mut c_int).cast(), &mut len) })?;
        Ok(value)
    }

    pub fn setsockopt(&self, fd: Fd, level: c_int, name: c_int, value: c_int) -> Result<()> {
        let f = resolved!(self, Prim::Setsockopt, SetsockoptFn);
        let len = std::mem::size_of::<c_int>() as socklen_t;
        check("setsockopt", unsafe { f(fd, level, name, (&value as *const c_int).cast(), len) }).map(|_| ())
    }

    // ------------------------------------------------------------------
    // Vectored and zero-copy I/O
    // ------------------------------------------------------------------

    pub fn readv(&self, fd: Fd, bufs: &mut [&mut [u8]]) -> Result<usize> {
        let f = resolved!(self, Prim::Readv, IovFn);
        let iov: Vec<iovec> = bufs
            .iter_mut()
            .map(|b| iovec {
                iov_base: b.as_mut_ptr().cast(),
                iov_len: b.len(),
            })
            .collect();
        check("readv", unsafe { f(fd, iov.as_ptr(), iov.len() as c_int) }).map(|n| n as usize)
    }

    pub fn writev(&self, fd: Fd, bufs: &[&[u8]]) -> Result<usize> {
        let f = resolved!(self, Prim::Writev, IovFn);
        let iov: Vec<iovec> = bufs
            .iter()
            .map(|b| iovec {
                iov_base: b.as_ptr() as *mut c_void,
                iov_len: b.len(),
            })
            .collect();
        check("writev", unsafe { f(fd, iov.as_ptr(), iov.len() as c_int) }).map(|n| n as usize)
    }

    /// With an offset, the file position is left alone and the offset advanced
    pub fn sendfile(&self, out_fd: Fd, in_fd: Fd, offset: Option<&mut off_t>, count: usize) -> Result<usize> {
        let f = resolved!(self, Prim::Sendfile, SendfileFn);
        let off = offset.map_or(std::ptr::null_mut(), |o| o as *mut off_t);
        check("sendfile", unsafe { f(out_fd, in_fd, off, count) }).map(|n| n as usize)
    }

    // ------------------------------------------------------------------
    // Asynchronous I/O
    //
    // The control block and the buffer it names must outlive the request.
    // ------------------------------------------------------------------

    pub fn aio_read(&self, cb: *mut aiocb) -> Result<()> {
        let f = resolved!(self, Prim::AioRead, AioFn);
        check("aio_read", unsafe { f(cb) }).map(|_| ())
    }

    pub fn aio_write(&self, cb: *mut aiocb) -> Result<()> {
        let f = resolved!(self, Prim::AioWrite, AioFn);
        check("aio_write", unsafe { f(cb) }).map(|_| ())
    }

    /// Request status: 0 when done, an errno value otherwise
    pub fn aio_error(&self, cb: *mut aiocb) -> Result<c_int> {
        let f = resolved!(self, Prim::AioError, AioFn);
        check("aio_error", unsafe { f(cb) })
    }

    pub fn aio_return(&self, cb: *mut aiocb) -> Result<usize> {
        let f = resolved!(self, Prim::AioReturn, AioReturnFn);
        check("aio_return", unsafe { f(cb) }).map(|n| n as usize)
    }

    pub fn aio_cancel(&self, fd: Fd, cb: *mut aiocb) -> Result<c_int> {
        let f = resolved!(self, Prim::AioCancel, AioCancelFn);
        check("aio_cancel", unsafe { f(fd, cb) })
    }

    pub fn aio_fsync(&self, op: c_int, cb: *mut aiocb) -> Result<()> {
        let f = resolved!(self, Prim::AioFsync, AioFsyncFn);
        check("aio_fsync", unsafe { f(op, cb) }).map(|_| ())
    }

    pub fn aio_suspend(&self, cbs: &[*const aiocb], timeout: Option<&timespec>) -> Result<()> {
        let f = resolved!(self, Prim::AioSuspend, AioSuspendFn);
        let ts = timeout.map_or(std::ptr::null(), |t| t as *const timespec);
        check("aio_suspend", unsafe { f(cbs.as_ptr(), cbs.len() as c_int, ts) }).map(|_| ())
    }
}

/// Restore-flags callback built from a resolved fcntl
pub fn flag_setter(fcntl: FcntlFn) -> impl FnMut(Fd, c_int) -> std::result::Result<(), Errno> + Send + 'static {
    move |fd, flags| {
        // SAFETY: F_SETFL takes one int argument
        if unsafe { fcntl(fd, libc::F_SETFL, flags) } < 0 {
            Err(Errno::last())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{RpcErrno, ToRpcErrno};
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_pipe_write_read() {
        let prims = Primitives::new(true);
        let (rd, wr) = prims.pipe().unwrap();

        assert_eq!(prims.write(wr, b"hello").unwrap(), 5);
        let mut buf = [0u8; 16];
        assert_eq!(prims.read(rd, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");

        prims.close(rd).unwrap();
        prims.close(wr).unwrap();
    }

    #[test]
    #[serial]
    fn test_errno_is_captured() {
        let prims = Primitives::new(true);
        let err = prims.close(-1).unwrap_err();
        assert_eq!(err.rpc_errno(), RpcErrno::BadFd);
    }

    #[test]
    #[serial]
    fn test_flags_round_trip() {
        let prims = Primitives::new(true);
        let (rd, wr) = prims.pipe().unwrap();

        let original = prims.fcntl_getfl(rd).unwrap();
        prims.fcntl_setfl(rd, original | libc::O_NONBLOCK).unwrap();
        assert_ne!(prims.fcntl_getfl(rd).unwrap() & libc::O_NONBLOCK, 0);

        let mut restore = flag_setter(prims.fcntl_fn().unwrap());
        restore(rd, original).unwrap();
        assert_eq!(prims.fcntl_getfl(rd).unwrap() & libc::O_NONBLOCK, 0);

        let mut buf = [0u8; 1];
        prims.fcntl_setfl(rd, original | libc::O_NONBLOCK).unwrap();
        assert_eq!(prims.read(rd, &mut buf).unwrap_err().rpc_errno(), RpcErrno::WouldBlock);

        prims.close(rd).unwrap();
        prims.close(wr).unwrap();
    }

    #[test]
    #[serial]
    fn test_tcp_loopback_accept() {
        let prims = Primitives::new(true);
        let listener = prims.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        prims
            .setsockopt(listener, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
            .unwrap();
        assert_eq!(prims.getsockopt(listener, libc::SOL_SOCKET, libc::SO_REUSEADDR).unwrap(), 1);

        prims
            .bind(listener, &SockAddr::Inet("127.0.0.1:0".parse().unwrap()))
            .unwrap();
        prims.listen(listener, 4).unwrap();
        let local = prims.getsockname(listener).unwrap();
        let port = match local {
            SockAddr::Inet(addr) => addr.port(),
            other => panic!("unexpected address {:?}", other),
        };
        assert_ne!(port, 0);

        let client = prims.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        prims.connect(client, &local).unwrap();
        let (conn, peer) = prims.accept(listener).unwrap();
        assert_eq!(prims.getsockname(client).unwrap(), peer);
        assert_eq!(prims.getpeername(conn).unwrap(), prims.getsockname(client).unwrap());

        assert_eq!(prims.writev(client, &[b"ab", b"cde"]).unwrap(), 5);
        let (mut head, mut tail) = ([0u8; 3], [0u8; 8]);
        let n = prims.readv(conn, &mut [&mut head, &mut tail]).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&head, b"abc");
        assert_eq!(&tail[..2], b"de");

        prims.shutdown(client, libc::SHUT_WR).unwrap();
        assert_eq!(prims.read(conn, &mut tail).unwrap(), 0);

        for fd in [conn, client, listener] {
            prims.close(fd).unwrap();
        }
    }

    #[test]
    #[serial]
    fn test_sendfile_advances_offset() {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();
        let prims = Primitives::new(true);
        let (rd, wr) = prims.pipe().unwrap();

        let mut offset: off_t = 4;
        assert_eq!(prims.sendfile(wr, file.as_raw_fd(), Some(&mut offset), 3).unwrap(), 3);
        assert_eq!(offset, 7);
        let mut buf = [0u8; 8];
        assert_eq!(prims.read(rd, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"456");

        prims.close(rd).unwrap();
        prims.close(wr).unwrap();
    }
}
