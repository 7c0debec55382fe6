/*!
 * RPC Types
 * Request and reply records carried over the wire
 */

use crate::composites::{EchoerParams, FlooderParams, OverfillParams, SimpleSenderParams, TrafficStats};
use crate::core::errors::RpcErrno;
use crate::core::sockaddr::SockAddr;
use crate::core::types::{Address, Fd, HandleId, JobId, Pid, TimestampMs, WaitStatus};
use crate::iomux::{Flavor, IoEvents};
use serde::{Deserialize, Serialize};

/// What the request asks of the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOp {
    #[default]
    Call,
    /// Report whether the job in `done` has finished
    IsDone,
    /// Detach the job in `done`; its result is discarded
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    #[default]
    Sync,
    /// Start the call on a worker and reply with its job id at once
    FireAndForget,
    /// Collect the result of the job in `done`
    Poll,
}

/// Common input header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallHeader {
    pub op: CallOp,
    pub mode: CallMode,
    /// Resolve through the agent's own image, bypassing the library under test
    pub use_libc: bool,
    pub done: JobId,
    /// Wall-clock start time in ms since the epoch; 0 starts at once
    pub start_ms: TimestampMs,
}

impl CallHeader {
    pub fn sync(use_libc: bool) -> Self {
        Self {
            use_libc,
            ..Self::default()
        }
    }
}

/// Common output header
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplyHeader {
    pub errno: RpcErrno,
    pub errno_changed: bool,
    pub duration_us: u64,
    pub done: JobId,
    /// Human-readable failure description when `errno` is not ok
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollFd {
    pub fd: Fd,
    pub events: IoEvents,
}

/// One element of a vectored call: a caller buffer and the part the callee
/// may touch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoVec {
    pub buf: Vec<u8>,
    pub len: usize,
}

/// Contents of an asynchronous I/O control block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiocbParams {
    pub cb: HandleId,
    pub fd: Fd,
    /// LIO_READ, LIO_WRITE or LIO_NOP
    pub opcode: i32,
    pub reqprio: i32,
    /// Buffer handle the request transfers into or out of
    pub buf: HandleId,
    pub nbytes: usize,
    pub offset: i64,
}

/// Every call the agent understands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcCall {
    // Resolver and meta
    SetLibName { name: Option<String> },
    FindFunc { name: String },
    GetSizeof { type_name: String },
    GetPid,
    SigReceived,
    Signal { signum: i32, handler: String },
    CreateProcess { name: String, exec: bool },
    ThreadCreate { name: String },
    ThreadJoin { name: String },

    // Process
    Waitpid { pid: Pid, options: i32 },
    KillDeath { pid: Pid },
    Kill { pid: Pid, signum: i32 },
    System { cmd: String },
    Popen { cmd: String },

    // Descriptor and signal sets
    FdSetNew,
    FdSetDelete { set: HandleId },
    FdZero { set: HandleId },
    FdSet { fd: Fd, set: HandleId },
    FdClr { fd: Fd, set: HandleId },
    FdIsSet { fd: Fd, set: HandleId },
    SigSetNew,
    SigSetDelete { set: HandleId },
    SigEmptySet { set: HandleId },
    SigFillSet { set: HandleId },
    SigAddSet { set: HandleId, signum: i32 },
    SigDelSet { set: HandleId, signum: i32 },
    SigIsMember { set: HandleId, signum: i32 },

    // Memory and buffers
    Malloc { size: usize },
    Memalign { alignment: usize, size: usize },
    Free { buf: HandleId },
    SetBuf { src: Vec<u8>, dst: HandleId, offset: usize },
    GetBuf { src: HandleId, offset: usize, len: usize },
    SetBufPattern { pattern: u32, dst: HandleId, offset: usize, len: usize },
    Memcmp { buf1: HandleId, off1: usize, buf2: HandleId, off2: usize, n: usize },

    // Dynamic libraries
    Dlopen { name: Option<String>, flags: i32 },
    Dlsym { handle: HandleId, symbol: String },
    DlsymCall { handle: HandleId, symbol: String },
    Dlerror,
    Dlclose { handle: HandleId },

    // I/O primitives; `buf` is the caller's buffer, `len` the part the
    // callee may touch
    Read { fd: Fd, buf: Vec<u8>, len: usize },
    Write { fd: Fd, buf: Vec<u8>, len: usize },
    Send { fd: Fd, buf: Vec<u8>, len: usize, flags: i32 },
    Recv { fd: Fd, buf: Vec<u8>, len: usize, flags: i32 },
    Open { path: String, flags: i32, mode: u32 },
    Close { fd: Fd },
    Pipe,
    SocketPair { domain: i32, ty: i32, protocol: i32 },
    Fcntl { fd: Fd, cmd: i32, arg: i32 },
    Poll { fds: Vec<PollFd>, timeout_ms: i32 },
    IomuxWait { flavor: Flavor, fds: Vec<PollFd>, timeout_ms: i32 },
    Readv { fd: Fd, iov: Vec<IoVec> },
    Writev { fd: Fd, iov: Vec<IoVec> },
    Sendfile { out_fd: Fd, in_fd: Fd, offset: Option<i64>, count: usize },

    // Sockets; options are int-valued
    Socket { domain: i32, ty: i32, protocol: i32 },
    Bind { fd: Fd, addr: SockAddr },
    Connect { fd: Fd, addr: SockAddr },
    Listen { fd: Fd, backlog: i32 },
    Accept { fd: Fd },
    GetSockName { fd: Fd },
    GetPeerName { fd: Fd },
    Shutdown { fd: Fd, how: i32 },
    GetSockOpt { fd: Fd, level: i32, optname: i32 },
    SetSockOpt { fd: Fd, level: i32, optname: i32, value: i32 },

    // Asynchronous I/O
    AiocbNew,
    AiocbFill(AiocbParams),
    AiocbDelete { cb: HandleId },
    AioRead { cb: HandleId },
    AioWrite { cb: HandleId },
    AioError { cb: HandleId },
    AioReturn { cb: HandleId },
    AioCancel { fd: Fd, cb: HandleId },
    AioFsync { op: i32, cb: HandleId },
    AioSuspend { cbs: Vec<HandleId>, timeout_ms: Option<u32> },

    // Composites
    Flooder(FlooderParams),
    Echoer(EchoerParams),
    OverfillBuffers(OverfillParams),
    OverfillFd { write_end: Fd },
    SocketToFile { sock: Fd, path: String, timeout_s: u32 },
    RecvVerify { sock: Fd, pattern: Option<Vec<u8>> },
    SimpleSender(SimpleSenderParams),
    SimpleReceiver { sock: Fd, time2run_s: u32 },
    WaitReadable { sock: Fd, timeout_ms: u32 },
}

impl RpcCall {
    /// Wire name used in logs and spans
    pub fn name(&self) -> &'static str {
        match self {
            RpcCall::SetLibName { .. } => "setlibname",
            RpcCall::FindFunc { .. } => "rpc_find_func",
            RpcCall::GetSizeof { .. } => "get_sizeof",
            RpcCall::GetPid => "getpid",
            RpcCall::SigReceived => "sigreceived",
            RpcCall::Signal { .. } => "signal",
            RpcCall::CreateProcess { .. } => "create_process",
            RpcCall::ThreadCreate { .. } => "thread_create",
            RpcCall::ThreadJoin { .. } => "thread_join",
            RpcCall::Waitpid { .. } => "waitpid",
            RpcCall::KillDeath { .. } => "ta_kill_death",
            RpcCall::Kill { .. } => "kill",
            RpcCall::System { .. } => "system",
            RpcCall::Popen { .. } => "popen",
            RpcCall::FdSetNew => "fd_set_new",
            RpcCall::FdSetDelete { .. } => "fd_set_delete",
            RpcCall::FdZero { .. } => "do_fd_zero",
            RpcCall::FdSet { .. } => "do_fd_set",
            RpcCall::FdClr { .. } => "do_fd_clr",
            RpcCall::FdIsSet { .. } => "do_fd_isset",
            RpcCall::SigSetNew => "sigset_new",
            RpcCall::SigSetDelete { .. } => "sigset_delete",
            RpcCall::SigEmptySet { .. } => "sigemptyset",
            RpcCall::SigFillSet { .. } => "sigfillset",
            RpcCall::SigAddSet { .. } => "sigaddset",
            RpcCall::SigDelSet { .. } => "sigdelset",
            RpcCall::SigIsMember { .. } => "sigismember",
            RpcCall::Malloc { .. } => "malloc",
            RpcCall::Memalign { .. } => "memalign",
            RpcCall::Free { .. } => "free",
            RpcCall::SetBuf { .. } => "set_buf",
            RpcCall::GetBuf { .. } => "get_buf",
            RpcCall::SetBufPattern { .. } => "set_buf_pattern",
            RpcCall::Memcmp { .. } => "memcmp",
            RpcCall::Dlopen { .. } => "dlopen",
            RpcCall::Dlsym { .. } => "dlsym",
            RpcCall::DlsymCall { .. } => "dlsym_call",
            RpcCall::Dlerror => "dlerror",
            RpcCall::Dlclose { .. } => "dlclose",
            RpcCall::Read { .. } => "read",
            RpcCall::Write { .. } => "write",
            RpcCall::Send { .. } => "send",
            RpcCall::Recv { .. } => "recv",
            RpcCall::Open { .. } => "open",
            RpcCall::Close { .. } => "close",
            RpcCall::Pipe => "pipe",
            RpcCall::SocketPair { .. } => "socketpair",
            RpcCall::Fcntl { .. } => "fcntl",
            RpcCall::Poll { .. } => "poll",
            RpcCall::IomuxWait { .. } => "iomux_wait",
            RpcCall::Readv { .. } => "readv",
            RpcCall::Writev { .. } => "writev",
            RpcCall::Sendfile { .. } => "sendfile",
            RpcCall::Socket { .. } => "socket",
            RpcCall::Bind { .. } => "bind",
            RpcCall::Connect { .. } => "connect",
            RpcCall::Listen { .. } => "listen",
            RpcCall::Accept { .. } => "accept",
            RpcCall::GetSockName { .. } => "getsockname",
            RpcCall::GetPeerName { .. } => "getpeername",
            RpcCall::Shutdown { .. } => "shutdown",
            RpcCall::GetSockOpt { .. } => "getsockopt",
            RpcCall::SetSockOpt { .. } => "setsockopt",
            RpcCall::AiocbNew => "create_aiocb",
            RpcCall::AiocbFill(_) => "fill_aiocb",
            RpcCall::AiocbDelete { .. } => "delete_aiocb",
            RpcCall::AioRead { .. } => "aio_read",
            RpcCall::AioWrite { .. } => "aio_write",
            RpcCall::AioError { .. } => "aio_error",
            RpcCall::AioReturn { .. } => "aio_return",
            RpcCall::AioCancel { .. } => "aio_cancel",
            RpcCall::AioFsync { .. } => "aio_fsync",
            RpcCall::AioSuspend { .. } => "aio_suspend",
            RpcCall::Flooder(_) => "flooder",
            RpcCall::Echoer(_) => "echoer",
            RpcCall::OverfillBuffers(_) => "overfill_buffers",
            RpcCall::OverfillFd { .. } => "overfill_fd",
            RpcCall::SocketToFile { .. } => "socket_to_file",
            RpcCall::RecvVerify { .. } => "recv_verify",
            RpcCall::SimpleSender(_) => "simple_sender",
            RpcCall::SimpleReceiver { .. } => "simple_receiver",
            RpcCall::WaitReadable { .. } => "wait_readable",
        }
    }
}

/// Typed result of a call
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcOutput {
    #[default]
    Unit,
    Int(i64),
    Bool(bool),
    Fd(Fd),
    FdPair(Fd, Fd),
    Pid(Pid),
    Handle(HandleId),
    Address(Address),
    Mask(u64),
    Text(String),
    Bytes(Vec<u8>),
    Wait { pid: Pid, status: WaitStatus },
    /// Return value plus the caller's buffer after the call
    Io { rc: i64, buf: Vec<u8> },
    Ready(Vec<(Fd, IoEvents)>),
    Traffic(TrafficStats),
    Count(u64),
    /// Errno value reported as data rather than as the call's failure
    Status(RpcErrno),
    /// Return value plus every vector after a vectored read
    Vectors { rc: i64, bufs: Vec<Vec<u8>> },
    Addr(SockAddr),
    Accepted { fd: Fd, peer: SockAddr },
    /// Bytes moved and the advanced offset, when one was given
    Sendfile { rc: i64, offset: Option<i64> },
}

impl RpcOutput {
    /// Put a checked buffer back into the output after verification
    pub fn attach_buffer(&mut self, data: Vec<u8>) {
        match self {
            RpcOutput::Io { buf, .. } => *buf = data,
            RpcOutput::Bytes(buf) => *buf = data,
            _ => {}
        }
    }
}

/// One request frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub header: CallHeader,
    pub call: RpcCall,
}

impl Request {
    pub fn new(header: CallHeader, call: RpcCall) -> Self {
        Self { header, call }
    }

    pub fn sync(call: RpcCall) -> Self {
        Self::new(CallHeader::default(), call)
    }
}

/// One reply frame
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Reply {
    pub header: ReplyHeader,
    pub output: RpcOutput,
}

impl Reply {
    pub fn error(errno: RpcErrno, message: impl Into<String>) -> Self {
        Self {
            header: ReplyHeader {
                errno,
                message: Some(message.into()),
                ..ReplyHeader::default()
            },
            output: RpcOutput::Unit,
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.header.errno.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::serialization::{decode_frame, encode_frame};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_frame() {
        let req = Request::new(
            CallHeader {
                mode: CallMode::FireAndForget,
                use_libc: true,
                ..CallHeader::default()
            },
            RpcCall::Flooder(FlooderParams {
                receivers: vec![3, 4],
                senders: vec![4],
                size_min: 64,
                size_max: 1024,
                delay_min_us: 0,
                delay_max_us: 100,
                time2run_s: 2,
                time2wait_ms: 500,
                iomux: Flavor::EpollPwait,
                ignore_err: false,
            }),
        );
        let frame = encode_frame(&req).unwrap();
        let back: Request = decode_frame(&frame).unwrap();
        assert_eq!(back, req);
        assert_eq!(back.call.name(), "flooder");
    }

    #[test]
    fn test_socket_call_frame() {
        let req = Request::sync(RpcCall::Connect {
            fd: 7,
            addr: SockAddr::Inet("10.0.0.2:5001".parse().unwrap()),
        });
        let back: Request = decode_frame(&encode_frame(&req).unwrap()).unwrap();
        assert_eq!(back, req);
        assert_eq!(back.call.name(), "connect");
        assert_eq!(RpcCall::AiocbNew.name(), "create_aiocb");
    }

    #[test]
    fn test_attach_buffer() {
        let mut out = RpcOutput::Io { rc: 3, buf: Vec::new() };
        out.attach_buffer(vec![1, 2, 3]);
        assert_eq!(out, RpcOutput::Io { rc: 3, buf: vec![1, 2, 3] });

        let mut unit = RpcOutput::Unit;
        unit.attach_buffer(vec![1]);
        assert_eq!(unit, RpcOutput::Unit);
    }
}
