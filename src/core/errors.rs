/*!
 * Error Types
 * Wire error taxonomy, errno translation, and the unified agent error
 */

use miette::Diagnostic;
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use crate::composites::CompositeError;
pub use crate::core::guard::{CheckedArgError, GuardError};
pub use crate::core::handles::HandleError;
pub use crate::iomux::IomuxError;
pub use crate::process::ReaperError;
pub use crate::symbols::ResolveError;
pub use crate::api::TransportError;

/// Error code carried in every reply header
///
/// Closed enumeration; every OS errno maps onto exactly one variant
/// through [`RpcErrno::from_errno`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum RpcErrno {
    #[default]
    Ok,
    InvalidArg,
    NoEntry,
    Exists,
    NoMemory,
    Interrupted,
    WouldBlock,
    NoSpace,
    NotSupported,
    Permission,
    Fault,
    Corrupted,
    Io,
    ShellCmd,
    NoChild,
    BadFd,
    Pipe,
    ConnRefused,
    ConnReset,
    NotConnected,
    InProgress,
    Already,
    AddrInUse,
    TimedOut,
    Busy,
    Range,
    TooBig,
    RpcNotSupported,
    Unknown,
}

impl RpcErrno {
    /// Translate an OS errno value; total over `i32`
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            0 => RpcErrno::Ok,
            libc::EINVAL => RpcErrno::InvalidArg,
            libc::ENOENT | libc::ESRCH => RpcErrno::NoEntry,
            libc::EEXIST => RpcErrno::Exists,
            libc::ENOMEM | libc::ENOBUFS => RpcErrno::NoMemory,
            libc::EINTR => RpcErrno::Interrupted,
            libc::EAGAIN => RpcErrno::WouldBlock,
            libc::ENOSPC => RpcErrno::NoSpace,
            libc::EOPNOTSUPP
            | libc::ENOSYS
            | libc::EPROTONOSUPPORT
            | libc::EAFNOSUPPORT => RpcErrno::NotSupported,
            libc::EPERM | libc::EACCES => RpcErrno::Permission,
            libc::EFAULT => RpcErrno::Fault,
            libc::EIO => RpcErrno::Io,
            libc::ECHILD => RpcErrno::NoChild,
            libc::EBADF | libc::ENOTSOCK => RpcErrno::BadFd,
            libc::EPIPE => RpcErrno::Pipe,
            libc::ECONNREFUSED => RpcErrno::ConnRefused,
            libc::ECONNRESET | libc::ECONNABORTED => RpcErrno::ConnReset,
            libc::ENOTCONN => RpcErrno::NotConnected,
            libc::EINPROGRESS => RpcErrno::InProgress,
            libc::EALREADY => RpcErrno::Already,
            libc::EADDRINUSE | libc::EADDRNOTAVAIL => RpcErrno::AddrInUse,
            libc::ETIMEDOUT => RpcErrno::TimedOut,
            libc::EBUSY => RpcErrno::Busy,
            libc::ERANGE => RpcErrno::Range,
            libc::E2BIG | libc::EMSGSIZE => RpcErrno::TooBig,
            _ => RpcErrno::Unknown,
        }
    }

    /// Canonical OS errno for this code, if one exists
    pub fn to_errno(self) -> Option<i32> {
        let errno = match self {
            RpcErrno::Ok => 0,
            RpcErrno::InvalidArg => libc::EINVAL,
            RpcErrno::NoEntry => libc::ENOENT,
            RpcErrno::Exists => libc::EEXIST,
            RpcErrno::NoMemory => libc::ENOMEM,
            RpcErrno::Interrupted => libc::EINTR,
            RpcErrno::WouldBlock => libc::EAGAIN,
            RpcErrno::NoSpace => libc::ENOSPC,
            RpcErrno::NotSupported => libc::EOPNOTSUPP,
            RpcErrno::Permission => libc::EPERM,
            RpcErrno::Fault => libc::EFAULT,
            RpcErrno::Io => libc::EIO,
            RpcErrno::NoChild => libc::ECHILD,
            RpcErrno::BadFd => libc::EBADF,
            RpcErrno::Pipe => libc::EPIPE,
            RpcErrno::ConnRefused => libc::ECONNREFUSED,
            RpcErrno::ConnReset => libc::ECONNRESET,
            RpcErrno::NotConnected => libc::ENOTCONN,
            RpcErrno::InProgress => libc::EINPROGRESS,
            RpcErrno::Already => libc::EALREADY,
            RpcErrno::AddrInUse => libc::EADDRINUSE,
            RpcErrno::TimedOut => libc::ETIMEDOUT,
            RpcErrno::Busy => libc::EBUSY,
            RpcErrno::Range => libc::ERANGE,
            RpcErrno::TooBig => libc::E2BIG,
            RpcErrno::Corrupted
            | RpcErrno::ShellCmd
            | RpcErrno::RpcNotSupported
            | RpcErrno::Unknown => return None,
        };
        Some(errno)
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self == RpcErrno::Ok
    }

    /// Errors composites treat as "try again later"
    #[inline]
    pub fn is_retry(self) -> bool {
        matches!(self, RpcErrno::WouldBlock | RpcErrno::Interrupted)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            RpcErrno::Ok => "ok",
            RpcErrno::InvalidArg => "invalid-arg",
            RpcErrno::NoEntry => "no-entry",
            RpcErrno::Exists => "exists",
            RpcErrno::NoMemory => "no-memory",
            RpcErrno::Interrupted => "interrupted",
            RpcErrno::WouldBlock => "would-block",
            RpcErrno::NoSpace => "no-space",
            RpcErrno::NotSupported => "not-supported",
            RpcErrno::Permission => "permission",
            RpcErrno::Fault => "fault",
            RpcErrno::Corrupted => "corrupted",
            RpcErrno::Io => "io",
            RpcErrno::ShellCmd => "shell-cmd",
            RpcErrno::NoChild => "no-child",
            RpcErrno::BadFd => "bad-fd",
            RpcErrno::Pipe => "pipe",
            RpcErrno::ConnRefused => "conn-refused",
            RpcErrno::ConnReset => "conn-reset",
            RpcErrno::NotConnected => "not-connected",
            RpcErrno::InProgress => "in-progress",
            RpcErrno::Already => "already",
            RpcErrno::AddrInUse => "addr-in-use",
            RpcErrno::TimedOut => "timed-out",
            RpcErrno::Busy => "busy",
            RpcErrno::Range => "range",
            RpcErrno::TooBig => "too-big",
            RpcErrno::RpcNotSupported => "rpc-not-supported",
            RpcErrno::Unknown => "unknown",
        }
    }
}

impl From<Errno> for RpcErrno {
    #[inline]
    fn from(errno: Errno) -> Self {
        RpcErrno::from_errno(errno as i32)
    }
}

impl fmt::Display for RpcErrno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can report themselves in the wire taxonomy
pub trait ToRpcErrno {
    fn rpc_errno(&self) -> RpcErrno;
}

impl ToRpcErrno for Errno {
    #[inline]
    fn rpc_errno(&self) -> RpcErrno {
        RpcErrno::from(*self)
    }
}

/// Unified agent error type with miette diagnostics
#[derive(Error, Debug, Diagnostic)]
pub enum AgentError {
    #[error("Symbol resolution failed: {0}")]
    #[diagnostic(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Handle error: {0}")]
    #[diagnostic(transparent)]
    Handle(#[from] HandleError),

    #[error("Checked argument violated: {0}")]
    #[diagnostic(transparent)]
    CheckedArg(#[from] CheckedArgError),

    #[error("Guard error: {0}")]
    #[diagnostic(transparent)]
    Guard(#[from] GuardError),

    #[error("Reaper error: {0}")]
    #[diagnostic(transparent)]
    Reaper(#[from] ReaperError),

    #[error("Multiplexer error: {0}")]
    #[diagnostic(transparent)]
    Iomux(#[from] IomuxError),

    #[error("Composite failed: {0}")]
    #[diagnostic(transparent)]
    Composite(#[from] CompositeError),

    #[error("Transport error: {0}")]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),

    #[error("{call}() failed: {errno}")]
    #[diagnostic(code(agent::os_error))]
    Os { call: &'static str, errno: Errno },

    #[error("{message}")]
    #[diagnostic(code(agent::rpc_error))]
    Rpc { errno: RpcErrno, message: String },

    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(agent::configuration_error),
        help("Check the RPC_AGENT_* environment variables and the command line.")
    )]
    Configuration(String),

    #[error("I/O error: {0}")]
    #[diagnostic(code(agent::io_error))]
    Io(String),
}

impl AgentError {
    /// Failure of a named OS primitive
    #[inline]
    pub fn os(call: &'static str, errno: Errno) -> Self {
        AgentError::Os { call, errno }
    }

    /// Error reported directly in the wire taxonomy
    #[inline]
    pub fn rpc(errno: RpcErrno, message: impl Into<String>) -> Self {
        AgentError::Rpc {
            errno,
            message: message.into(),
        }
    }

    #[inline]
    pub fn invalid_arg(message: impl Into<String>) -> Self {
        Self::rpc(RpcErrno::InvalidArg, message)
    }
}

impl ToRpcErrno for AgentError {
    fn rpc_errno(&self) -> RpcErrno {
        match self {
            AgentError::Resolve(e) => e.rpc_errno(),
            AgentError::Handle(e) => e.rpc_errno(),
            AgentError::CheckedArg(_) => RpcErrno::Corrupted,
            AgentError::Guard(e) => e.rpc_errno(),
            AgentError::Reaper(e) => e.rpc_errno(),
            AgentError::Iomux(e) => e.rpc_errno(),
            AgentError::Composite(e) => e.rpc_errno(),
            AgentError::Transport(e) => e.rpc_errno(),
            AgentError::Os { errno, .. } => RpcErrno::from(*errno),
            AgentError::Rpc { errno, .. } => *errno,
            AgentError::Configuration(_) => RpcErrno::InvalidArg,
            AgentError::Io(_) => RpcErrno::Io,
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(raw) => AgentError::Os {
                call: "io",
                errno: Errno::from_raw(raw),
            },
            None => AgentError::Io(err.to_string()),
        }
    }
}

/// Serializable error representation carried next to the reply header
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub errno: RpcErrno,
    pub message: String,
}

impl ErrorReport {
    pub fn new(errno: RpcErrno, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }
}

impl From<&AgentError> for ErrorReport {
    fn from(err: &AgentError) -> Self {
        ErrorReport::new(err.rpc_errno(), err.to_string())
    }
}

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;
