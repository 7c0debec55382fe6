/*!
 * Core Types
 * Common types used across the agent
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process ID type (signed, `-1` means "any child")
pub type Pid = i32;

/// File descriptor type
pub type Fd = i32;

/// Opaque handle identifier (0 is reserved for "none")
pub type HandleId = u32;

/// Deferred call identifier (0 means "no job")
pub type JobId = u64;

/// Raw address of a resolved symbol or registered object
pub type Address = usize;

/// Timestamp in milliseconds since the Unix epoch
pub type TimestampMs = u64;

/// Common result type for agent operations
pub type AgentResult<T> = Result<T, super::errors::AgentError>;

/// Kinds of objects the handle registry can name
///
/// The set is closed; a lookup with the wrong kind is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    FdSet,
    SigSet,
    AioControlBlock,
    DlHandle,
    Buffer,
}

impl HandleKind {
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            HandleKind::FdSet => "fd_set",
            HandleKind::SigSet => "sigset",
            HandleKind::AioControlBlock => "aiocb",
            HandleKind::DlHandle => "dl_handle",
            HandleKind::Buffer => "buffer",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded child wait status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStatus {
    Exited(i32),
    Signaled { signal: i32, core_dumped: bool },
    Stopped(i32),
    Unknown(i32),
}

impl WaitStatus {
    /// Decode a raw `waitpid()` status word
    pub fn from_raw(status: i32) -> Self {
        if libc::WIFEXITED(status) {
            WaitStatus::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            WaitStatus::Signaled {
                signal: libc::WTERMSIG(status),
                core_dumped: libc::WCOREDUMP(status),
            }
        } else if libc::WIFSTOPPED(status) {
            WaitStatus::Stopped(libc::WSTOPSIG(status))
        } else {
            WaitStatus::Unknown(status)
        }
    }

    #[inline]
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, WaitStatus::Exited(0))
    }
}
