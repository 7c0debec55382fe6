/*!
 * RAII Resource Guards
 *
 * Scoped acquisition with guaranteed release for everything a single RPC
 * allocates: descriptors, temporarily changed fd flags, and checked
 * argument snapshots.
 *
 * ## Guard Types
 *
 * - **FdGuard**: closes a descriptor through a caller-supplied close function
 * - **FlagsGuard**: restores `fcntl(F_SETFL)` flags on every exit path
 * - **CheckedArgs**: pre-call snapshots verified in LIFO order after the call
 */

mod checked;
mod fd;
mod traits;

pub use checked::{CheckedArg, CheckedArgError, CheckedArgs};
pub use fd::{FdGuard, FlagsGuard};
pub use traits::{Guard, GuardDrop};

/// Result type for guard operations
pub type GuardResult<T> = Result<T, GuardError>;

#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic)]
pub enum GuardError {
    #[error("Resource already released")]
    #[diagnostic(code(guard::already_released))]
    AlreadyReleased,

    #[error("Cannot release {resource} of fd {fd}: {errno}")]
    #[diagnostic(code(guard::release_failed))]
    Release {
        resource: &'static str,
        fd: crate::core::types::Fd,
        errno: nix::errno::Errno,
    },
}

impl crate::core::errors::ToRpcErrno for GuardError {
    fn rpc_errno(&self) -> crate::core::errors::RpcErrno {
        match self {
            GuardError::AlreadyReleased => crate::core::errors::RpcErrno::Unknown,
            GuardError::Release { errno, .. } => (*errno).into(),
        }
    }
}

/// Guard metadata for observability
#[derive(Debug, Clone)]
pub struct GuardMetadata {
    pub resource_type: &'static str,
    pub creation_time: std::time::Instant,
}

impl GuardMetadata {
    #[inline]
    pub fn new(resource_type: &'static str) -> Self {
        Self {
            resource_type,
            creation_time: std::time::Instant::now(),
        }
    }

    #[inline]
    pub fn lifetime_micros(&self) -> u64 {
        self.creation_time.elapsed().as_micros() as u64
    }
}
