/*!
 * File Descriptor Guards
 *
 * RAII guards for descriptors and descriptor flags with automatic cleanup
 */

use super::traits::{Guard, GuardDrop};
use super::{GuardError, GuardMetadata, GuardResult};
use crate::core::types::Fd;
use nix::errno::Errno;

type CloseFn = Box<dyn FnMut(Fd) -> Result<(), Errno> + Send>;
type SetFlagsFn = Box<dyn FnMut(Fd, i32) -> Result<(), Errno> + Send>;

/// File descriptor guard with automatic close
///
/// The close function is supplied by the caller so that descriptors opened
/// through a library under test are also closed through it.
pub struct FdGuard {
    fd: Fd,
    path: Option<String>,
    close_fn: CloseFn,
    metadata: GuardMetadata,
    active: bool,
}

impl FdGuard {
    pub fn new<F>(fd: Fd, path: Option<String>, close_fn: F) -> Self
    where
        F: FnMut(Fd) -> Result<(), Errno> + Send + 'static,
    {
        tracing::trace!(fd, path = path.as_deref().unwrap_or(""), "fd guard armed");
        Self {
            fd,
            path,
            close_fn: Box::new(close_fn),
            metadata: GuardMetadata::new("fd"),
            active: true,
        }
    }

    #[inline]
    pub fn fd(&self) -> Fd {
        self.fd
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Close the descriptor now and report the close result
    pub fn close_early(mut self) -> GuardResult<()> {
        self.release()
    }
}

impl Guard for FdGuard {
    fn resource_type(&self) -> &'static str {
        "fd"
    }

    fn metadata(&self) -> &GuardMetadata {
        &self.metadata
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn release(&mut self) -> GuardResult<()> {
        if !self.active {
            return Err(GuardError::AlreadyReleased);
        }

        self.active = false;
        (self.close_fn)(self.fd).map_err(|errno| GuardError::Release {
            resource: "fd",
            fd: self.fd,
            errno,
        })
    }
}

impl GuardDrop for FdGuard {
    fn on_drop(&mut self) {
        if self.active {
            if let Err(e) = self.release() {
                tracing::error!(fd = self.fd, error = %e, "fd guard drop failed");
            }
        }
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        self.on_drop();
    }
}

/// Restores a descriptor's status flags when dropped
pub struct FlagsGuard {
    fd: Fd,
    original: i32,
    set_fn: SetFlagsFn,
    metadata: GuardMetadata,
    active: bool,
}

impl FlagsGuard {
    /// Remember `original` as the flags to restore on `fd`
    pub fn new<F>(fd: Fd, original: i32, set_fn: F) -> Self
    where
        F: FnMut(Fd, i32) -> Result<(), Errno> + Send + 'static,
    {
        Self {
            fd,
            original,
            set_fn: Box::new(set_fn),
            metadata: GuardMetadata::new("fd_flags"),
            active: true,
        }
    }

    #[inline]
    pub fn original(&self) -> i32 {
        self.original
    }

    /// Restore now so a failure can be reported to the caller
    pub fn restore(mut self) -> GuardResult<()> {
        self.release()
    }
}

impl Guard for FlagsGuard {
    fn resource_type(&self) -> &'static str {
        "fd_flags"
    }

    fn metadata(&self) -> &GuardMetadata {
        &self.metadata
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn release(&mut self) -> GuardResult<()> {
        if !self.active {
            return Err(GuardError::AlreadyReleased);
        }

        self.active = false;
        (self.set_fn)(self.fd, self.original).map_err(|errno| GuardError::Release {
            resource: "fd_flags",
            fd: self.fd,
            errno,
        })
    }
}

impl GuardDrop for FlagsGuard {
    fn on_drop(&mut self) {
        if self.active {
            if let Err(e) = self.release() {
                tracing::error!(fd = self.fd, error = %e, "flags guard drop failed");
            }
        }
    }
}

impl Drop for FlagsGuard {
    fn drop(&mut self) {
        self.on_drop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fd_guard_cleanup() {
        let closed = Arc::new(AtomicBool::new(false));
        let closed_clone = closed.clone();

        {
            let guard = FdGuard::new(3, Some("/test/file".to_string()), move |_fd| {
                closed_clone.store(true, Ordering::SeqCst);
                Ok(())
            });
            assert_eq!(guard.fd(), 3);
            assert_eq!(guard.path(), Some("/test/file"));
            assert!(!closed.load(Ordering::SeqCst));
        }

        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_fd_guard_early_close_reports_error() {
        let guard = FdGuard::new(5, None, |_| Err(Errno::EBADF));
        let err = guard.close_early().unwrap_err();
        assert!(matches!(err, GuardError::Release { fd: 5, errno: Errno::EBADF, .. }));
    }

    #[test]
    fn test_flags_guard_restores_on_drop() {
        let restored = Arc::new(AtomicI32::new(-1));
        let restored_clone = restored.clone();

        {
            let guard = FlagsGuard::new(7, 0o2, move |_fd, flags| {
                restored_clone.store(flags, Ordering::SeqCst);
                Ok(())
            });
            assert_eq!(guard.original(), 0o2);
        }

        assert_eq!(restored.load(Ordering::SeqCst), 0o2);
    }
}
