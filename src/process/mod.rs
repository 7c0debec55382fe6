/*!
 * Process Module
 * Child reaping, termination, shell helpers and received signals
 */

mod kill;
pub mod reaper;
pub mod signals;
pub mod spawn;

// Re-export for convenience
pub use kill::kill_death;
pub use reaper::{install as install_reaper, reaper, DeadChildRecord, DeadChildTable, Reaper, ReaperError, ReaperResult};
pub use signals::{clear_received, install_handler, received_mask, received_signals, signal_registrar};
pub use spawn::{popen, shell_cmd, system};

use crate::core::errors::{RpcErrno, ToRpcErrno};
use libc::{c_char, c_int, pid_t};
use nix::errno::Errno;
use std::ffi::CStr;

fn set_errno(err: &ReaperError) {
    let raw = match err {
        ReaperError::Os { errno, .. } => *errno as i32,
        other => other.rpc_errno().to_errno().unwrap_or(libc::EINVAL),
    };
    Errno::set_raw(raw);
}

/// C-callable `waitpid` that cooperates with the reaper
///
/// # Safety
/// `status` must be NULL or point to writable memory.
pub unsafe extern "C" fn ta_waitpid(pid: pid_t, status: *mut c_int, options: c_int) -> pid_t {
    match reaper().waitpid(pid, options) {
        Ok(Some((got, raw))) => {
            if !status.is_null() {
                *status = raw;
            }
            got
        }
        Ok(None) => 0,
        Err(err) => {
            set_errno(&err);
            -1
        }
    }
}

/// C-callable [`kill_death`]
pub extern "C" fn ta_kill_death(pid: pid_t) -> c_int {
    match kill_death(pid) {
        Ok(()) => 0,
        Err(err) => {
            set_errno(&err);
            -1
        }
    }
}

/// C-callable [`system`]; returns the raw wait status or -1
///
/// # Safety
/// `cmd` must be NULL or a valid NUL-terminated string.
pub unsafe extern "C" fn ta_system(cmd: *const c_char) -> c_int {
    if cmd.is_null() {
        Errno::set_raw(libc::EINVAL);
        return -1;
    }
    let cmd = CStr::from_ptr(cmd).to_string_lossy();
    match system(&cmd) {
        Ok(status) => status,
        Err(err) => {
            if err.rpc_errno() == RpcErrno::ShellCmd {
                Errno::set_raw(libc::ECHILD);
            } else {
                set_errno(&err);
            }
            -1
        }
    }
}
