/*!
 * Shell Helpers
 * `/bin/sh -c` children collected through the reaper
 */

use super::reaper::{reaper, ReaperError, ReaperResult};
use crate::core::types::{Pid, WaitStatus};
use libc::{c_char, c_int};
use nix::errno::Errno;
use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::{FromRawFd, OwnedFd};
use tracing::{debug, error};

const SHELL: &str = "/bin/sh";

fn shell_error(cmd: &str, reason: impl Into<String>) -> ReaperError {
    ReaperError::ShellCmd {
        cmd: cmd.to_string(),
        reason: reason.into(),
    }
}

/// Start `cmd` under `/bin/sh -c` in its own process group
///
/// With `capture_stdout` the child's standard output is connected to the
/// returned descriptor.
pub fn shell_cmd(cmd: &str, capture_stdout: bool) -> ReaperResult<(Pid, Option<OwnedFd>)> {
    // Everything the child touches is prepared before fork
    let shell = CString::new(SHELL).map_err(|_| shell_error(cmd, "bad shell path"))?;
    let arg0 = CString::new("sh").map_err(|_| shell_error(cmd, "bad argv"))?;
    let dash_c = CString::new("-c").map_err(|_| shell_error(cmd, "bad argv"))?;
    let command = CString::new(cmd).map_err(|_| shell_error(cmd, "command contains NUL"))?;
    let argv: [*const c_char; 4] = [arg0.as_ptr(), dash_c.as_ptr(), command.as_ptr(), std::ptr::null()];

    let mut pipe_fds: [c_int; 2] = [-1, -1];
    if capture_stdout {
        // SAFETY: pipe_fds is a valid two-element array
        if unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(ReaperError::Os {
                call: "pipe",
                errno: Errno::last(),
            });
        }
    }

    // SAFETY: the child only calls async-signal-safe functions before exec
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        let errno = Errno::last();
        for fd in pipe_fds.into_iter().filter(|fd| *fd >= 0) {
            unsafe { libc::close(fd) };
        }
        error!(cmd, %errno, "fork failed");
        return Err(shell_error(cmd, format!("fork: {}", errno)));
    }

    if pid == 0 {
        unsafe {
            libc::setpgid(0, 0);
            if capture_stdout {
                libc::dup2(pipe_fds[1], libc::STDOUT_FILENO);
            }
            libc::execv(shell.as_ptr(), argv.as_ptr());
            libc::_exit(127);
        }
    }

    debug!(cmd, pid, "shell command started");
    let out = if capture_stdout {
        unsafe { libc::close(pipe_fds[1]) };
        // SAFETY: the read end is open and owned by nobody else
        Some(unsafe { OwnedFd::from_raw_fd(pipe_fds[0]) })
    } else {
        None
    };
    Ok((pid, out))
}

/// Run `cmd` and return its raw wait status
pub fn system(cmd: &str) -> ReaperResult<c_int> {
    let (pid, _) = shell_cmd(cmd, false)?;
    match reaper().waitpid(pid, 0)? {
        Some((_, status)) => Ok(status),
        None => Err(ReaperError::NoChild(pid)),
    }
}

/// Run `cmd` and collect its standard output
///
/// A command that does not exit normally with code 0 is a shell failure.
pub fn popen(cmd: &str) -> ReaperResult<String> {
    let (pid, out) = shell_cmd(cmd, true)?;
    let mut output = String::new();
    let read = match out {
        Some(fd) => File::from(fd).read_to_string(&mut output),
        None => Ok(0),
    };

    let status = match reaper().waitpid(pid, 0)? {
        Some((_, status)) => WaitStatus::from_raw(status),
        None => return Err(ReaperError::NoChild(pid)),
    };

    if let Err(e) = read {
        return Err(shell_error(cmd, format!("reading output: {}", e)));
    }
    match status {
        WaitStatus::Exited(0) => Ok(output),
        other => {
            error!(cmd, status = ?other, "command did not complete successfully");
            Err(shell_error(cmd, format!("terminated with {:?}", other)))
        }
    }
}
