/*!
 * Kill-Death
 * Bounded two-phase termination of a child process group
 */

use super::reaper::{reaper, ReaperError, ReaperResult};
use crate::core::limits::KILL_DEATH_GRACE;
use crate::core::types::Pid;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid as NixPid;
use tracing::{debug, warn};

fn is_reaped(pid: Pid) -> bool {
    matches!(reaper().waitpid(pid, libc::WNOHANG), Ok(Some(_)))
}

/// Terminate `pid` and its process group, escalating to SIGKILL
///
/// Sends SIGTERM to the group, waits `KILL_DEATH_GRACE`, and if the child
/// is still alive sends SIGKILL and waits for it without a timeout.
pub fn kill_death(pid: Pid) -> ReaperResult<()> {
    if pid <= 0 {
        return Err(ReaperError::InvalidPid(pid));
    }
    if is_reaped(pid) {
        return Ok(());
    }

    let group = NixPid::from_raw(-pid);
    let term = kill(group, Signal::SIGTERM);
    if let Err(errno) = term {
        if errno != Errno::ESRCH {
            return Err(ReaperError::Os { call: "kill", errno });
        }
    }

    std::thread::sleep(KILL_DEATH_GRACE);
    if is_reaped(pid) {
        debug!(pid, "child terminated by SIGTERM");
        return Ok(());
    }
    if let Err(errno) = term {
        // Nothing to signal, but the child is not collectable either
        return Err(ReaperError::Os { call: "kill", errno });
    }

    std::thread::sleep(KILL_DEATH_GRACE);
    warn!(pid, "child ignored SIGTERM, sending SIGKILL");
    let _ = kill(group, Signal::SIGKILL);
    reaper().waitpid(pid, 0).map(|_| ())
}
