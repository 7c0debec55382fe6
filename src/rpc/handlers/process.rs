/*!
 * Process Call Handler
 * Child waiting, termination and shell helpers
 */

use crate::core::errors::{AgentError, Result};
use crate::core::types::{Pid, WaitStatus};
use crate::process::{kill_death, popen, reaper, system};
use crate::rpc::handler::{CallContext, RpcHandler};
use crate::rpc::types::{RpcCall, RpcOutput};
use nix::errno::Errno;
use tracing::info;

/// Handler for process calls
pub struct ProcessHandler;

impl ProcessHandler {
    fn waitpid(&self, pid: Pid, options: i32) -> Result<RpcOutput> {
        match reaper().waitpid(pid, options)? {
            Some((got, raw)) => Ok(RpcOutput::Wait {
                pid: got,
                status: WaitStatus::from_raw(raw),
            }),
            // WNOHANG and the child is still running
            None => Ok(RpcOutput::Pid(0)),
        }
    }

    fn kill(&self, pid: Pid, signum: i32) -> Result<RpcOutput> {
        // SAFETY: kill has no memory-safety preconditions
        if unsafe { libc::kill(pid, signum) } != 0 {
            return Err(AgentError::os("kill", Errno::last()));
        }
        info!(pid, signum, "signal sent");
        Ok(RpcOutput::Unit)
    }

    fn system(&self, cmd: &str) -> Result<RpcOutput> {
        let raw = system(cmd)?;
        Ok(RpcOutput::Wait {
            pid: 0,
            status: WaitStatus::from_raw(raw),
        })
    }
}

impl RpcHandler for ProcessHandler {
    fn handle(&self, _ctx: &mut CallContext<'_>, call: &RpcCall) -> Option<Result<RpcOutput>> {
        match call {
            RpcCall::Waitpid { pid, options } => Some(self.waitpid(*pid, *options)),
            RpcCall::KillDeath { pid } => Some(kill_death(*pid).map(|_| RpcOutput::Unit).map_err(Into::into)),
            RpcCall::Kill { pid, signum } => Some(self.kill(*pid, *signum)),
            RpcCall::System { cmd } => Some(self.system(cmd)),
            RpcCall::Popen { cmd } => Some(popen(cmd).map(RpcOutput::Text).map_err(Into::into)),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        "process_handler"
    }
}
