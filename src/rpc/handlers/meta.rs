/*!
 * Meta Call Handler
 *
 * Resolver control, introspection, signal registration and helper RPC
 * servers. Helper servers are started through a [`HelperLauncher`] so the
 * transport layer stays out of the dispatch path.
 */

use crate::core::errors::{AgentError, Result, RpcErrno};
use crate::core::types::{Address, Pid};
use crate::process::{install_handler, received_mask};
use crate::rpc::handler::{CallContext, RpcHandler};
use crate::rpc::types::{RpcCall, RpcOutput};
use crate::symbols::{static_table, ResolveError};
use std::sync::Arc;
use tracing::{debug, info};

type GetpidFn = unsafe extern "C" fn() -> libc::pid_t;

/// Starts helper RPC servers on behalf of `create_process` and
/// `thread_create`
pub trait HelperLauncher: Send + Sync {
    /// Fork a helper server, optionally re-executing the agent binary
    fn spawn_process(&self, name: &str, exec: bool) -> Result<Pid>;

    /// Start a helper server on a named thread
    fn spawn_thread(&self, name: &str) -> Result<()>;

    /// Wait for a helper thread to finish
    fn join_thread(&self, name: &str) -> Result<()>;
}

/// Size of a C type by name, `-1` if unknown
///
/// A leading `*` asks for the size of a pointer.
pub fn sizeof_type(type_name: &str) -> i64 {
    use std::mem::size_of;

    let name = type_name.trim();
    if name.starts_with('*') {
        return size_of::<*const libc::c_void>() as i64;
    }
    let size = match name {
        "char" | "unsigned char" | "signed char" => size_of::<libc::c_char>(),
        "short" | "unsigned short" => size_of::<libc::c_short>(),
        "int" | "unsigned int" => size_of::<libc::c_int>(),
        "long" | "unsigned long" => size_of::<libc::c_long>(),
        "long long" | "unsigned long long" => size_of::<libc::c_longlong>(),
        "size_t" => size_of::<libc::size_t>(),
        "ssize_t" => size_of::<libc::ssize_t>(),
        "off_t" => size_of::<libc::off_t>(),
        "pid_t" => size_of::<libc::pid_t>(),
        "uid_t" => size_of::<libc::uid_t>(),
        "socklen_t" => size_of::<libc::socklen_t>(),
        "time_t" => size_of::<libc::time_t>(),
        "fd_set" => size_of::<libc::fd_set>(),
        "sigset_t" => size_of::<libc::sigset_t>(),
        "struct timeval" => size_of::<libc::timeval>(),
        "struct timespec" => size_of::<libc::timespec>(),
        "struct pollfd" => size_of::<libc::pollfd>(),
        "struct epoll_event" => size_of::<libc::epoll_event>(),
        "struct sockaddr" => size_of::<libc::sockaddr>(),
        "struct sockaddr_in" => size_of::<libc::sockaddr_in>(),
        "struct sockaddr_in6" => size_of::<libc::sockaddr_in6>(),
        "struct sockaddr_un" => size_of::<libc::sockaddr_un>(),
        "struct sockaddr_storage" => size_of::<libc::sockaddr_storage>(),
        "struct iovec" => size_of::<libc::iovec>(),
        "struct msghdr" => size_of::<libc::msghdr>(),
        "struct linger" => size_of::<libc::linger>(),
        "struct aiocb" => size_of::<libc::aiocb>(),
        _ => return -1,
    };
    size as i64
}

/// Printable name of a signal disposition
fn disposition_name(addr: Address) -> String {
    match addr {
        a if a == libc::SIG_DFL => "SIG_DFL".to_string(),
        a if a == libc::SIG_IGN => "SIG_IGN".to_string(),
        a => static_table().name_of(a).unwrap_or_else(|| format!("{:#x}", a)),
    }
}

/// Handler for resolver, signal and helper-server calls
pub struct MetaHandler {
    launcher: Option<Arc<dyn HelperLauncher>>,
}

impl MetaHandler {
    pub fn new(launcher: Option<Arc<dyn HelperLauncher>>) -> Self {
        Self { launcher }
    }

    fn launcher(&self) -> Result<&Arc<dyn HelperLauncher>> {
        self.launcher
            .as_ref()
            .ok_or_else(|| AgentError::rpc(RpcErrno::NotSupported, "helper servers unavailable"))
    }

    fn find_func(&self, ctx: &CallContext<'_>, name: &str) -> Result<RpcOutput> {
        match ctx.prims.resolver().resolve(ctx.use_libc(), name) {
            Ok(_) => Ok(RpcOutput::Bool(true)),
            Err(ResolveError::NotFound(_)) => {
                debug!(symbol = name, "function not found");
                Ok(RpcOutput::Bool(false))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn getpid(&self, ctx: &CallContext<'_>) -> Result<RpcOutput> {
        let addr = ctx.prims.resolver().resolve(ctx.use_libc(), "getpid")?;
        // SAFETY: the resolved symbol is the POSIX getpid
        let f = unsafe { std::mem::transmute::<Address, GetpidFn>(addr) };
        Ok(RpcOutput::Pid(unsafe { f() }))
    }

    fn signal(&self, ctx: &CallContext<'_>, signum: i32, handler: &str) -> Result<RpcOutput> {
        let addr = match handler {
            "SIG_DFL" => libc::SIG_DFL,
            "SIG_IGN" => libc::SIG_IGN,
            name => ctx.prims.resolver().resolve(ctx.use_libc(), name)?,
        };
        let previous = install_handler(signum, addr)?;
        info!(signum, handler, "signal disposition changed");
        Ok(RpcOutput::Text(disposition_name(previous)))
    }
}

impl RpcHandler for MetaHandler {
    fn handle(&self, ctx: &mut CallContext<'_>, call: &RpcCall) -> Option<Result<RpcOutput>> {
        let result = match call {
            RpcCall::SetLibName { name } => ctx
                .prims
                .resolver()
                .set_library(name.as_deref())
                .map(|_| RpcOutput::Unit)
                .map_err(Into::into),
            RpcCall::FindFunc { name } => self.find_func(ctx, name),
            RpcCall::GetSizeof { type_name } => Ok(RpcOutput::Int(sizeof_type(type_name))),
            RpcCall::GetPid => self.getpid(ctx),
            RpcCall::SigReceived => Ok(RpcOutput::Mask(received_mask())),
            RpcCall::Signal { signum, handler } => self.signal(ctx, *signum, handler),
            RpcCall::CreateProcess { name, exec } => self
                .launcher()
                .and_then(|l| l.spawn_process(name, *exec))
                .map(RpcOutput::Pid),
            RpcCall::ThreadCreate { name } => self
                .launcher()
                .and_then(|l| l.spawn_thread(name))
                .map(|_| RpcOutput::Unit),
            RpcCall::ThreadJoin { name } => self
                .launcher()
                .and_then(|l| l.join_thread(name))
                .map(|_| RpcOutput::Unit),
            _ => return None,
        };
        Some(result)
    }

    fn name(&self) -> &'static str {
        "meta_handler"
    }
}
