/*!
 * Helper RPC Servers
 *
 * Blocking servers started on demand by `create_process` and
 * `thread_create`. A helper serves the first client that connects to
 * `<socket_dir>/<name>.sock` and returns when that client disconnects. The
 * socket is bound before the creating call replies, so the client can
 * connect right away.
 */

use crate::api::server::agent_server::prepare_socket_path;
use crate::api::transport::{read_message_blocking, write_message_blocking, TransportError, TransportResult};
use crate::api::types::ServerConfig;
use crate::core::errors::{AgentError, Result, RpcErrno};
use crate::core::types::Pid;
use crate::rpc::{default_registry, Dispatcher, HelperLauncher, Reply, Request};
use ahash::HashMap;
use nix::unistd::{fork, ForkResult};
use parking_lot::Mutex;
use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Serve one client connection on `listener` until it disconnects
pub fn serve_one(listener: UnixListener, dispatcher: &Dispatcher) -> TransportResult<()> {
    let (mut stream, _) = listener.accept()?;
    drop(listener);
    debug!("helper client connected");

    loop {
        let reply = match read_message_blocking::<_, Request>(&mut stream) {
            Ok(Some(request)) => dispatcher.dispatch(request),
            Ok(None) => break,
            Err(e @ TransportError::Payload(_)) => {
                warn!(error = %e, "undecodable request");
                Reply::error(RpcErrno::InvalidArg, e.to_string())
            }
            Err(e) => return Err(e),
        };
        write_message_blocking(&mut stream, &reply)?;
    }
    debug!("helper client disconnected");
    Ok(())
}

fn bind(config: &ServerConfig) -> Result<UnixListener> {
    let path = config.socket_path();
    prepare_socket_path(&path)?;
    UnixListener::bind(&path).map_err(|e| {
        TransportError::Bind {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Launcher and bookkeeping for helper servers
pub struct HelperServers {
    config: ServerConfig,
    agent_exe: Option<PathBuf>,
    threads: Mutex<HashMap<String, JoinHandle<TransportResult<()>>>>,
    me: Weak<HelperServers>,
}

impl HelperServers {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let agent_exe = std::env::current_exe().ok();
        Arc::new_cyclic(|me| Self {
            config,
            agent_exe,
            threads: Mutex::new(HashMap::default()),
            me: me.clone(),
        })
    }

    /// Dispatcher for a helper; helpers may start helpers of their own
    fn helper_dispatcher(&self) -> Dispatcher {
        let launcher = self.me.upgrade().map(|me| me as Arc<dyn HelperLauncher>);
        Dispatcher::new(default_registry(launcher))
    }

    /// Replace the current image with `rpc-agent exec rpc-server <name>`
    /// serving the inherited listener
    fn exec_child(&self, name: &str, listener: &UnixListener) -> ! {
        let fd = listener.as_raw_fd();
        // SAFETY: clearing FD_CLOEXEC on a descriptor we own
        unsafe { libc::fcntl(fd, libc::F_SETFD, 0) };

        let args = [
            "rpc-agent".to_string(),
            "exec".to_string(),
            "rpc-server".to_string(),
            name.to_string(),
            "--listen-fd".to_string(),
            fd.to_string(),
        ];
        let exe = self
            .agent_exe
            .as_ref()
            .and_then(|p| CString::new(p.as_os_str().as_bytes()).ok());
        let argv: Option<Vec<CString>> = args.iter().map(|a| CString::new(a.as_str()).ok()).collect();
        if let (Some(exe), Some(argv)) = (exe, argv) {
            let _ = nix::unistd::execv(&exe, &argv);
        }
        // SAFETY: leaving the forked child without running parent destructors
        unsafe { libc::_exit(1) }
    }
}

impl HelperLauncher for HelperServers {
    fn spawn_process(&self, name: &str, exec: bool) -> Result<Pid> {
        let config = self.config.for_helper(name);
        let listener = bind(&config)?;

        // SAFETY: the child only runs the blocking helper server and exits
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                info!(name, pid = child.as_raw(), exec, "helper process started");
                Ok(child.as_raw())
            }
            Ok(ForkResult::Child) => {
                if exec {
                    self.exec_child(name, &listener);
                }
                let code = match serve_one(listener, &self.helper_dispatcher()) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!(name, error = %e, "helper process failed");
                        1
                    }
                };
                // SAFETY: leaving the forked child without running parent destructors
                unsafe { libc::_exit(code) }
            }
            Err(errno) => Err(AgentError::os("fork", errno)),
        }
    }

    fn spawn_thread(&self, name: &str) -> Result<()> {
        let mut threads = self.threads.lock();
        if threads.contains_key(name) {
            return Err(AgentError::rpc(RpcErrno::Exists, format!("helper thread {} exists", name)));
        }

        let listener = bind(&self.config.for_helper(name))?;
        let dispatcher = self.helper_dispatcher();
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("rpc-helper-{}", name))
            .spawn(move || {
                let result = serve_one(listener, &dispatcher);
                if let Err(e) = &result {
                    error!(name = %thread_name, error = %e, "helper thread failed");
                }
                result
            })
            .map_err(|e| AgentError::rpc(RpcErrno::NoMemory, format!("cannot start helper thread: {}", e)))?;

        threads.insert(name.to_string(), handle);
        info!(name, "helper thread started");
        Ok(())
    }

    fn join_thread(&self, name: &str) -> Result<()> {
        let handle = self
            .threads
            .lock()
            .remove(name)
            .ok_or_else(|| AgentError::rpc(RpcErrno::NoEntry, format!("no helper thread {}", name)))?;

        match handle.join() {
            Ok(result) => {
                let _ = std::fs::remove_file(self.config.for_helper(name).socket_path());
                info!(name, "helper thread joined");
                result.map_err(Into::into)
            }
            Err(_) => Err(AgentError::rpc(RpcErrno::Unknown, format!("helper thread {} panicked", name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ToRpcErrno;
    use crate::rpc::{RpcCall, RpcOutput};
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_thread_helper_serves_one_client() {
        let dir = tempfile::tempdir().unwrap();
        let helpers = HelperServers::new(ServerConfig::new("main").with_socket_dir(dir.path()));

        helpers.spawn_thread("h1").unwrap();
        let err = helpers.spawn_thread("h1").unwrap_err();
        assert_eq!(err.rpc_errno(), RpcErrno::Exists);

        let mut stream = UnixStream::connect(dir.path().join("h1.sock")).unwrap();
        write_message_blocking(&mut stream, &Request::sync(RpcCall::GetPid)).unwrap();
        let reply: Reply = read_message_blocking(&mut stream).unwrap().unwrap();
        assert_eq!(reply.output, RpcOutput::Pid(std::process::id() as Pid));
        drop(stream);

        helpers.join_thread("h1").unwrap();
        assert_eq!(helpers.join_thread("h1").unwrap_err().rpc_errno(), RpcErrno::NoEntry);
    }
}
