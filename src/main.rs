/*!
 * RPC Agent - Main Entry Point
 *
 * Starts one agent instance:
 * - Child reaper with a bounded dead-child table
 * - Helper server launcher for create_process / thread_create
 * - RPC server on `<socket_dir>/<name>.sock`
 *
 * `rpc-agent exec rpc-server <name> --listen-fd N` is the re-exec form used
 * by helper processes created with the exec flag.
 */

use clap::{Parser, Subcommand};
use miette::Report;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use rpc_agent::api::{serve_one, AgentConfig, AgentServer, HelperServers, ServerConfig, ServerLifecycle};
use rpc_agent::rpc::HelperLauncher;
use rpc_agent::{default_registry, init_tracing, install_reaper, AgentError, Dispatcher};

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug)]
#[command(name = "rpc-agent", version, about = "Remote agent executing test RPCs")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Instance name; the server listens on `<socket_dir>/<name>.sock`
    name: Option<String>,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Internal: run in place of a freshly exec'd helper process
    #[command(hide = true)]
    Exec {
        #[command(subcommand)]
        target: ExecTarget,
    },
}

#[derive(Subcommand, Debug)]
enum ExecTarget {
    RpcServer {
        name: String,
        #[arg(long = "listen-fd")]
        listen_fd: RawFd,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let result = match (cli.mode, cli.name) {
        (Some(Mode::Exec { target: ExecTarget::RpcServer { name, listen_fd } }), _) => {
            run_exec_helper(&name, listen_fd)
        }
        (None, Some(name)) => run_agent(&name),
        (None, None) => Err(AgentError::Configuration("instance name is required".into())),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "agent failed");
            eprintln!("{:?}", Report::new(e));
            ExitCode::FAILURE
        }
    }
}

fn launcher(config: ServerConfig) -> Option<Arc<dyn HelperLauncher>> {
    Some(HelperServers::new(config) as Arc<dyn HelperLauncher>)
}

fn run_agent(name: &str) -> Result<(), AgentError> {
    let config = AgentConfig::from_env(name)?;
    install_reaper(config.dead_children)?;

    info!(
        name = %config.server.name,
        dl_name = config.dl_name.as_deref().unwrap_or("<unset>"),
        dead_children = config.dead_children,
        "RPC agent starting"
    );

    let dispatcher = Arc::new(Dispatcher::new(default_registry(launcher(config.server.clone()))));
    let server = Arc::new(AgentServer::new(config.server.clone(), dispatcher));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("rpc-agent")
        .build()
        .map_err(|e| AgentError::Io(format!("cannot start runtime: {}", e)))?;

    runtime.block_on(async move {
        let watcher = Arc::clone(&server);
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            if let Err(e) = watcher.stop().await {
                error!(error = %e, "shutdown failed");
            }
        });
        server.start().await
    })?;

    info!("RPC agent exited");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut int, mut term) = match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(int), Ok(term)) => (int, term),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "cannot watch shutdown signals");
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = int.recv() => info!("SIGINT received"),
        _ = term.recv() => info!("SIGTERM received"),
    }
}

fn run_exec_helper(name: &str, listen_fd: RawFd) -> Result<(), AgentError> {
    if listen_fd < 0 {
        return Err(AgentError::Configuration(format!("invalid listen fd {}", listen_fd)));
    }
    let config = AgentConfig::from_env(name)?;
    install_reaper(config.dead_children)?;

    // SAFETY: the fd was inherited from the parent for exactly this listener
    let listener = unsafe { UnixListener::from_raw_fd(listen_fd) };
    info!(name, listen_fd, "exec'd helper serving");

    let dispatcher = Dispatcher::new(default_registry(launcher(config.server)));
    serve_one(listener, &dispatcher)?;
    Ok(())
}
