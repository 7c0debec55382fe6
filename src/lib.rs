/*!
 * RPC Agent Library
 * Execution core of a remote test agent exposed as a library
 */

pub mod api;
pub mod composites;
pub mod core;
pub mod iomux;
pub mod monitoring;
pub mod process;
pub mod rpc;
pub mod symbols;

// Re-exports
pub use api::{AgentConfig, AgentServer, HelperServers, ServerConfig, ServerLifecycle};
pub use core::errors::{AgentError, Result, RpcErrno, ToRpcErrno};
pub use core::sockaddr::SockAddr;
pub use iomux::{Flavor, IoEvents, Iomux};
pub use monitoring::init_tracing;
pub use process::{install_reaper, reaper};
pub use rpc::{default_registry, Dispatcher, Reply, Request, RpcCall, RpcOutput};
pub use symbols::{resolver, Primitives};
