/*!
 * RPC Module
 * Call records, handler registry, dispatcher and deferred calls
 */

pub mod deferred;
pub mod dispatcher;
pub mod handler;
pub mod handlers;
pub mod types;

// Re-export for convenience
pub use deferred::DeferredJobs;
pub use dispatcher::{execute, Dispatcher};
pub use handler::{CallContext, RpcHandler, RpcHandlerRegistry};
pub use handlers::{default_registry, HelperLauncher};
pub use types::{
    AiocbParams, CallHeader, CallMode, CallOp, IoVec, PollFd, Reply, ReplyHeader, Request, RpcCall, RpcOutput,
};
