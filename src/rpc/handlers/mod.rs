/*!
 * RPC Handlers Module
 * Contains all call category handlers
 */

mod aio;
mod composite;
mod dl;
mod io;
mod memory;
mod meta;
mod process;

pub use aio::AioHandler;
pub use composite::CompositeHandler;
pub use dl::DlHandler;
pub use io::IoHandler;
pub use memory::MemoryHandler;
pub use meta::{sizeof_type, HelperLauncher, MetaHandler};
pub use process::ProcessHandler;

use super::handler::RpcHandlerRegistry;
use std::sync::Arc;

/// Registry with every built-in handler
///
/// Without a launcher, helper-server calls report not-supported.
pub fn default_registry(launcher: Option<Arc<dyn HelperLauncher>>) -> RpcHandlerRegistry {
    RpcHandlerRegistry::new()
        .register(Arc::new(IoHandler))
        .register(Arc::new(MemoryHandler::new()))
        .register(Arc::new(AioHandler::new()))
        .register(Arc::new(ProcessHandler))
        .register(Arc::new(CompositeHandler))
        .register(Arc::new(DlHandler::new()))
        .register(Arc::new(MetaHandler::new(launcher)))
}
