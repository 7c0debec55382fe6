/*!
 * API Module
 * Unix socket servers, frame transport and configuration
 */

pub mod server;
pub mod traits;
pub mod transport;
pub mod types;

// Re-export for convenience
pub use server::{serve_one, AgentServer, HelperServers};
pub use traits::ServerLifecycle;
pub use transport::{
    read_message, read_message_blocking, write_message, write_message_blocking, TransportError, TransportResult,
};
pub use types::{AgentConfig, ServerConfig};
