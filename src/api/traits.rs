/*!
 * API Traits
 * Server abstractions
 */

use super::transport::TransportResult;
use super::types::ServerConfig;
use std::future::Future;
use std::pin::Pin;

/// Server lifecycle management
pub trait ServerLifecycle: Send + Sync {
    /// Start the server; resolves when it has stopped
    fn start(&self) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>>;

    /// Ask a running server to stop accepting and return
    fn stop(&self) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>>;

    /// Check if server is running
    fn is_running(&self) -> bool;

    /// Get server configuration
    fn config(&self) -> &ServerConfig;
}
