/*!
 * Server Module
 * Main agent server and on-demand helper servers
 */

pub(crate) mod agent_server;
pub mod helper;

pub use agent_server::AgentServer;
pub use helper::{serve_one, HelperServers};
