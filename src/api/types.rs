/*!
 * API Types
 * Agent and server configuration
 */

use crate::core::errors::{AgentError, Result};
use crate::core::limits::{
    DEFAULT_DEAD_CHILDREN, DEFAULT_MAX_CONNECTIONS, DEFAULT_SOCKET_DIR_NAME, DL_NAME_ENV, MAX_DEAD_CHILDREN,
};
use crate::monitoring::TRACE_JSON_ENV;
use std::path::PathBuf;

pub const SOCKET_DIR_ENV: &str = "RPC_AGENT_SOCKET_DIR";
pub const MAX_CONNECTIONS_ENV: &str = "RPC_AGENT_MAX_CONNECTIONS";
pub const DEAD_CHILDREN_ENV: &str = "RPC_AGENT_DEAD_CHILDREN";

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Instance name; the socket is `<socket_dir>/<name>.sock`
    pub name: String,
    pub socket_dir: PathBuf,
    pub max_connections: usize,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            socket_dir: std::env::temp_dir().join(DEFAULT_SOCKET_DIR_NAME),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Same directory and limits, different instance name
    pub fn for_helper(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..self.clone()
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", self.name))
    }
}

/// Whole-agent configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub server: ServerConfig,
    /// Library under test announced through the environment
    pub dl_name: Option<String>,
    pub dead_children: usize,
    pub trace_json: bool,
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| AgentError::Configuration(format!("{}={:?} is not a valid value", key, raw))),
        Err(_) => Ok(None),
    }
}

impl AgentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            server: ServerConfig::new(name),
            dl_name: None,
            dead_children: DEFAULT_DEAD_CHILDREN,
            trace_json: false,
        }
    }

    /// Build from the instance name plus `RPC_AGENT_*` / `TARPC_DL_NAME`
    pub fn from_env(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(AgentError::Configuration(format!("invalid instance name {:?}", name)));
        }

        let mut config = Self::new(name);
        if let Ok(dir) = std::env::var(SOCKET_DIR_ENV) {
            config.server.socket_dir = PathBuf::from(dir);
        }
        if let Some(max) = parse_env::<usize>(MAX_CONNECTIONS_ENV)? {
            if max == 0 {
                return Err(AgentError::Configuration(format!("{} must be positive", MAX_CONNECTIONS_ENV)));
            }
            config.server.max_connections = max;
        }
        if let Some(n) = parse_env::<usize>(DEAD_CHILDREN_ENV)? {
            config.dead_children = n.clamp(1, MAX_DEAD_CHILDREN);
        }
        config.dl_name = std::env::var(DL_NAME_ENV).ok().filter(|s| !s.is_empty());
        config.trace_json = std::env::var(TRACE_JSON_ENV)
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false);
        Ok(config)
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.server = self.server.with_socket_dir(dir);
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.server = self.server.with_max_connections(max);
        self
    }

    pub fn with_dead_children(mut self, n: usize) -> Self {
        self.dead_children = n.clamp(1, MAX_DEAD_CHILDREN);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [SOCKET_DIR_ENV, MAX_CONNECTIONS_ENV, DEAD_CHILDREN_ENV, DL_NAME_ENV, TRACE_JSON_ENV] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = AgentConfig::from_env("agt_a").unwrap();
        assert_eq!(config.dead_children, DEFAULT_DEAD_CHILDREN);
        assert_eq!(config.server.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert!(config.server.socket_path().ends_with("rpc-agent/agt_a.sock"));
        assert_eq!(config.dl_name, None);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var(SOCKET_DIR_ENV, "/run/agents");
        std::env::set_var(DEAD_CHILDREN_ENV, "1000000");
        std::env::set_var(MAX_CONNECTIONS_ENV, "8");
        let config = AgentConfig::from_env("agt_b").unwrap();
        assert_eq!(config.server.socket_path(), PathBuf::from("/run/agents/agt_b.sock"));
        assert_eq!(config.dead_children, MAX_DEAD_CHILDREN);
        assert_eq!(config.server.max_connections, 8);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values() {
        clear_env();
        std::env::set_var(MAX_CONNECTIONS_ENV, "many");
        assert!(matches!(AgentConfig::from_env("agt"), Err(AgentError::Configuration(_))));
        clear_env();
        assert!(AgentConfig::from_env("a/b").is_err());
        assert!(AgentConfig::from_env("").is_err());
    }

    #[test]
    fn test_builders() {
        let config = AgentConfig::new("x").with_socket_dir("/tmp/s").with_dead_children(0);
        assert_eq!(config.dead_children, 1);
        assert_eq!(config.server.for_helper("h").socket_path(), PathBuf::from("/tmp/s/h.sock"));
    }
}
