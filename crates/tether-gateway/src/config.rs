//! Gateway configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use tether_core::compaction::PruneConfig;
use tether_core::session::SessionLimits;

use crate::router::SelectionPolicy;
use crate::{GatewayError, DEFAULT_HOST, DEFAULT_PORT};

/// Main gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Maximum concurrent links
    pub max_connections: usize,

    /// Session configuration
    pub session: SessionSettings,

    /// Pruning configuration
    pub pruning: PruneConfig,

    /// Which summarizer the pruner gets, if any
    pub summarizer: SummarizerKind,

    /// Node liveness configuration
    pub nodes: NodeSettings,

    /// Command routing configuration
    pub commands: CommandSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_connections: 100,
            session: SessionSettings::default(),
            pruning: PruneConfig::default(),
            summarizer: SummarizerKind::default(),
            nodes: NodeSettings::default(),
            commands: CommandSettings::default(),
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set max connections
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_pruning(mut self, pruning: PruneConfig) -> Self {
        self.pruning = pruning;
        self
    }

    pub fn with_summarizer(mut self, summarizer: SummarizerKind) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_commands(mut self, commands: CommandSettings) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_nodes(mut self, nodes: NodeSettings) -> Self {
        self.nodes = nodes;
        self
    }

    /// Get the socket address
    pub fn socket_addr(&self) -> crate::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| GatewayError::InvalidConfig(format!("bad listen address: {}", e)))
    }

    /// Load configuration from a file. `.toml` files are read as TOML,
    /// everything else as JSON.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = if is_toml(path) {
            toml::from_str(&content).map_err(|e| GatewayError::InvalidConfig(e.to_string()))?
        } else {
            serde_json::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let path = path.as_ref();
        let content = if is_toml(path) {
            toml::to_string_pretty(self).map_err(|e| GatewayError::Serialization(e.to_string()))?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings that cannot work together
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: String| Err(GatewayError::InvalidConfig(msg));

        if self.session.token_budget == 0 {
            return invalid("session.tokenBudget must be positive".into());
        }
        if self.session.target_tokens >= self.session.token_budget {
            return invalid(format!(
                "session.targetTokens ({}) must be below session.tokenBudget ({})",
                self.session.target_tokens, self.session.token_budget
            ));
        }
        if self.session.idle_timeout_ms == 0 || self.session.sweep_interval_ms == 0 {
            return invalid("session timeouts and sweep interval must be positive".into());
        }
        if self.max_connections == 0 {
            return invalid("maxConnections must be positive".into());
        }

        let ratio_ok = |r: f32| r > 0.0 && r <= 1.0;
        if !ratio_ok(self.pruning.warning_threshold) {
            return invalid(format!(
                "pruning.warningThreshold must be in (0, 1], got {}",
                self.pruning.warning_threshold
            ));
        }
        if !ratio_ok(self.pruning.idle_target_ratio) {
            return invalid(format!(
                "pruning.idleTargetRatio must be in (0, 1], got {}",
                self.pruning.idle_target_ratio
            ));
        }
        if self.pruning.summarizer_timeout_ms == 0 {
            return invalid("pruning.summarizerTimeoutMs must be positive".into());
        }

        if self.nodes.heartbeat_timeout_ms == 0 || self.nodes.sweep_interval_ms == 0 {
            return invalid("node heartbeat timeout and sweep interval must be positive".into());
        }
        if self.commands.command_timeout_ms == 0 || self.commands.confirmation_ttl_ms == 0 {
            return invalid("command timeout and confirmation TTL must be positive".into());
        }
        if self.pruning.summarizer_timeout_ms >= self.commands.command_timeout_ms {
            tracing::warn!(
                "Summarizer timeout ({}ms) is not shorter than the command timeout ({}ms)",
                self.pruning.summarizer_timeout_ms,
                self.commands.command_timeout_ms
            );
        }
        if self.commands.confirmation_ttl_ms >= self.commands.command_timeout_ms {
            tracing::warn!(
                "Confirmation TTL ({}ms) is not shorter than the command timeout ({}ms)",
                self.commands.confirmation_ttl_ms,
                self.commands.command_timeout_ms
            );
        }
        Ok(())
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("toml")
}

/// Session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub token_budget: u32,
    pub target_tokens: u32,
    pub idle_timeout_ms: u64,
    /// `None` keeps sessions open until closed explicitly
    pub max_lifetime_ms: Option<u64>,
    pub sweep_interval_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let limits = SessionLimits::default();
        Self {
            token_budget: limits.token_budget,
            target_tokens: limits.target_tokens,
            idle_timeout_ms: limits.idle_timeout_ms,
            max_lifetime_ms: limits.max_lifetime_ms,
            sweep_interval_ms: 30_000,
        }
    }
}

impl SessionSettings {
    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            token_budget: self.token_budget,
            target_tokens: self.target_tokens,
            idle_timeout_ms: self.idle_timeout_ms,
            max_lifetime_ms: self.max_lifetime_ms,
        }
    }
}

/// Summarizer wired into the pruner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarizerKind {
    /// No summarizer; summarize falls back to deletion
    None,
    /// Local extractive summarizer
    #[default]
    Extractive,
}

/// Node liveness settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeSettings {
    pub heartbeat_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 30_000,
            sweep_interval_ms: 5_000,
        }
    }
}

/// Command routing settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandSettings {
    /// Per-attempt acknowledgment timeout
    pub command_timeout_ms: u64,
    /// Re-sends after the first attempt times out
    pub max_retries: u32,
    /// How long a command waits for confirmation; kept below the command timeout
    pub confirmation_ttl_ms: u64,
    pub selection_policy: SelectionPolicy,
    /// Finished commands kept for status lookups
    pub history_limit: usize,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            command_timeout_ms: 10_000,
            max_retries: 2,
            confirmation_ttl_ms: 5_000,
            selection_policy: SelectionPolicy::default(),
            history_limit: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::compaction::PruneStrategy;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, DEFAULT_HOST);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_confirmation_expires_before_command_timeout() {
        let commands = CommandSettings::default();
        assert!(commands.confirmation_ttl_ms < commands.command_timeout_ms);

        // a long TTL is allowed, only warned about
        let mut config = GatewayConfig::default();
        config.commands.confirmation_ttl_ms = config.commands.command_timeout_ms * 6;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = GatewayConfig::new()
            .with_host("0.0.0.0")
            .with_port(8080)
            .with_max_connections(50);

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.socket_addr().unwrap().port(), 8080);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "port": 9000,
            "session": { "tokenBudget": 4000, "targetTokens": 3000 },
            "pruning": { "strategy": "sliding-window" },
            "commands": { "maxRetries": 5, "selectionPolicy": "round_robin" }
        }"#;
        let config: GatewayConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.session.limits().token_budget, 4000);
        assert_eq!(config.pruning.strategy, PruneStrategy::SlidingWindow);
        assert_eq!(config.commands.max_retries, 5);
        assert_eq!(config.commands.selection_policy, SelectionPolicy::RoundRobin);
        assert_eq!(config.nodes, NodeSettings::default());
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let json = r#"{ "pruning": { "strategy": "lru" } }"#;
        assert!(serde_json::from_str::<GatewayConfig>(json).is_err());
    }

    #[test]
    fn test_validate_rejects_target_above_budget() {
        let mut config = GatewayConfig::default();
        config.session.target_tokens = config.session.token_budget;
        assert!(matches!(config.validate(), Err(GatewayError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_bad_ratio() {
        let mut config = GatewayConfig::default();
        config.pruning.warning_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let path = std::env::temp_dir().join(format!("tether-config-{}.toml", uuid::Uuid::new_v4()));
        let config = GatewayConfig::default().with_port(9100);
        config.to_file(&path).unwrap();

        let loaded = GatewayConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }
}
