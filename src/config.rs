//! Configuration management for Waterline.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Main configuration for the Waterline service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterlineConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Quota configuration
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Mesh configuration
    #[serde(default)]
    pub mesh: MeshConfig,
}

impl Default for WaterlineConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            quota: QuotaConfig::default(),
            mesh: MeshConfig::default(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    "127.0.0.1:8081".parse().unwrap()
}

/// Quota configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// The window length quota is managed for, in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: i64,

    /// Per second rate limit
    #[serde(default = "default_rate_limit")]
    pub rate_limit: i64,

    /// Total quota limit over the window length, 0 disables the check
    #[serde(default = "default_total_limit")]
    pub total_limit: i64,

    /// Time after which idle counters are expired, in seconds
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: i64,

    /// How often accepted usage is broadcast to peers, in seconds
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// How often each counter rolls and expires buckets, in seconds
    #[serde(default = "default_slide_interval_secs")]
    pub slide_interval_secs: u64,

    /// How often idle counters are swept, in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            rate_limit: default_rate_limit(),
            total_limit: default_total_limit(),
            idle_ttl_secs: default_idle_ttl_secs(),
            flush_interval_secs: default_flush_interval_secs(),
            slide_interval_secs: default_slide_interval_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_window_secs() -> i64 {
    3600
}

fn default_rate_limit() -> i64 {
    10
}

fn default_total_limit() -> i64 {
    0
}

fn default_idle_ttl_secs() -> i64 {
    7200
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_slide_interval_secs() -> u64 {
    5
}

fn default_sweep_interval_secs() -> u64 {
    600
}

/// Mesh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// The address to listen on for peer updates
    #[serde(default = "default_mesh_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Peer nodes to broadcast updates to
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_mesh_listen_addr(),
            peers: Vec::new(),
        }
    }
}

fn default_mesh_listen_addr() -> SocketAddr {
    "0.0.0.0:7946".parse().unwrap()
}

impl WaterlineConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WaterlineConfig = serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::WaterlineError::Config(e.to_string()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_service_defaults() {
        let config = WaterlineConfig::default();

        assert_eq!(config.quota.window_secs, 3600);
        assert_eq!(config.quota.rate_limit, 10);
        assert_eq!(config.quota.total_limit, 0);
        assert_eq!(config.quota.idle_ttl_secs, 7200);
        assert_eq!(config.quota.flush_interval_secs, 5);
        assert_eq!(config.quota.sweep_interval_secs, 600);
        assert!(config.mesh.peers.is_empty());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
quota:
  rate_limit: 50
  total_limit: 200
mesh:
  peers:
    - 10.0.0.2:7946
    - 10.0.0.3:7946
"#;
        let config: WaterlineConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.quota.rate_limit, 50);
        assert_eq!(config.quota.total_limit, 200);
        assert_eq!(config.quota.window_secs, 3600);
        assert_eq!(config.mesh.peers.len(), 2);
        assert_eq!(config.server.grpc_addr, "127.0.0.1:8081".parse().unwrap());
    }
}
