use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::Deserialize;

/// Top-level fcgxd configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// HTTP listen address.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// FastCGI backend — TCP ("127.0.0.1:9000") or Unix socket
    /// ("unix:///run/php-fpm.sock").
    pub backend: String,

    /// How requests are routed to scripts.
    pub route: RouteConfig,

    /// Clients kept stocked for the backend.
    #[serde(default = "default_pool_scale")]
    pub pool_scale: usize,

    /// Lifetime of a pooled client before it is rebuilt (ms).
    #[serde(default = "default_pool_ttl_ms")]
    pub pool_ttl_ms: u64,

    /// Upper bound on one request's lifetime (ms).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Request-id pool size per client. 0 means the protocol maximum
    /// (65,535).
    #[serde(default)]
    pub max_requests: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum RouteConfig {
    /// Classic document-root hosting: URL paths map to .php files.
    #[serde(rename = "php")]
    Php { doc_root: PathBuf },
    /// Everything goes to one script that routes internally.
    #[serde(rename = "endpoint")]
    Endpoint { script: PathBuf },
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_pool_scale() -> usize {
    8
}

fn default_pool_ttl_ms() -> u64 {
    60_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        self.listen
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid listen address '{}': {}", self.listen, e))?;
        if self.backend.is_empty() {
            return Err(anyhow!("backend must not be empty"));
        }
        if self.pool_scale == 0 {
            return Err(anyhow!("pool_scale must be >= 1"));
        }
        if self.pool_ttl_ms == 0 {
            return Err(anyhow!("pool_ttl_ms must be >= 1"));
        }
        if self.request_timeout_ms == 0 {
            return Err(anyhow!("request_timeout_ms must be >= 1"));
        }
        match &self.route {
            RouteConfig::Php { doc_root } => {
                if doc_root.as_os_str().is_empty() {
                    return Err(anyhow!("route.doc_root must not be empty"));
                }
            }
            RouteConfig::Endpoint { script } => {
                if script.as_os_str().is_empty() {
                    return Err(anyhow!("route.script must not be empty"));
                }
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<GatewayConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: GatewayConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}
