use crate::dispatch::DispatchConfig;
use crate::pool::PoolOptions;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Problems found by [`ServerConfig::validate`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("site root {0} does not exist or is not a directory")]
    MissingRoot(PathBuf),

    #[error("port must be non-zero")]
    InvalidPort,

    #[error("pool size must be at least 1")]
    InvalidPoolSize,

    #[error("request timeout must be non-zero")]
    InvalidTimeout,
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Site directory on the host; route scripts live below it
    pub root: PathBuf,

    /// Routes directory relative to `root` (default: "routes")
    pub routes_dir: String,

    /// Hostname to bind to (default: "127.0.0.1")
    pub hostname: String,

    /// Port to bind to (default: 8080)
    pub port: u16,

    /// Site version; engines are pooled per filesystem and version
    pub version: String,

    pub pool_size: usize,

    /// Request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Minimum wait for asynchronous responses after the handler returns
    pub async_grace_ms: u64,

    pub session_affinity: bool,

    pub session_ttl_secs: u64,

    /// Maximum request body size in bytes (default: 10MB)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            routes_dir: "routes".to_string(),
            hostname: "127.0.0.1".to_string(),
            port: 8080,
            version: "dev".to_string(),
            pool_size: 3,
            request_timeout_ms: 10_000,
            async_grace_ms: 5_000,
            session_affinity: true,
            session_ttl_secs: 30 * 60,
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.root.is_dir() {
            return Err(ConfigError::MissingRoot(self.root.clone()));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize);
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(())
    }

    /// Absolute virtual path of the routes directory
    pub fn routes_path(&self) -> String {
        crate::fs::vpath::join("/", &self.routes_dir)
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            capacity: self.pool_size,
            session_ttl: (self.session_ttl_secs > 0)
                .then(|| Duration::from_secs(self.session_ttl_secs)),
            ..PoolOptions::default()
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            async_grace: Duration::from_millis(self.async_grace_ms),
            session_affinity: self.session_affinity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.hostname, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_body_size, 10 * 1024 * 1024);
        assert_eq!(config.routes_path(), "/routes");
        assert_eq!(config.pool_options().capacity, 3);
        assert_eq!(config.dispatch_config().async_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_validate() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig {
            root: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Ok(()));

        config.port = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort));

        config.port = 8080;
        config.pool_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPoolSize));

        config.root = dir.path().join("missing");
        assert!(matches!(config.validate(), Err(ConfigError::MissingRoot(_))));
    }
}
