use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use keyhole_tls::CaPaths;

use crate::errors::ProxyError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Address the CONNECT listener binds to. Port 0 picks an ephemeral port.
    pub bind: SocketAddr,
    pub ca: CaPaths,
    pub max_connect_head_bytes: usize,
    pub max_http_head_bytes: usize,
    /// Grace period for in-flight connections once shutdown starts.
    pub drain_timeout: Duration,
    pub verify_upstream_tls: bool,
    pub request_log_path: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8118"
                .parse()
                .expect("default bind address must parse"),
            ca: CaPaths::new("./keyhole-ca/keyhole-ca.pem", "./keyhole-ca/keyhole-ca-key.pem"),
            max_connect_head_bytes: 64 * 1024,
            max_http_head_bytes: 64 * 1024,
            drain_timeout: Duration::from_secs(5),
            verify_upstream_tls: true,
            request_log_path: None,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.max_connect_head_bytes == 0 {
            return Err(ProxyError::InvalidConfig(
                "max_connect_head_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_http_head_bytes == 0 {
            return Err(ProxyError::InvalidConfig(
                "max_http_head_bytes must be greater than zero".to_string(),
            ));
        }
        if self.drain_timeout.is_zero() {
            return Err(ProxyError::InvalidConfig(
                "drain_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
