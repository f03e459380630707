//! HTTP server configuration.

use std::net::SocketAddr;

use serde::Deserialize;

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind. Defaults to `127.0.0.1:4100` when unset.
    #[serde(rename = "listen")]
    pub listen_address: Option<SocketAddr>,

    /// Whether identity-path streams get the `data: null` → `data: [DONE]`
    /// sanitizer applied.
    pub sanitize_streams: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            sanitize_streams: true,
        }
    }
}

impl ServerConfig {
    /// The effective bind address.
    pub fn listen_address(&self) -> SocketAddr {
        self.listen_address
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 4100)))
    }
}
