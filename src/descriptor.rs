//! Data model shared across the core: the resolved tunnel target, the local
//! listen address, and the acceptor's concurrency policy.

use std::fmt;
use std::net::IpAddr;

/// Immutable description of one authenticated WebSocket tunnel, produced by
/// [`crate::resolver`] and consumed by [`crate::ws_client`] and
/// [`crate::bridge`]. Lives for the whole Supervisor run.
#[derive(Clone)]
pub struct TunnelDescriptor {
    /// Normalized base authority, e.g. `https://tenant.cumulocity.com`.
    pub base_host: String,
    pub tenant_id: String,
    pub device_id: String,
    pub configuration_id: String,
    token: String,
    pub verify_tls: bool,
}

impl TunnelDescriptor {
    pub fn new(
        base_host: impl Into<String>,
        tenant_id: impl Into<String>,
        device_id: impl Into<String>,
        configuration_id: impl Into<String>,
        token: impl Into<String>,
        verify_tls: bool,
    ) -> Self {
        Self {
            base_host: base_host.into(),
            tenant_id: tenant_id.into(),
            device_id: device_id.into(),
            configuration_id: configuration_id.into(),
            token: token.into(),
            verify_tls,
        }
    }

    /// The bearer token. Never pass the result of this to a logging macro.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The WebSocket tunnel URL: `wss://host/service/remoteaccess/client/{deviceId}/configurations/{configurationId}`.
    pub fn tunnel_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_host.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_host.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("wss://{}", self.base_host)
        };
        let base = ws_base.trim_end_matches('/');
        format!(
            "{base}/service/remoteaccess/client/{}/configurations/{}",
            self.device_id, self.configuration_id
        )
    }
}

impl fmt::Debug for TunnelDescriptor {
    /// Redacts the token; every other field is safe to log.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelDescriptor")
            .field("base_host", &self.base_host)
            .field("tenant_id", &self.tenant_id)
            .field("device_id", &self.device_id)
            .field("configuration_id", &self.configuration_id)
            .field("token", &"<redacted>")
            .field("verify_tls", &self.verify_tls)
            .finish()
    }
}

/// Local bind address and requested port. Port 0 means kernel-assigned.
#[derive(Debug, Clone, Copy)]
pub struct LocalEndpoint {
    pub bind_addr: IpAddr,
    pub requested_port: u16,
}

impl LocalEndpoint {
    pub fn new(bind_addr: IpAddr, requested_port: u16) -> Self {
        Self {
            bind_addr,
            requested_port,
        }
    }
}

/// Acceptor's lifecycle policy: accept forever, or accept exactly one
/// connection and drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorMode {
    Persistent,
    OneShot,
}

/// Per-bridge tuning, shared by every accepted connection.
#[derive(Debug, Clone, Copy)]
pub struct BridgeParams {
    pub tcp_read_chunk: usize,
    pub tcp_idle_timeout_secs: u64,
    pub ws_ping_interval_secs: u64,
}

pub const TCP_READ_CHUNK_MIN: usize = 1024;
pub const TCP_READ_CHUNK_MAX: usize = 8_290_304;
pub const TCP_READ_CHUNK_DEFAULT: usize = 4096;

impl BridgeParams {
    pub fn new(tcp_read_chunk: usize, tcp_idle_timeout_secs: u64, ws_ping_interval_secs: u64) -> Self {
        Self {
            tcp_read_chunk: tcp_read_chunk.clamp(TCP_READ_CHUNK_MIN, TCP_READ_CHUNK_MAX),
            tcp_idle_timeout_secs,
            ws_ping_interval_secs,
        }
    }
}

impl Default for BridgeParams {
    fn default() -> Self {
        Self {
            tcp_read_chunk: TCP_READ_CHUNK_DEFAULT,
            tcp_idle_timeout_secs: 0,
            ws_ping_interval_secs: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_url_from_https_base() {
        let d = TunnelDescriptor::new("https://tenant.example.com", "t1", "dev1", "cfg1", "tok", true);
        assert_eq!(
            d.tunnel_url(),
            "wss://tenant.example.com/service/remoteaccess/client/dev1/configurations/cfg1"
        );
    }

    #[test]
    fn tunnel_url_from_http_base_downgrades_scheme() {
        let d = TunnelDescriptor::new("http://tenant.example.com", "t1", "dev1", "cfg1", "tok", true);
        assert!(d.tunnel_url().starts_with("ws://"));
    }

    #[test]
    fn debug_redacts_token() {
        let d = TunnelDescriptor::new("https://x", "t", "d", "c", "super-secret-token", true);
        let rendered = format!("{d:?}");
        assert!(!rendered.contains("super-secret-token"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn bridge_params_clamps_tcp_read_chunk() {
        let p = BridgeParams::new(16, 0, 0);
        assert_eq!(p.tcp_read_chunk, TCP_READ_CHUNK_MIN);
        let p = BridgeParams::new(usize::MAX, 0, 0);
        assert_eq!(p.tcp_read_chunk, TCP_READ_CHUNK_MAX);
    }
}
