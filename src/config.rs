//! CLI configuration surface: one `clap::Parser` struct carrying every
//! option in the external-interfaces table, turned into the types
//! [`crate::supervisor::Supervisor`] actually needs by [`Config::into_parts`].
//!
//! Every option accepts a matching `C8Y_*` or `C8YLP_*` environment
//! variable. clap only supports one `env` key per argument, so the dual
//! prefix is reconciled ahead of parsing: [`reconcile_env_prefixes`] copies
//! each unset canonical `C8YLP_*` variable from its `C8Y_*` fallback before
//! `Config::parse` runs, mirroring the "merge into env, then let the arg
//! parser apply its own precedence" idiom used elsewhere in this crate's
//! configuration loading.

use std::net::{IpAddr, Ipv4Addr};

use clap::Parser;

use crate::descriptor::{AcceptorMode, BridgeParams, LocalEndpoint, TCP_READ_CHUNK_DEFAULT};
use crate::error::{AppError, AppResult};
use crate::resolver::{Credentials, ResolveInput};

/// Canonical prefix clap's `env` attributes declare; `C8Y_*` is the legacy
/// fallback reconciled into this one before parsing.
const CANONICAL_PREFIX: &str = "C8YLP_";
const FALLBACK_PREFIX: &str = "C8Y_";

const RECONCILED_VARS: &[&str] = &[
    "HOST",
    "TENANT",
    "TOKEN",
    "EXTERNAL_TYPE",
    "CONFIG",
    "PORT",
    "PING_INTERVAL",
    "TCP_SIZE",
    "TCP_TIMEOUT",
    "IGNORE_SSL_VALIDATE",
    "VERBOSE",
];

/// For each name in [`RECONCILED_VARS`], if `C8YLP_<name>` is unset and
/// `C8Y_<name>` is set, copies the fallback value into the canonical
/// variable. Call this once, before [`Config::parse`].
pub fn reconcile_env_prefixes() {
    for name in RECONCILED_VARS {
        let canonical = format!("{CANONICAL_PREFIX}{name}");
        let fallback = format!("{FALLBACK_PREFIX}{name}");
        if std::env::var_os(&canonical).is_none() {
            if let Some(value) = std::env::var_os(&fallback) {
                std::env::set_var(&canonical, value);
            }
        }
    }
}

#[derive(Parser, Clone)]
#[command(name = "c8ylp", about = "Local TCP bridge to a Cumulocity remote-access tunnel")]
pub struct Config {
    /// Base URL of the remote-access cloud, e.g. https://tenant.cumulocity.com
    #[arg(long, env = "C8YLP_HOST")]
    pub host: String,

    /// Tenant id; when absent the Resolver discovers it from loginOptions.
    #[arg(long, env = "C8YLP_TENANT")]
    pub tenant: Option<String>,

    /// Bearer token; bypasses the interactive login flow entirely.
    #[arg(long, env = "C8YLP_TOKEN")]
    pub token: String,

    /// External identity namespace used for the device lookup.
    #[arg(long = "external-type", env = "C8YLP_EXTERNAL_TYPE", default_value_t = ResolveInput::default_external_type())]
    pub external_type: String,

    /// The device's external id within `external_type`'s namespace.
    #[arg(long = "device")]
    pub device: String,

    /// Remote-access configuration name to bridge.
    #[arg(long = "config", env = "C8YLP_CONFIG", default_value_t = ResolveInput::default_configuration_name())]
    pub configuration_name: String,

    /// Local bind port; 0 requests an ephemeral port from the kernel.
    #[arg(long, env = "C8YLP_PORT", default_value_t = 0)]
    pub port: u16,

    /// WS keepalive ping interval in seconds; 0 disables pings.
    #[arg(long = "ping-interval", env = "C8YLP_PING_INTERVAL", default_value_t = 0)]
    pub ping_interval: u64,

    /// Uplink TCP read chunk size in bytes, clamped to [1024, 8290304].
    #[arg(long = "tcp-size", env = "C8YLP_TCP_SIZE", default_value_t = TCP_READ_CHUNK_DEFAULT)]
    pub tcp_size: usize,

    /// Idle deadline in seconds with no bytes in either direction; 0 disables it.
    #[arg(long = "tcp-timeout", env = "C8YLP_TCP_TIMEOUT", default_value_t = 0)]
    pub tcp_timeout: u64,

    /// Disable TLS certificate verification on the tunnel connection.
    #[arg(long = "ignore-ssl-validate", env = "C8YLP_IGNORE_SSL_VALIDATE")]
    pub ignore_ssl_validate: bool,

    /// Raise log verbosity to debug.
    #[arg(long, env = "C8YLP_VERBOSE")]
    pub verbose: bool,

    /// Accept exactly one local connection, bridge it, then exit.
    #[arg(long = "one-shot")]
    pub one_shot: bool,

    /// Local bind address; defaults to loopback.
    #[arg(long = "bind-addr", default_value = "127.0.0.1")]
    pub bind_addr: IpAddr,
}

impl std::fmt::Debug for Config {
    /// Redacts `token`; every other field is safe to log.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("tenant", &self.tenant)
            .field("token", &"<redacted>")
            .field("external_type", &self.external_type)
            .field("device", &self.device)
            .field("configuration_name", &self.configuration_name)
            .field("port", &self.port)
            .field("ping_interval", &self.ping_interval)
            .field("tcp_size", &self.tcp_size)
            .field("tcp_timeout", &self.tcp_timeout)
            .field("ignore_ssl_validate", &self.ignore_ssl_validate)
            .field("verbose", &self.verbose)
            .field("one_shot", &self.one_shot)
            .field("bind_addr", &self.bind_addr)
            .finish()
    }
}

impl Config {
    /// Split this flat CLI struct into the pieces Supervisor actually
    /// needs: the Resolver input, the local endpoint, the acceptor mode,
    /// the per-bridge tuning, and the max-concurrency policy.
    pub fn into_parts(self) -> AppResult<(ResolveInput, LocalEndpoint, AcceptorMode, BridgeParams)> {
        if self.host.trim().is_empty() {
            return Err(AppError::Internal("--host must not be empty".into()));
        }
        if self.token.trim().is_empty() {
            return Err(AppError::Auth("--token must not be empty".into()));
        }

        let input = ResolveInput {
            host: self.host,
            tenant_id: self.tenant,
            credentials: Credentials::Token(self.token),
            external_id: self.device,
            external_type: self.external_type,
            configuration_name: self.configuration_name,
            verify_tls: !self.ignore_ssl_validate,
        };

        let endpoint = LocalEndpoint::new(self.bind_addr, self.port);
        let mode = if self.one_shot {
            AcceptorMode::OneShot
        } else {
            AcceptorMode::Persistent
        };
        let params = BridgeParams::new(self.tcp_size, self.tcp_timeout, self.ping_interval);

        Ok((input, endpoint, mode, params))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::new(),
            tenant: None,
            token: String::new(),
            external_type: ResolveInput::default_external_type(),
            device: String::new(),
            configuration_name: ResolveInput::default_configuration_name(),
            port: 0,
            ping_interval: 0,
            tcp_size: TCP_READ_CHUNK_DEFAULT,
            tcp_timeout: 0,
            ignore_ssl_validate: false,
            verbose: false,
            one_shot: false,
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_parts_rejects_empty_host() {
        let cfg = Config {
            host: "  ".into(),
            token: "tok".into(),
            device: "dev1".into(),
            ..Config::default()
        };
        assert!(cfg.into_parts().is_err());
    }

    #[test]
    fn into_parts_maps_one_shot_to_acceptor_mode() {
        let cfg = Config {
            host: "https://example.com".into(),
            token: "tok".into(),
            device: "dev1".into(),
            one_shot: true,
            ..Config::default()
        };
        let (_, _, mode, _) = cfg.into_parts().unwrap();
        assert_eq!(mode, AcceptorMode::OneShot);
    }

    #[test]
    fn reconcile_env_prefixes_fills_unset_canonical_from_fallback() {
        std::env::remove_var("C8YLP_TENANT");
        std::env::set_var("C8Y_TENANT", "fallback-tenant");
        reconcile_env_prefixes();
        assert_eq!(std::env::var("C8YLP_TENANT").unwrap(), "fallback-tenant");
        std::env::remove_var("C8Y_TENANT");
        std::env::remove_var("C8YLP_TENANT");
    }

    #[test]
    fn reconcile_env_prefixes_leaves_canonical_untouched_when_already_set() {
        std::env::set_var("C8YLP_TENANT", "canonical-wins");
        std::env::set_var("C8Y_TENANT", "fallback-loses");
        reconcile_env_prefixes();
        assert_eq!(std::env::var("C8YLP_TENANT").unwrap(), "canonical-wins");
        std::env::remove_var("C8Y_TENANT");
        std::env::remove_var("C8YLP_TENANT");
    }
}
