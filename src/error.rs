//! Typed error hierarchy for the core: one variant per kind in the design's
//! error handling section, each mapped to a process exit code.

use thiserror::Error;

/// Every fallible core operation funnels into this type. Variants carry
/// enough context to log safely; none of them may interpolate a token or
/// other secret (see [`crate::descriptor::TunnelDescriptor`]).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("remote-access configuration not found: {0}")]
    ConfigurationNotFound(String),

    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("tunnel unavailable: {0}")]
    TunnelUnavailable(String),

    #[error("local port in use: {0}")]
    PortInUse(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("idle timeout: no bytes within configured window")]
    IdleTimeout,

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Exit code table (ยง6): 0 ok, 1 generic, 2 usage, 3 auth, 4 device,
    /// 5 port-in-use, 6 tunnel-unavailable, 130 cancelled by signal.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Auth(_) => 3,
            AppError::DeviceNotFound(_) => 4,
            AppError::ConfigurationNotFound(_) | AppError::TenantNotFound(_) => 4,
            AppError::PortInUse(_) => 5,
            AppError::TunnelUnavailable(_) => 6,
            AppError::Cancelled => 130,
            AppError::PermissionDenied(_) => 1,
            AppError::Protocol(_) | AppError::Transport(_) | AppError::IdleTimeout => 1,
            AppError::Internal(_) => 1,
        }
    }
}

/// Narrower error set for Bridge's internal pumps. `IdleTimeout` folds into
/// its own [`crate::bridge::BridgeOutcome`] variant rather than going through
/// this conversion; the rest become a [`crate::bridge::BridgeOutcome::Error`]
/// carrying the [`AppError`] below, so the Supervisor can still tell a dead
/// tunnel (exit code 6) apart from a generic failure (exit code 1).
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("idle timeout")]
    IdleTimeout,

    #[error("cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<BridgeError> for AppError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::Transport(msg) => AppError::TunnelUnavailable(msg),
            BridgeError::Protocol(msg) => AppError::Protocol(msg),
            BridgeError::IdleTimeout => AppError::IdleTimeout,
            BridgeError::Cancelled => AppError::Cancelled,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
