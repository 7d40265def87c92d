//! Top-level orchestration: resolve the tunnel target, bind the local
//! listener, run the accept loop, and react to OS signals.
//!
//! A single `tokio::sync::watch::channel<bool>` is the one shutdown signal
//! in the process; it is created here and handed down through
//! [`crate::acceptor::Acceptor`] to every live
//! [`crate::bridge::BridgeSession`]. Cancellation is idempotent: sending
//! `true` twice, or racing the signal handler against a natural bridge
//! close, never panics or double-reports.

use tokio::sync::watch;
use tracing::{error, info};

use crate::acceptor::Acceptor;
use crate::bridge::BridgeOutcome;
use crate::descriptor::{AcceptorMode, BridgeParams, LocalEndpoint};
use crate::error::AppError;
use crate::resolver::{ResolveInput, Resolver};

/// The outcome of one `Supervisor::run`, already reduced to a process exit
/// code by the caller in `main`.
#[derive(Debug)]
pub enum ExitStatus {
    /// Every bridge that ran ended cleanly, or no connection arrived before
    /// shutdown in `OneShot` mode without error.
    Ok,
    /// Startup or a bridge ended in the given error.
    Failed(AppError),
    /// A signal requested shutdown before anything went wrong.
    Cancelled,
}

pub struct Supervisor {
    resolver: Resolver,
    input: ResolveInput,
    endpoint: LocalEndpoint,
    mode: AcceptorMode,
    max_concurrent_bridges: usize,
    params: BridgeParams,
}

impl Supervisor {
    pub fn new(
        resolver: Resolver,
        input: ResolveInput,
        endpoint: LocalEndpoint,
        mode: AcceptorMode,
        max_concurrent_bridges: usize,
        params: BridgeParams,
    ) -> Self {
        Self {
            resolver,
            input,
            endpoint,
            mode,
            max_concurrent_bridges,
            params,
        }
    }

    /// Resolve, bind, and run to completion. `on_bound` is called once the
    /// local socket is listening, with the actual bound address — the hook
    /// CLI/plugin callers use to learn the ephemeral port before connecting
    /// their own client.
    pub async fn run(self, on_bound: impl FnOnce(std::net::SocketAddr) + Send) -> ExitStatus {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let signal = wait_for_shutdown_signal();
        tokio::pin!(signal);

        let descriptor = tokio::select! {
            biased;
            _ = &mut signal => {
                return ExitStatus::Cancelled;
            }
            result = self.resolver.resolve(self.input) => {
                match result {
                    Ok(d) => d,
                    Err(e) => return ExitStatus::Failed(e),
                }
            }
        };

        let acceptor = match Acceptor::bind(
            self.endpoint,
            self.mode,
            self.max_concurrent_bridges,
            descriptor,
            self.params,
            shutdown_rx,
        )
        .await
        {
            Ok(a) => a,
            Err(e) => return ExitStatus::Failed(e),
        };

        on_bound(acceptor.local_addr());

        let run_future = acceptor.run();
        tokio::pin!(run_future);

        let outcomes = tokio::select! {
            biased;
            _ = &mut signal => {
                let _ = shutdown_tx.send(true);
                run_future.await
            }
            outcomes = &mut run_future => outcomes,
        };

        match outcomes {
            Ok(outcomes) => reduce_outcomes(outcomes),
            Err(e) => ExitStatus::Failed(e),
        }
    }
}

fn reduce_outcomes(outcomes: Vec<BridgeOutcome>) -> ExitStatus {
    for outcome in &outcomes {
        if let BridgeOutcome::Error(err) = outcome {
            error!(cause = %err, "bridge failed");
            return ExitStatus::Failed(err.clone());
        }
    }
    if outcomes.iter().any(|o| matches!(o, BridgeOutcome::Shutdown)) {
        info!("shutdown requested");
        return ExitStatus::Cancelled;
    }
    ExitStatus::Ok
}

/// Waits for ctrl-c, or on Unix, SIGTERM. On other platforms only ctrl-c is
/// observed; the second branch never resolves.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_outcomes_prefers_error_over_shutdown() {
        let outcomes = vec![
            BridgeOutcome::Shutdown,
            BridgeOutcome::Error(AppError::TunnelUnavailable("boom".into())),
        ];
        match reduce_outcomes(outcomes) {
            ExitStatus::Failed(e) => assert_eq!(e.exit_code(), 6),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn reduce_outcomes_ok_when_all_clean() {
        let outcomes = vec![BridgeOutcome::ClosedByPeer, BridgeOutcome::TunnelClosed];
        matches!(reduce_outcomes(outcomes), ExitStatus::Ok);
    }
}
