//! Local TCP listener that hands each accepted connection off to a fresh
//! tunnel and a [`crate::bridge::BridgeSession`].
//!
//! Lifecycle: binding -> listening -> accepting -> draining -> closed.
//! In `Persistent` mode the acceptor keeps accepting until shutdown;
//! `OneShot` accepts exactly one connection, bridges it, then drains (waits
//! for that single bridge to finish) and stops on its own — used for
//! one-off scp-style invocations where the caller doesn't want a listener
//! lingering after the transfer completes.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bridge::{BridgeOutcome, BridgeSession};
use crate::descriptor::{AcceptorMode, BridgeParams, LocalEndpoint, TunnelDescriptor};
use crate::error::{AppError, AppResult};
use crate::ws_client::WSClient;

/// How many bridges may be open at once. The Open Question in the design
/// around concurrent sessions is resolved conservatively: default to one
/// tunnel at a time, matching how a single ssh/scp/vnc client behaves.
pub const DEFAULT_MAX_CONCURRENT_BRIDGES: usize = 1;

pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    mode: AcceptorMode,
    max_concurrent_bridges: usize,
    descriptor: TunnelDescriptor,
    params: BridgeParams,
    shutdown: watch::Receiver<bool>,
}

impl Acceptor {
    /// Bind the local endpoint. Port-in-use and permission errors are
    /// distinguished so the Supervisor can map them to distinct exit codes.
    pub async fn bind(
        endpoint: LocalEndpoint,
        mode: AcceptorMode,
        max_concurrent_bridges: usize,
        descriptor: TunnelDescriptor,
        params: BridgeParams,
        shutdown: watch::Receiver<bool>,
    ) -> AppResult<Self> {
        let addr = SocketAddr::new(endpoint.bind_addr, endpoint.requested_port);
        let listener = TcpListener::bind(addr).await.map_err(|e| classify_bind_error(addr, &e))?;
        let local_addr = listener.local_addr().map_err(|e| AppError::Internal(e.to_string()))?;
        info!(addr = %local_addr, ?mode, "listening for local connections");

        Ok(Self {
            listener,
            local_addr,
            mode,
            max_concurrent_bridges: max_concurrent_bridges.max(1),
            descriptor,
            params,
            shutdown,
        })
    }

    /// The address actually bound, including the kernel-assigned port when
    /// `requested_port` was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until shutdown (`Persistent`) or until the first
    /// connection has been fully bridged (`OneShot`). Returns the outcomes
    /// of every bridge session that ran, in completion order. A non-transient
    /// accept error (anything but `WouldBlock`/`Interrupted`) ends the loop
    /// and is surfaced as a fatal `Err` rather than retried forever.
    pub async fn run(self) -> AppResult<Vec<BridgeOutcome>> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.max_concurrent_bridges));
        let mut join_set = tokio::task::JoinSet::new();
        let mut outcomes = Vec::new();
        let mut shutdown = self.shutdown.clone();
        let mut accepted_once = false;

        let fatal = loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break None;
                    }
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            accepted_once = true;
                            self.spawn_bridge(stream, peer, &semaphore, &mut join_set);
                            if self.mode == AcceptorMode::OneShot {
                                break None;
                            }
                        }
                        Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted) => {
                            warn!(error = %e, "transient accept error, retrying");
                        }
                        Err(e) => {
                            warn!(error = %e, "fatal accept error, stopping acceptor");
                            break Some(AppError::Internal(format!("accept failed: {e}")));
                        }
                    }
                }

                Some(result) = join_set.join_next(), if !join_set.is_empty() => {
                    if let Ok(outcome) = result {
                        outcomes.push(outcome);
                    }
                }
            }
        };

        // Draining: let in-flight bridges finish before reporting closed.
        while let Some(result) = join_set.join_next().await {
            if let Ok(outcome) = result {
                outcomes.push(outcome);
            }
        }

        if let Some(err) = fatal {
            return Err(err);
        }

        if self.mode == AcceptorMode::OneShot && !accepted_once {
            outcomes.push(BridgeOutcome::Shutdown);
        }

        Ok(outcomes)
    }

    fn spawn_bridge(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        semaphore: &Arc<tokio::sync::Semaphore>,
        join_set: &mut tokio::task::JoinSet<BridgeOutcome>,
    ) {
        let descriptor = self.descriptor.clone();
        let params = self.params;
        let shutdown = self.shutdown.clone();
        let semaphore = semaphore.clone();

        join_set.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return BridgeOutcome::Shutdown,
            };

            info!(%peer, "accepted local connection");
            if let Err(e) = stream.set_nodelay(true) {
                warn!(error = %e, "failed to set TCP_NODELAY on accepted socket");
            }

            let ws = match WSClient::open(&descriptor, params.ws_ping_interval_secs).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%peer, error = %e, "failed to open tunnel for accepted connection");
                    return BridgeOutcome::Error(e);
                }
            };

            BridgeSession::new(stream, ws, params, shutdown).run().await
        });
    }
}

fn classify_bind_error(addr: SocketAddr, e: &std::io::Error) -> AppError {
    match e.kind() {
        std::io::ErrorKind::AddrInUse => AppError::PortInUse(format!("{addr} already in use")),
        std::io::ErrorKind::PermissionDenied => {
            AppError::PermissionDenied(format!("cannot bind {addr}: {e}"))
        }
        _ => AppError::Internal(format!("failed to bind {addr}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_descriptor() -> TunnelDescriptor {
        TunnelDescriptor::new("https://example.invalid", "t1", "dev1", "cfg1", "tok", true)
    }

    #[tokio::test]
    async fn bind_assigns_ephemeral_port_when_requested() {
        let (_tx, rx) = watch::channel(false);
        let endpoint = LocalEndpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let acceptor = Acceptor::bind(
            endpoint,
            AcceptorMode::OneShot,
            DEFAULT_MAX_CONCURRENT_BRIDGES,
            test_descriptor(),
            BridgeParams::default(),
            rx,
        )
        .await
        .unwrap();
        assert_ne!(acceptor.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn bind_reports_port_in_use() {
        let (_tx, rx) = watch::channel(false);
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = held.local_addr().unwrap().port();

        let endpoint = LocalEndpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let err = Acceptor::bind(
            endpoint,
            AcceptorMode::OneShot,
            DEFAULT_MAX_CONCURRENT_BRIDGES,
            test_descriptor(),
            BridgeParams::default(),
            rx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }

    #[tokio::test]
    async fn one_shot_with_no_connection_closes_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let endpoint = LocalEndpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let acceptor = Acceptor::bind(
            endpoint,
            AcceptorMode::OneShot,
            DEFAULT_MAX_CONCURRENT_BRIDGES,
            test_descriptor(),
            BridgeParams::default(),
            rx,
        )
        .await
        .unwrap();

        let handle = tokio::spawn(acceptor.run());
        tx.send(true).unwrap();
        let outcomes = handle.await.unwrap().unwrap();
        assert_eq!(outcomes, vec![BridgeOutcome::Shutdown]);
    }
}
