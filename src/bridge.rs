//! Bridges one accepted TCP connection to one open WebSocket tunnel.
//!
//! Two pumps run concurrently under a single `tokio::select!`: uplink
//! (TCP read -> WS send) and downlink (WS recv -> TCP write). Either pump
//! ending, the shutdown signal firing, or the idle-timeout deadline expiring
//! ends the bridge; whichever happens first is the sticky terminal cause
//! reported in [`BridgeOutcome`]. TCP end-of-stream on the uplink side ends
//! the session immediately: the tunnel is sent a WS close (code 1000) and
//! the bridge reports `ClosedByPeer`, mirroring how a real ssh/scp client
//! signals it is done with the connection.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::descriptor::BridgeParams;
use crate::error::AppError;
use crate::ws_client::{Frame, WSClient};

/// Why a bridge ended. The first matching condition sticks: once a cause is
/// recorded the other pump is cancelled, not raced for a "better" reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Local peer closed its TCP side; the tunnel was closed in response.
    /// The clean, expected end of a session.
    ClosedByPeer,
    /// The remote tunnel closed or errored.
    TunnelClosed,
    /// No bytes crossed in either direction within `tcp_idle_timeout_secs`.
    IdleTimeout,
    /// The shared shutdown signal fired (ctrl-c / SIGTERM / one-shot drain).
    Shutdown,
    /// A transport or protocol error on either side.
    Error(AppError),
}

pub struct BridgeSession {
    tcp: TcpStream,
    ws: WSClient,
    params: BridgeParams,
    shutdown: watch::Receiver<bool>,
}

impl BridgeSession {
    pub fn new(tcp: TcpStream, ws: WSClient, params: BridgeParams, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            tcp,
            ws,
            params,
            shutdown,
        }
    }

    /// Run both pumps to completion. Always attempts a graceful WS close
    /// before returning, regardless of outcome.
    pub async fn run(mut self) -> BridgeOutcome {
        let (tcp_read, mut tcp_write) = tokio::io::split(self.tcp);

        let idle_timeout = if self.params.tcp_idle_timeout_secs > 0 {
            Some(Duration::from_secs(self.params.tcp_idle_timeout_secs))
        } else {
            None
        };

        let mut uplink = uplink_pump(tcp_read, self.params.tcp_read_chunk);
        let mut last_activity = Instant::now();

        let outcome = loop {
            let idle_sleep = idle_timeout.map(|d| tokio::time::sleep_until(last_activity + d));

            tokio::select! {
                biased;

                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break BridgeOutcome::Shutdown;
                    }
                }

                uplink_frame = uplink.recv() => {
                    match uplink_frame {
                        Some(Ok(data)) => {
                            last_activity = Instant::now();
                            if let Err(e) = self.ws.send(data).await {
                                break BridgeOutcome::Error(e.into());
                            }
                        }
                        Some(Err(e)) => break BridgeOutcome::Error(AppError::Internal(e.to_string())),
                        None => {
                            debug!("local peer closed write side, closing tunnel");
                            break BridgeOutcome::ClosedByPeer;
                        }
                    }
                }

                downlink_frame = self.ws.recv() => {
                    match downlink_frame {
                        Ok(Frame::Binary(data)) => {
                            last_activity = Instant::now();
                            if let Err(e) = tcp_write.write_all(&data).await {
                                break BridgeOutcome::Error(AppError::Internal(e.to_string()));
                            }
                        }
                        Ok(Frame::Closed) => break BridgeOutcome::TunnelClosed,
                        Err(crate::error::BridgeError::IdleTimeout) => break BridgeOutcome::IdleTimeout,
                        Err(e) => break BridgeOutcome::Error(e.into()),
                    }
                }

                _ = async { if let Some(s) = idle_sleep { s.await } else { std::future::pending::<()>().await } }, if idle_sleep.is_some() => {
                    break BridgeOutcome::IdleTimeout;
                }
            }
        };

        let _ = tcp_write.shutdown().await;

        let (close_code, close_reason) = match &outcome {
            BridgeOutcome::Error(_) => (1011, "internal error"),
            _ => (1000, "bridge ended"),
        };
        self.ws.close(close_code, close_reason).await;

        match &outcome {
            BridgeOutcome::Error(err) => warn!(cause = %err, "bridge ended with error"),
            other => info!(?other, "bridge ended"),
        }

        outcome
    }
}

/// Spawns a task that reads fixed-size chunks from the TCP read half and
/// forwards them on an mpsc channel, so the select loop above never has to
/// hold a `ReadHalf` borrow across branches.
fn uplink_pump(mut read_half: ReadHalf<TcpStream>, chunk_size: usize) -> UplinkHandle {
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    let task = tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(chunk_size);
        loop {
            buf.clear();
            buf.resize(chunk_size, 0);
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    let _ = tx.send(None).await;
                    break;
                }
                Ok(n) => {
                    let data = bytes::Bytes::copy_from_slice(&buf[..n]);
                    if tx.send(Some(Ok(data))).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Some(Err(e))).await;
                    break;
                }
            }
        }
    });
    UplinkHandle { rx, _task: task }
}

struct UplinkHandle {
    rx: tokio::sync::mpsc::Receiver<Option<Result<bytes::Bytes, std::io::Error>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl UplinkHandle {
    /// `Some(Ok(data))` is a chunk, `Some(Err(e))` is a read error,
    /// `None` from the channel itself and `Some(None)` unwrapped both mean
    /// "no more chunks will arrive" (EOF); callers treat both the same way.
    async fn recv(&mut self) -> Option<Result<bytes::Bytes, std::io::Error>> {
        match self.rx.recv().await {
            Some(Some(result)) => Some(result),
            Some(None) | None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_equality_distinguishes_causes() {
        assert_ne!(BridgeOutcome::IdleTimeout, BridgeOutcome::Shutdown);
        assert_eq!(BridgeOutcome::TunnelClosed, BridgeOutcome::TunnelClosed);
    }
}
