//! WebSocket client specialized for binary, authenticated tunnels.
//!
//! Built on `tokio-tungstenite` over a `tokio_rustls` connector: TCP connect
//! with a bounded timeout, `client_async_tls_with_config` with an explicit
//! `WebSocketConfig`, then split into a dedicated writer task (fed by an
//! `mpsc` channel so `send`/`ping`/`close` never contend for the sink) and a
//! reader driven directly by [`WSClient::recv`]. Bridge guarantees exactly
//! one sender and one receiver; this type is not safe for concurrent `send`.

use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::descriptor::TunnelDescriptor;
use crate::error::{AppError, AppResult, BridgeError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const CLOSE_GRACE: Duration = Duration::from_secs(5);
const MAX_FRAME_SIZE: usize = 64 << 20;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One outcome of [`WSClient::recv`].
pub enum Frame {
    Binary(Bytes),
    Closed,
}

/// An open, authenticated binary WebSocket tunnel.
pub struct WSClient {
    read: SplitStream<WsStream>,
    write_tx: mpsc::Sender<WriterCmd>,
    writer_handle: JoinHandle<()>,
    ping_interval: Duration,
    last_ping_sent: Option<Instant>,
    pong_seen_since_ping: bool,
    missed_pongs: u32,
    closing: bool,
}

enum WriterCmd {
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseFrame>),
}

impl WSClient {
    /// Perform the HTTPS-upgrade handshake against the tunnel URL in
    /// `descriptor`, carrying `Authorization: Bearer <token>` and
    /// negotiating no subprotocol beyond the gateway's binary frame stream.
    pub async fn open(descriptor: &TunnelDescriptor, ping_interval_secs: u64) -> AppResult<Self> {
        let url = descriptor.tunnel_url();
        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|e| AppError::Protocol(format!("invalid tunnel URL {url}: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", descriptor.token())
                .parse()
                .map_err(|e| AppError::Protocol(format!("invalid token header: {e}")))?,
        );

        let uri: http::Uri = url
            .parse()
            .map_err(|e| AppError::Protocol(format!("invalid tunnel URL {url}: {e}")))?;
        let host = uri
            .host()
            .ok_or_else(|| AppError::Protocol("missing host in tunnel URL".into()))?
            .to_string();
        let is_tls = uri.scheme_str() == Some("wss");
        let port = uri.port_u16().unwrap_or(if is_tls { 443 } else { 80 });

        let tcp_stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| AppError::TunnelUnavailable(format!("TCP connect to {host}:{port} timed out")))?
            .map_err(|e| AppError::TunnelUnavailable(format!("TCP connect to {host}:{port} failed: {e}")))?;

        let connector = if is_tls {
            Some(Connector::Rustls(crate::tls::build_client_config(descriptor.verify_tls)))
        } else {
            None
        };

        let ws_config = WebSocketConfig {
            max_frame_size: Some(MAX_FRAME_SIZE),
            max_message_size: Some(MAX_FRAME_SIZE),
            ..Default::default()
        };

        let (ws_stream, response) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::client_async_tls_with_config(request, tcp_stream, Some(ws_config), connector),
        )
        .await
        .map_err(|_| AppError::TunnelUnavailable("WebSocket handshake timed out".into()))?
        .map_err(|e| classify_handshake_error(e))?;

        debug!(url = %url, status = ?response.status(), "tunnel WebSocket open");

        let (sink, read) = ws_stream.split();
        let (write_tx, write_rx) = mpsc::channel::<WriterCmd>(32);
        let writer_handle = spawn_writer(sink, write_rx);

        Ok(Self {
            read,
            write_tx,
            writer_handle,
            ping_interval: Duration::from_secs(ping_interval_secs),
            last_ping_sent: None,
            pong_seen_since_ping: true,
            missed_pongs: 0,
            closing: false,
        })
    }

    /// Produce the next frame of the lazy sequence. Text and pong frames are
    /// handled transparently; a received close ends the sequence cleanly
    /// (`Ok(Frame::Closed)`); any other error ends it with the relevant
    /// error kind. Also drives the ping timer configured at `open()`.
    pub async fn recv(&mut self) -> Result<Frame, BridgeError> {
        loop {
            let sleep = if self.ping_interval.is_zero() {
                None
            } else {
                let next = self
                    .last_ping_sent
                    .map(|t| t + self.ping_interval)
                    .unwrap_or_else(|| Instant::now() + self.ping_interval);
                Some(tokio::time::sleep_until(next))
            };

            tokio::select! {
                biased;

                msg = self.read.next() => {
                    let Some(msg) = msg else {
                        return Ok(Frame::Closed);
                    };
                    let msg = msg.map_err(|e| BridgeError::Transport(e.to_string()))?;
                    match msg {
                        Message::Binary(data) => return Ok(Frame::Binary(Bytes::from(data))),
                        Message::Text(_) => {
                            return Err(BridgeError::Protocol("unexpected text frame in binary tunnel".into()));
                        }
                        Message::Ping(payload) => {
                            let _ = self.send_pong(payload).await;
                        }
                        Message::Pong(_) => {
                            self.pong_seen_since_ping = true;
                            self.missed_pongs = 0;
                        }
                        Message::Close(_) => return Ok(Frame::Closed),
                        Message::Frame(_) => {}
                    }
                }

                _ = async { if let Some(s) = sleep { s.await } else { std::future::pending::<()>().await } }, if sleep.is_some() => {
                    if let Some(last) = self.last_ping_sent {
                        let _ = last;
                        if !self.pong_seen_since_ping {
                            self.missed_pongs += 1;
                            if self.missed_pongs >= 2 {
                                return Err(BridgeError::Transport("missing pong for two consecutive ping intervals".into()));
                            }
                        } else {
                            self.missed_pongs = 0;
                        }
                    }
                    self.last_ping_sent = Some(Instant::now());
                    self.pong_seen_since_ping = false;
                    if self.write_tx.send(WriterCmd::Ping(Bytes::new())).await.is_err() {
                        return Err(BridgeError::Transport("writer task closed".into()));
                    }
                }
            }
        }
    }

    async fn send_pong(&self, payload: Vec<u8>) -> Result<(), BridgeError> {
        self.write_tx
            .send(WriterCmd::Pong(Bytes::from(payload)))
            .await
            .map_err(|_| BridgeError::Transport("writer task closed".into()))
    }

    /// Enqueue one binary frame. Returns once handed to the writer task —
    /// not once the peer acknowledges it. Never splits the payload across
    /// multiple frames.
    pub async fn send(&self, bytes: Bytes) -> Result<(), BridgeError> {
        self.write_tx
            .send(WriterCmd::Binary(bytes))
            .await
            .map_err(|_| BridgeError::Transport("writer task closed".into()))
    }

    /// Idempotent: writes a close frame if still open, waits for peer close
    /// up to a bounded grace, then shuts the transport.
    pub async fn close(&mut self, code: u16, reason: &str) {
        if self.closing {
            return;
        }
        self.closing = true;

        let frame = CloseFrame {
            code: code.into(),
            reason: reason.to_string().into(),
        };
        let _ = self.write_tx.send(WriterCmd::Close(Some(frame))).await;

        let _ = tokio::time::timeout(CLOSE_GRACE, async {
            while let Some(Ok(msg)) = self.read.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
        })
        .await;

        self.writer_handle.abort();
    }
}

fn spawn_writer(
    mut sink: futures_util::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<WriterCmd>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            let result = match cmd {
                WriterCmd::Binary(data) => sink.send(Message::Binary(data.to_vec())).await,
                WriterCmd::Ping(payload) => sink.send(Message::Ping(payload.to_vec())).await,
                WriterCmd::Pong(payload) => sink.send(Message::Pong(payload.to_vec())).await,
                WriterCmd::Close(frame) => sink.send(Message::Close(frame)).await,
            };
            if let Err(e) = result {
                warn!(error = %e, "tunnel writer task failed");
                break;
            }
        }
        let _ = sink.close().await;
    })
}

fn classify_handshake_error(e: tokio_tungstenite::tungstenite::Error) -> AppError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match &e {
        WsError::Http(resp) => match resp.status().as_u16() {
            401 | 403 => AppError::Auth(format!("tunnel handshake rejected: {}", resp.status())),
            404 => AppError::DeviceNotFound("tunnel endpoint not found".into()),
            502 | 503 | 504 => AppError::TunnelUnavailable(format!("gateway returned {}", resp.status())),
            _ => AppError::TunnelUnavailable(format!("handshake failed: HTTP {}", resp.status())),
        },
        WsError::Io(_) | WsError::ConnectionClosed | WsError::AlreadyClosed => {
            AppError::TunnelUnavailable(format!("handshake failed: {e}"))
        }
        _ => AppError::Protocol(format!("handshake failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn spawn_mock_gateway() -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut received = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(data) => {
                        received.extend_from_slice(&data);
                        let _ = ws.send(Message::Binary(data)).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            received
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn open_send_recv_roundtrip() {
        let (addr, gateway) = spawn_mock_gateway().await;
        let descriptor = TunnelDescriptor::new(
            format!("http://{addr}"),
            "t1",
            "dev1",
            "cfg1",
            "tok",
            true,
        );

        let mut client = WSClient::open(&descriptor, 0).await.unwrap();
        client.send(Bytes::from_static(b"PING\n")).await.unwrap();

        let frame = client.recv().await.unwrap();
        match frame {
            Frame::Binary(data) => assert_eq!(&data[..], b"PING\n"),
            Frame::Closed => panic!("expected data frame"),
        }

        client.close(1000, "done").await;
        let _ = gateway.await;
    }
}
