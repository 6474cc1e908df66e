//! Transport abstraction and the TCP implementation.

use crate::codec::{Frame, FrameCodec};
use crate::error::{NetworkError, NetworkResult, TransportErrorKind};
use crate::message::Rpc;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

/// Request/reply sessions with peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session, or reuse an open one.
    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> NetworkResult<()>;

    /// Send a request and wait for its reply payload.
    async fn emit(
        &self,
        addr: SocketAddr,
        rpc: Rpc,
        payload: Bytes,
        timeout: Duration,
    ) -> NetworkResult<Bytes>;

    /// Close the session, if any.
    async fn disconnect(&self, addr: SocketAddr);

    /// Check that something listens on `addr`; returns the connect time.
    async fn probe(&self, addr: SocketAddr, timeout: Duration) -> NetworkResult<Duration>;
}

/// Transport timeouts.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    pub connect_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_frame_size: crate::codec::MAX_FRAME_SIZE,
        }
    }
}

type Session = Arc<Mutex<Framed<TcpStream, FrameCodec>>>;

/// One framed TCP session per peer; requests on a session are sequential.
pub struct TcpTransport {
    codec: FrameCodec,
    config: TcpTransportConfig,
    sessions: DashMap<SocketAddr, Session>,
}

impl TcpTransport {
    pub fn new(nethash: &str, config: TcpTransportConfig) -> Self {
        Self {
            codec: FrameCodec::for_nethash(nethash).with_max_size(config.max_frame_size),
            config,
            sessions: DashMap::new(),
        }
    }

    async fn session(&self, addr: SocketAddr, timeout: Duration) -> NetworkResult<Session> {
        if let Some(session) = self.sessions.get(&addr) {
            return Ok(session.clone());
        }

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Transport {
                kind: TransportErrorKind::Timeout,
                message: format!("connect to {} timed out", addr),
            })?
            .map_err(|e| NetworkError::Transport {
                kind: TransportErrorKind::Generic,
                message: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        debug!(peer = %addr, "Connected");
        let session = Arc::new(Mutex::new(Framed::new(stream, self.codec.clone())));
        Ok(self.sessions.entry(addr).or_insert(session).clone())
    }

    async fn exchange(session: &Session, rpc: Rpc, payload: Bytes) -> NetworkResult<Bytes> {
        let mut framed = session.lock().await;
        framed.send(Frame::Request { rpc, payload }).await?;

        match framed.next().await {
            Some(Ok(Frame::Reply { rpc: got, payload })) if got == rpc => Ok(payload),
            Some(Ok(Frame::Reply { rpc: got, .. })) => Err(NetworkError::Transport {
                kind: TransportErrorKind::Other,
                message: format!("reply for {} to request {}", got, rpc),
            }),
            Some(Ok(Frame::Error { kind, message })) => {
                Err(NetworkError::Transport { kind, message })
            }
            Some(Ok(Frame::Request { .. })) => Err(NetworkError::Transport {
                kind: TransportErrorKind::Other,
                message: "unexpected request on client session".into(),
            }),
            Some(Err(e)) => Err(e),
            None => Err(NetworkError::Transport {
                kind: TransportErrorKind::Generic,
                message: "connection closed".into(),
            }),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> NetworkResult<()> {
        self.session(addr, timeout.min(self.config.connect_timeout))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, payload), fields(peer = %addr, rpc = %rpc))]
    async fn emit(
        &self,
        addr: SocketAddr,
        rpc: Rpc,
        payload: Bytes,
        timeout: Duration,
    ) -> NetworkResult<Bytes> {
        let session = self
            .session(addr, timeout.min(self.config.connect_timeout))
            .await?;

        let result = match tokio::time::timeout(timeout, Self::exchange(&session, rpc, payload)).await
        {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout(format!("{} to {}", rpc, addr))),
        };

        // A session with an abandoned or failed exchange may hold a stale
        // reply; start over on the next request.
        if result.is_err() {
            self.sessions.remove(&addr);
        }
        result
    }

    async fn disconnect(&self, addr: SocketAddr) {
        if self.sessions.remove(&addr).is_some() {
            debug!(peer = %addr, "Session closed");
        }
    }

    async fn probe(&self, addr: SocketAddr, timeout: Duration) -> NetworkResult<Duration> {
        let started = Instant::now();
        tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout(format!("probe {}", addr)))??;
        Ok(started.elapsed())
    }
}
