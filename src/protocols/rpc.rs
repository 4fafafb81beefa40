//! # Generic RPC Transport
//!
//! Wire protocol shared by the gateway's outbound client and the backend servers.
//!
//! Every exchange is one request frame followed by one reply frame over TCP. Frames are
//! length-delimited (4-byte big-endian length prefix):
//!
//! - request: JSON `{"method": "<name>", "payload": "<encoded argument JSON>"}`
//! - reply: the raw reply payload bytes
//!
//! Connections are kept per backend address and reused sequentially. A request frame is
//! written at most once; a failure after the write is reported, never resent.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{FutureExt, SinkExt, StreamExt};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ServiceInstance;

/// Upper bound on a single frame in either direction
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Idle connections kept per backend address
const MAX_IDLE_PER_ADDRESS: usize = 16;

pub type RpcConnection = Framed<TcpStream, LengthDelimitedCodec>;

/// Build the frame codec used on both ends of a connection
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Wrap an accepted or connected socket into a framed RPC connection
pub fn framed(stream: TcpStream) -> RpcConnection {
    Framed::new(stream, frame_codec())
}

/// Request frame body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub payload: String,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            payload: payload.into(),
        }
    }

    pub fn to_frame(&self) -> GatewayResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_frame(frame: &[u8]) -> GatewayResult<Self> {
        serde_json::from_slice(frame)
            .map_err(|e| GatewayError::invalid_request(format!("malformed request frame: {}", e)))
    }
}

/// Outbound call to one backend instance
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `payload` for `method` to `instance` and return the raw reply bytes
    async fn call(
        &self,
        instance: &ServiceInstance,
        method: &str,
        payload: Bytes,
    ) -> GatewayResult<Bytes>;
}

/// TCP transport with per-address connection reuse
pub struct TcpTransport {
    connect_timeout: Duration,
    idle: DashMap<String, Vec<RpcConnection>>,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            idle: DashMap::new(),
        }
    }

    fn refused(instance: &ServiceInstance, reason: impl Into<String>) -> GatewayError {
        GatewayError::ConnectionRefused {
            service: instance.service.clone(),
            address: instance.address(),
            reason: reason.into(),
        }
    }

    async fn connect(&self, instance: &ServiceInstance) -> GatewayResult<RpcConnection> {
        let address = instance.address();
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| Self::refused(instance, "connect timed out"))?
            .map_err(|e| Self::refused(instance, e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Self::refused(instance, e.to_string()))?;

        counter!("rpc_connections_opened_total").increment(1);
        debug!(instance = %address, "Opened RPC connection");
        Ok(framed(stream))
    }

    /// Pop an idle connection the peer has not closed
    fn checkout(&self, address: &str) -> Option<RpcConnection> {
        let mut idle = self.idle.get_mut(address)?;
        while let Some(mut connection) = idle.pop() {
            // An idle connection with anything to read is either closed or out of sync
            if connection.next().now_or_never().is_none() {
                return Some(connection);
            }
            debug!(instance = %address, "Discarding stale pooled RPC connection");
        }
        None
    }

    fn checkin(&self, address: String, connection: RpcConnection) {
        let mut idle = self.idle.entry(address).or_default();
        if idle.len() < MAX_IDLE_PER_ADDRESS {
            idle.push(connection);
        }
    }

    async fn send(
        instance: &ServiceInstance,
        connection: &mut RpcConnection,
        frame: Bytes,
    ) -> GatewayResult<()> {
        connection
            .send(frame)
            .await
            .map_err(|e| Self::refused(instance, format!("send failed: {}", e)))
    }

    async fn receive(instance: &ServiceInstance, connection: &mut RpcConnection) -> GatewayResult<Bytes> {
        match connection.next().await {
            Some(Ok(reply)) => Ok(reply.freeze()),
            Some(Err(e)) => Err(Self::refused(instance, format!("receive failed: {}", e))),
            None => Err(Self::refused(instance, "connection closed before reply")),
        }
    }

    /// Deliver `frame` exactly once and wait for its reply.
    ///
    /// Only a pooled connection that fails while sending is replaced; once the frame has been
    /// written the request is never sent again.
    async fn exchange(
        &self,
        instance: &ServiceInstance,
        address: &str,
        frame: Bytes,
    ) -> GatewayResult<(Bytes, RpcConnection)> {
        let mut connection = match self.checkout(address) {
            Some(mut pooled) => match Self::send(instance, &mut pooled, frame.clone()).await {
                Ok(()) => pooled,
                Err(e) => {
                    warn!(instance = %address, error = %e, "Pooled RPC connection failed before send, reconnecting");
                    let mut fresh = self.connect(instance).await?;
                    Self::send(instance, &mut fresh, frame).await?;
                    fresh
                }
            },
            None => {
                let mut fresh = self.connect(instance).await?;
                Self::send(instance, &mut fresh, frame).await?;
                fresh
            }
        };

        let reply = Self::receive(instance, &mut connection).await?;
        Ok((reply, connection))
    }

    /// Number of idle connections currently held for `address`
    pub fn idle_connections(&self, address: &str) -> usize {
        self.idle.get(address).map(|idle| idle.len()).unwrap_or(0)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(
        &self,
        instance: &ServiceInstance,
        method: &str,
        payload: Bytes,
    ) -> GatewayResult<Bytes> {
        let started = Instant::now();
        let address = instance.address();
        let payload = String::from_utf8(payload.to_vec()).map_err(|e| {
            GatewayError::internal(format!("encoded payload is not UTF-8: {}", e))
        })?;
        let frame = RpcRequest::new(method, payload).to_frame()?;

        let reply = self.exchange(instance, &address, frame).await;

        match reply {
            Ok((reply, connection)) => {
                self.checkin(address, connection);
                histogram!("rpc_call_duration_seconds").record(started.elapsed().as_secs_f64());
                Ok(reply)
            }
            Err(e) => {
                counter!("rpc_transport_errors_total").increment(1);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn echo_server() -> (u16, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut connection = framed(stream);
                    while let Some(Ok(frame)) = connection.next().await {
                        let request = RpcRequest::from_frame(&frame).unwrap();
                        let reply = format!("{}|{}", request.method, request.payload);
                        if connection.send(Bytes::from(reply)).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        (port, handle)
    }

    /// Server that counts every request frame and answers only the first `replies` frames
    /// on each connection before dropping it
    async fn flaky_server(replies: usize) -> (u16, Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let frames = Arc::new(AtomicUsize::new(0));
        let counted = frames.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let counted = counted.clone();
                tokio::spawn(async move {
                    let mut connection = framed(stream);
                    let mut answered = 0;
                    while let Some(Ok(_)) = connection.next().await {
                        counted.fetch_add(1, Ordering::SeqCst);
                        if answered == replies {
                            return;
                        }
                        answered += 1;
                        if connection.send(Bytes::from_static(b"ok")).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        (port, frames, handle)
    }

    #[test]
    fn test_request_frame_round_trip() {
        let request = RpcRequest::new("SendClientData", r#"{"Msg":"hi"}"#);
        let frame = request.to_frame().unwrap();
        assert_eq!(RpcRequest::from_frame(&frame).unwrap(), request);
        assert!(RpcRequest::from_frame(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_call_reuses_connection() {
        let (port, server) = echo_server().await;
        let transport = TcpTransport::default();
        let instance = ServiceInstance::new("TravelService", "127.0.0.1", port);

        let reply = transport
            .call(&instance, "Ping", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(&reply[..], b"Ping|{}");
        assert_eq!(transport.idle_connections(&instance.address()), 1);

        let reply = transport
            .call(&instance, "Again", Bytes::from_static(b"[]"))
            .await
            .unwrap();
        assert_eq!(&reply[..], b"Again|[]");
        assert_eq!(transport.idle_connections(&instance.address()), 1);

        server.abort();
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = TcpTransport::default();
        let instance = ServiceInstance::new("TravelService", "127.0.0.1", port);
        let err = transport
            .call(&instance, "Ping", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionRefused { .. }));
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_delivered_request_is_not_resent() {
        let (port, frames, server) = flaky_server(1).await;
        let transport = TcpTransport::default();
        let instance = ServiceInstance::new("ReviewService", "127.0.0.1", port);

        transport
            .call(&instance, "uploadReview", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(transport.idle_connections(&instance.address()), 1);

        // The pooled connection accepts the second frame, then closes without a reply
        let err = transport
            .call(&instance, "uploadReview", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionRefused { .. }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(frames.load(Ordering::SeqCst), 2);
        assert_eq!(transport.idle_connections(&instance.address()), 0);

        server.abort();
    }

    #[tokio::test]
    async fn test_closed_idle_connection_is_replaced() {
        let (port, frames, server) = flaky_server(1).await;
        let transport = TcpTransport::default();
        let instance = ServiceInstance::new("TravelService", "127.0.0.1", port);

        transport
            .call(&instance, "Ping", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        // Wait for the server to consume a stray frame and close the pooled connection
        {
            let mut idle = transport.idle.get_mut(&instance.address()).unwrap();
            let connection = idle.last_mut().unwrap();
            connection.send(Bytes::from_static(b"{}")).await.unwrap();
        }
        for _ in 0..50 {
            if frames.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reply = transport
            .call(&instance, "Ping", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(&reply[..], b"ok");
        assert_eq!(frames.load(Ordering::SeqCst), 3);

        server.abort();
    }
}
