//! # Backend RPC Server
//!
//! One listening server per configured port. Each server:
//! - binds its port, then registers `advertise_host:port` with discovery,
//! - keeps the registration alive with heartbeats when the registry needs them,
//! - caps concurrent connections with a semaphore (excess connections wait for a permit),
//! - caps requests per second; excess requests get a 429 status reply,
//! - deregisters when asked to stop.

use futures::{SinkExt, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::dispatcher::{GenericDispatcher, DECODE_ERROR};
use crate::core::config::BackendServerConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{ReplyEnvelope, ServiceInstance};
use crate::discovery::ServiceRegistrar;
use crate::protocols::rpc::{framed, RpcConnection, RpcRequest};

/// Status message of replies rejected by the QPS limit
pub const TOO_MANY_REQUESTS: &str = "too many requests";

/// Fixed one-second window request counter
pub struct QpsLimiter {
    max_qps: u32,
    window: Mutex<(Instant, u32)>,
}

impl QpsLimiter {
    pub fn new(max_qps: u32) -> Self {
        Self {
            max_qps,
            window: Mutex::new((Instant::now(), 0)),
        }
    }

    /// Count one request; false when this second's budget is spent
    pub fn try_acquire(&self) -> bool {
        let mut window = self.window.lock();
        if window.0.elapsed() >= Duration::from_secs(1) {
            *window = (Instant::now(), 0);
        }
        if window.1 >= self.max_qps {
            return false;
        }
        window.1 += 1;
        true
    }
}

pub struct BackendServer {
    config: BackendServerConfig,
    bind_address: String,
    advertise_host: String,
    dispatcher: Arc<GenericDispatcher>,
    registrar: Arc<dyn ServiceRegistrar>,
}

impl BackendServer {
    pub fn new(
        config: BackendServerConfig,
        bind_address: impl Into<String>,
        advertise_host: impl Into<String>,
        dispatcher: Arc<GenericDispatcher>,
        registrar: Arc<dyn ServiceRegistrar>,
    ) -> Self {
        Self {
            config,
            bind_address: bind_address.into(),
            advertise_host: advertise_host.into(),
            dispatcher,
            registrar,
        }
    }

    pub fn service(&self) -> &str {
        &self.config.service
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Bind, register and serve until `shutdown` fires.
    ///
    /// With port 0 the kernel picks a port and that port is registered.
    #[instrument(skip(self, shutdown), fields(service = %self.config.service, port = self.config.port))]
    pub async fn run(self, shutdown: CancellationToken) -> GatewayResult<()> {
        let bind = format!("{}:{}", self.bind_address, self.config.port);
        let listener = TcpListener::bind(&bind).await.map_err(|e| {
            GatewayError::config(format!("Failed to bind {} server to {}: {}", self.config.service, bind, e))
        })?;
        let local_addr = listener.local_addr()?;

        let instance = ServiceInstance::new(
            self.config.service.as_str(),
            self.advertise_host.as_str(),
            local_addr.port(),
        )
        .with_weight(self.config.weight);
        self.registrar.register(&instance).await?;

        info!(
            service = %self.config.service,
            address = %local_addr,
            max_connections = self.config.max_connections,
            max_qps = self.config.max_qps,
            "Backend server listening"
        );

        let heartbeat = self.spawn_heartbeat(&instance, shutdown.clone());
        let result = self.serve(listener, shutdown).await;

        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
        if let Err(e) = self.registrar.deregister(&instance).await {
            warn!(service = %self.config.service, error = %e, "Failed to deregister instance");
        }
        info!(service = %self.config.service, address = %local_addr, "Backend server stopped");
        result
    }

    fn spawn_heartbeat(
        &self,
        instance: &ServiceInstance,
        shutdown: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let period = self.registrar.heartbeat_interval()?;
        let registrar = Arc::clone(&self.registrar);
        let instance = instance.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = interval.tick() => {
                        if let Err(e) = registrar.heartbeat(&instance).await {
                            warn!(service = %instance.service, error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        }))
    }

    async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> GatewayResult<()> {
        let permits = Arc::new(Semaphore::new(self.config.max_connections));
        let limiter = Arc::new(QpsLimiter::new(self.config.max_qps));

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                permit = Arc::clone(&permits).acquire_owned() => permit
                    .map_err(|e| GatewayError::internal(format!("connection limiter closed: {}", e)))?,
            };

            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(service = %self.config.service, error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let dispatcher = Arc::clone(&self.dispatcher);
            let limiter = Arc::clone(&limiter);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = serve_connection(stream, peer, dispatcher, limiter, shutdown).await {
                    debug!(peer = %peer, error = %e, "Connection closed with error");
                }
            });
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<GenericDispatcher>,
    limiter: Arc<QpsLimiter>,
    shutdown: CancellationToken,
) -> GatewayResult<()> {
    stream.set_nodelay(true)?;
    let mut connection: RpcConnection = framed(stream);
    debug!(peer = %peer, service = %dispatcher.service(), "Accepted RPC connection");

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = connection.next() => match frame {
                Some(frame) => frame?,
                None => return Ok(()),
            },
        };

        let reply = if !limiter.try_acquire() {
            counter!("backend_requests_throttled_total").increment(1);
            ReplyEnvelope::error(429, TOO_MANY_REQUESTS, "request rate limit exceeded")
                .to_json()
                .to_string()
        } else {
            match RpcRequest::from_frame(&frame) {
                Ok(request) => {
                    counter!("backend_requests_total", "method" => request.method.clone())
                        .increment(1);
                    let reply = dispatcher.handle(&request.method, &request.payload);
                    if !reply.is_success() {
                        debug!(
                            service = %dispatcher.service(),
                            method = %request.method,
                            status = reply.status_code,
                            "Call answered with failure status"
                        );
                    }
                    reply.to_json().to_string()
                }
                Err(e) => {
                    error!(peer = %peer, error = %e, "Malformed request frame");
                    ReplyEnvelope::error(400, DECODE_ERROR.to_string(), e.to_string())
                        .to_json()
                        .to_string()
                }
            }
        };

        connection.send(bytes::Bytes::from(reply)).await?;
    }
}
