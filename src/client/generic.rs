//! # Generic Client
//!
//! A load-balanced client bound to one service descriptor. Calls take raw
//! `serde_json::Value` payloads and are translated through the service's [`Codec`] instead of
//! compiled stubs.
//!
//! One call is: encode, then (inside the call timeout) resolve until a healthy instance
//! exists, select one, send a single request over the transport, and finally decode the reply.
//! Nothing is retried at this layer.

use bytes::Bytes;
use metrics::{counter, histogram};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{RoutingHint, ServiceDescriptor, ServiceInstance};
use crate::discovery::ServiceResolver;
use crate::load_balancing::LoadBalancer;
use crate::protocols::Transport;
use crate::schema::Codec;

pub struct GenericClient {
    descriptor: ServiceDescriptor,
    codec: Arc<Codec>,
    resolver: Arc<dyn ServiceResolver>,
    balancer: Arc<dyn LoadBalancer>,
    transport: Arc<dyn Transport>,
    call_timeout: Duration,
    poll_interval: Duration,
}

impl fmt::Debug for GenericClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericClient")
            .field("descriptor", &self.descriptor)
            .field("balancer", &self.balancer.algorithm_name())
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl GenericClient {
    pub fn new(
        descriptor: ServiceDescriptor,
        codec: Arc<Codec>,
        resolver: Arc<dyn ServiceResolver>,
        balancer: Arc<dyn LoadBalancer>,
        transport: Arc<dyn Transport>,
        call_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            descriptor,
            codec,
            resolver,
            balancer,
            transport,
            call_timeout,
            poll_interval,
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.balancer
    }

    fn service(&self) -> &str {
        &self.descriptor.service_name
    }

    /// Invoke `method` with `payload` and return the decoded reply.
    ///
    /// The payload is encoded before any network I/O, so schema violations never reach a
    /// backend. `cancel` aborts the in-flight call with [`GatewayError::Cancelled`].
    pub async fn call(
        &self,
        method: &str,
        payload: &Value,
        hint: Option<&RoutingHint>,
        cancel: &CancellationToken,
    ) -> GatewayResult<Value> {
        let started = Instant::now();
        let wire = self.codec.encode(method, payload)?;

        let attempt = async {
            let instance = self.wait_for_instance(hint).await?;
            debug!(
                service = %self.service(),
                method = %method,
                instance = %instance.address(),
                "Sending generic call"
            );
            self.transport.call(&instance, method, wire).await
        };

        let outcome: GatewayResult<Bytes> = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GatewayError::Cancelled {
                service: self.service().to_string(),
                method: method.to_string(),
            }),
            result = tokio::time::timeout(self.call_timeout, attempt) => match result {
                Ok(result) => result,
                Err(_) => Err(GatewayError::CallTimeout {
                    service: self.service().to_string(),
                    method: method.to_string(),
                    timeout_ms: self.call_timeout.as_millis() as u64,
                }),
            },
        };

        let result = outcome.and_then(|reply| self.codec.decode(method, &reply));

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.error_type(),
        };
        counter!(
            "generic_calls_total",
            "service" => self.service().to_string(),
            "outcome" => status
        )
        .increment(1);
        histogram!("generic_call_duration_seconds", "service" => self.service().to_string())
            .record(started.elapsed().as_secs_f64());

        if let Err(e) = &result {
            warn!(
                service = %self.service(),
                method = %method,
                error_type = e.error_type(),
                error = %e,
                "Generic call failed"
            );
        }
        result
    }

    /// Resolve until a healthy instance exists, then let the balancer pick one.
    /// Bounded by the caller's timeout; an unknown service fails immediately.
    async fn wait_for_instance(&self, hint: Option<&RoutingHint>) -> GatewayResult<ServiceInstance> {
        loop {
            let set = self.resolver.resolve(self.service()).await?;
            let healthy = set.healthy();
            if let Some(index) = self.balancer.select_instance(&healthy, hint).await {
                return Ok(healthy[index].clone());
            }

            debug!(
                service = %self.service(),
                known_instances = set.len(),
                "No healthy instance yet, polling discovery"
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::InMemoryRegistry;
    use crate::load_balancing::WeightedRoundRobinBalancer;
    use crate::schema::codec_from_source;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    const SCHEMA: &str = r#"
        struct Req { 1: required string Msg }
        struct Resp { 1: string Msg }
        service EchoService { Resp Echo(1: Req req) }
    "#;

    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<(String, String)>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn call(
            &self,
            instance: &ServiceInstance,
            _method: &str,
            payload: Bytes,
        ) -> GatewayResult<Bytes> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let payload = String::from_utf8(payload.to_vec()).unwrap();
            self.calls.lock().push((instance.address(), payload.clone()));
            Ok(Bytes::from(payload))
        }
    }

    fn client(
        registry: Arc<InMemoryRegistry>,
        transport: Arc<RecordingTransport>,
        timeout: Duration,
    ) -> GenericClient {
        let codec = codec_from_source("EchoService", SCHEMA).unwrap();
        GenericClient::new(
            ServiceDescriptor::new("EchoService", "EchoService.thrift"),
            Arc::new(codec),
            registry,
            Arc::new(WeightedRoundRobinBalancer::new()),
            transport,
            timeout,
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_call_round_trip_and_balances() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.add_instance(ServiceInstance::new("EchoService", "127.0.0.1", 1));
        registry.add_instance(ServiceInstance::new("EchoService", "127.0.0.1", 2));
        let transport = Arc::new(RecordingTransport::default());
        let client = client(registry, transport.clone(), Duration::from_secs(1));
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let reply = client
                .call("Echo", &json!({"Msg": "hi", "junk": 1}), None, &cancel)
                .await
                .unwrap();
            assert_eq!(reply, json!({"Msg": "hi"}));
        }

        let calls = transport.calls.lock().clone();
        assert_eq!(calls[0].0, "127.0.0.1:1");
        assert_eq!(calls[1].0, "127.0.0.1:2");
        assert_eq!(calls[0].1, r#"{"Msg":"hi"}"#);
    }

    #[tokio::test]
    async fn test_type_mismatch_never_reaches_transport() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.add_instance(ServiceInstance::new("EchoService", "127.0.0.1", 1));
        let transport = Arc::new(RecordingTransport::default());
        let client = client(registry.clone(), transport.clone(), Duration::from_secs(1));

        let err = client
            .call("Echo", &json!({"Msg": 5}), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::TypeMismatch { .. }));
        assert!(transport.calls.lock().is_empty());
        assert_eq!(registry.lookup_count(), 0);
    }

    #[tokio::test]
    async fn test_waits_for_instances_until_timeout() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.declare_service("EchoService");
        let transport = Arc::new(RecordingTransport::default());
        let client = client(registry, transport, Duration::from_millis(50));

        let err = client
            .call("Echo", &json!({"Msg": "hi"}), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::CallTimeout { timeout_ms: 50, .. }));
    }

    #[tokio::test]
    async fn test_instance_appearing_mid_call_is_used() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.declare_service("EchoService");
        let transport = Arc::new(RecordingTransport::default());
        let client = client(registry.clone(), transport.clone(), Duration::from_secs(2));

        let late = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            late.add_instance(ServiceInstance::new("EchoService", "127.0.0.1", 9));
        });

        client
            .call("Echo", &json!({"Msg": "hi"}), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(transport.calls.lock()[0].0, "127.0.0.1:9");
    }

    #[tokio::test]
    async fn test_cancellation_is_distinct_from_timeout() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.add_instance(ServiceInstance::new("EchoService", "127.0.0.1", 1));
        let transport = Arc::new(RecordingTransport {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let client = client(registry, transport, Duration::from_secs(10));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = client
            .call("Echo", &json!({"Msg": "hi"}), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_unknown_service_fails_immediately() {
        let registry = Arc::new(InMemoryRegistry::new());
        let client = client(
            registry,
            Arc::new(RecordingTransport::default()),
            Duration::from_secs(5),
        );
        let err = client
            .call("Echo", &json!({"Msg": "hi"}), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ServiceUnknown { .. }));
    }
}
