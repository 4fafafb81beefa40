//! # Thrift Gateway Library
//!
//! A schema-driven gateway that turns loosely-typed HTTP/JSON requests into generic RPC calls
//! against backend services described by Thrift IDL documents, plus the backend runtime that
//! answers those calls.
//!
//! Request flow: HTTP → [`gateway`] dispatch → [`schema`] codec → [`discovery`] +
//! [`client`] cache → [`shaping`] → [`protocols`] transport → [`backend`] dispatcher, and back.

/// Core functionality including error types, configuration, and basic data structures
pub mod core;

/// IDL parsing, per-service codecs and schema loading
pub mod schema;

/// Service discovery: Nacos naming API, in-memory registry, snapshot caching
pub mod discovery;

/// Load balancing policies for picking one instance per call
pub mod load_balancing;

/// Outbound generic RPC transport
pub mod protocols;

/// Per-method request validation
pub mod shaping;

/// Load-balanced generic clients and their cache
pub mod client;

/// HTTP surface and the per-request dispatch pipeline
pub mod gateway;

/// Backend generic dispatcher, built-in services and server runtime
pub mod backend;

/// Structured logging setup
pub mod observability;

/// Main error type used throughout the gateway
pub use core::error::{GatewayError, GatewayResult};

/// Configuration roots for the two binaries
pub use core::config::{BackendConfig, GatewayConfig};

pub use gateway::server::GatewayServer;
