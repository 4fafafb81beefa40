//! Load-balanced generic clients and the per-service client cache.

pub mod cache;
pub mod generic;

pub use cache::ClientCache;
pub use generic::GenericClient;
