//! Backend runtime: generic dispatcher, built-in services and the multi-server process.

pub mod dispatcher;
pub mod server;
pub mod services;
pub mod supervisor;

pub use dispatcher::{GenericDispatcher, MethodRegistry};
pub use server::{BackendServer, QpsLimiter};
pub use supervisor::BackendSupervisor;
