pub mod dispatch;
pub mod server;

pub use dispatch::{DispatchOutcome, GatewayDispatcher, Stage};
pub use server::{build_router, GatewayServer, ServerState};
