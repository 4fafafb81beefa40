pub mod rpc;

pub use rpc::{RpcConnection, RpcRequest, TcpTransport, Transport};
