//! Inter-client RPC bridge registry.

mod registry;

pub use registry::{RpcRegistry, RPC_CALL_TIMEOUT};
