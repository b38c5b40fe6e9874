//! Batch-execution RPC transport: request encoding, response decoding,
//! bounded retry and one-shot credential refresh.

pub mod client;
pub mod envelope;
pub mod response;
pub mod transport;

pub use envelope::RpcCall;
pub use response::RpcResponse;
pub use transport::{CredentialRefresher, RpcTransport};
