//! Client side of the job-server protocol.
//!
//! - [`MsgpackConn`]: msgpack-rpc framing over any byte stream.
//! - [`RpcClient`]: latency-probing, sticky, self-healing client over a list of replicas.
//! - [`JobServer`]: the typed surface the rest of the agent depends on.
mod error;
pub use error::RpcError;

mod codec;
pub use codec::{MsgpackConn, REQUEST, RESPONSE};

mod client;
pub use client::{ClientOptions, RpcClient};

mod api;
pub use api::{JobServer, fetch_task_meta};

/// Remote method names.
pub mod method {
    pub const PING: &str = "Server.Ping";
    pub const REPORT: &str = "Server.Report";
    pub const GET_TASK_META: &str = "Server.GetTaskMeta";
}
