use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("no server reachable")]
    NoServer,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{op} timed out after {ms}ms")]
    Timeout { op: &'static str, ms: u128 },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error string carried in the rpc response envelope.
    #[error("remote error: {0}")]
    Remote(String),

    /// Logical error returned in a reply's `Message` field.
    #[error("server rejected request: {0}")]
    Rejected(String),
}

impl RpcError {
    /// Whether this error means the sticky connection can no longer be trusted.
    ///
    /// Logical rejections keep the connection; everything else forces reselection.
    pub fn is_transport(&self) -> bool {
        !matches!(self, RpcError::Rejected(_))
    }
}

impl From<rmp_serde::encode::Error> for RpcError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RpcError::Codec(e.to_string())
    }
}

impl From<rmpv::ext::Error> for RpcError {
    fn from(e: rmpv::ext::Error) -> Self {
        RpcError::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rejections_keep_the_connection() {
        assert!(!RpcError::Rejected("no such task".into()).is_transport());
        assert!(RpcError::Remote("rpc: can't find method".into()).is_transport());
        assert!(RpcError::NoServer.is_transport());
        assert!(
            RpcError::Timeout {
                op: "call",
                ms: 5000
            }
            .is_transport()
        );
    }
}
