use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        source: std::io::Error,
    },

    #[error("Invalid address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Remote call failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("Unable to encode {what}: {source}")]
    Encode {
        what: &'static str,
        source: bincode::Error,
    },

    #[error("Unable to decode {what}: {source}")]
    Decode {
        what: &'static str,
        source: bincode::Error,
    },

    #[error("Node metadata is {size} bytes, over the {limit} byte limit")]
    MetadataTooLarge { size: usize, limit: usize },

    #[error("Failed to join cluster via {addrs:?}: {reason}")]
    JoinFailed { addrs: Vec<String>, reason: String },

    #[error("Timed out after {0:?} waiting for the cluster to acknowledge leave")]
    LeaveTimeout(Duration),

    #[error("Gossip exchange aborted: {0}")]
    ExchangeAborted(String),

    #[error("Membership has been shut down")]
    MembershipShutdown,

    #[error("Node {node} failed: {source}")]
    NodeFailed {
        node: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Encode and decode failures of gossip payloads are escalated to the
    /// supervisor instead of being contained to a single exchange.
    pub fn is_codec(&self) -> bool {
        matches!(
            self,
            Error::Encode { .. } | Error::Decode { .. } | Error::MetadataTooLarge { .. }
        )
    }
}
