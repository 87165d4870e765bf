//! A small key-value configuration set replicated across a cluster of nodes.
//!
//! Each [`Node`] serves `Put`/`Get` over gRPC from its own [`ConfigStore`].
//! There is no coordinator: nodes find each other through the
//! [`membership`] layer, which periodically exchanges the full store with a
//! random peer. A write on one node therefore shows up on the others after a
//! few exchanges.

pub mod client;
mod cluster;
mod config;
mod error;
pub mod membership;
mod node;
mod server;
mod store;

pub use client::ConfigClient;
pub use cluster::Cluster;
pub use config::NodeConfig;
pub use error::{Error, Result};
pub use node::{Node, NodeErrors, NodeState, API_PORT_META_KEY, LEAVE_TIMEOUT};
pub use server::ConfigServer;
pub use store::{ConfigEntry, ConfigStore, NodeMetadata};

/// Generated gRPC types.
pub mod proto {
    pub mod config {
        tonic::include_proto!("config");
    }

    pub mod gossip {
        tonic::include_proto!("gossip");
    }
}
