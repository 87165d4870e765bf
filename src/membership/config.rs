use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_GOSSIP_PORT: u16 = 7946;

/// Upper bound for encoded node metadata.
pub const META_MAX_SIZE: usize = 512;

/// Tunables for the membership layer of a single node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Unique name of the node within the cluster.
    pub name: String,

    pub bind_addr: String,
    pub bind_port: u16,

    /// Address peers use to reach this node. Defaults to `bind_addr`.
    pub advertise_addr: Option<String>,
    /// Port peers use to reach this node. Defaults to the bound port.
    pub advertise_port: Option<u16>,

    /// How often a full state exchange with one random peer happens.
    pub push_pull_interval: Duration,

    pub probe_interval: Duration,
    pub probe_timeout: Duration,

    /// How long a suspect member has to refute before it is declared dead.
    pub suspicion_timeout: Duration,

    pub gossip_interval: Duration,
    /// Number of random peers each broadcast is sent to.
    pub gossip_nodes: usize,

    /// Connect and request timeout for push/pull, leave and user messages.
    pub tcp_timeout: Duration,

    pub meta_max_size: usize,
    /// Byte budget handed to the delegate when collecting broadcasts.
    pub gossip_size_limit: usize,
}

impl MembershipConfig {
    /// Timings suited to nodes sharing a LAN or a single host.
    pub fn default_local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bind_addr: "0.0.0.0".to_string(),
            bind_port: DEFAULT_GOSSIP_PORT,
            advertise_addr: None,
            advertise_port: None,
            push_pull_interval: Duration::from_secs(15),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            suspicion_timeout: Duration::from_secs(5),
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            tcp_timeout: Duration::from_secs(2),
            meta_max_size: META_MAX_SIZE,
            gossip_size_limit: 1400,
        }
    }
}
