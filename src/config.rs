use crate::membership::MembershipConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Everything needed to build a [`crate::Node`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique name of the node within the cluster.
    pub name: String,

    /// Address both the API and gossip listeners bind to.
    pub addr: String,
    pub api_port: u16,
    pub gossip_port: u16,

    /// `host:port` gossip address of any existing member; `None` when this
    /// is the first node of the cluster.
    pub cluster_node_addr: Option<String>,

    pub membership: MembershipConfig,
}

impl NodeConfig {
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        api_port: u16,
        gossip_port: u16,
        cluster_node_addr: Option<String>,
    ) -> Self {
        let name = name.into();
        let addr = addr.into();

        let mut membership = MembershipConfig::default_local(name.clone());
        membership.bind_addr = addr.clone();
        membership.bind_port = gossip_port;
        membership.advertise_port = Some(gossip_port);

        Self {
            name,
            addr,
            api_port,
            gossip_port,
            // An empty seed address means "first node", same as none at all.
            cluster_node_addr: cluster_node_addr.filter(|a| !a.is_empty()),
            membership,
        }
    }

    pub fn with_push_pull_interval(mut self, interval: Duration) -> Self {
        self.membership.push_pull_interval = interval;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.membership.probe_interval = interval;
        self
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.addr, self.api_port)
    }

    pub fn gossip_addr(&self) -> String {
        format!("{}:{}", self.addr, self.gossip_port)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn membership_follows_node_identity() {
        let config = NodeConfig::new("node2", "127.0.0.1", 9001, 7901, Some("".to_string()));

        assert_eq!(config.cluster_node_addr, None);
        assert_eq!(config.membership.name, "node2");
        assert_eq!(config.membership.bind_addr, "127.0.0.1");
        assert_eq!(config.membership.bind_port, 7901);
        assert_eq!(config.api_addr(), "127.0.0.1:9001");
        assert_eq!(config.gossip_addr(), "127.0.0.1:7901");
    }
}
