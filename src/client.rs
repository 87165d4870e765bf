use crate::proto::config::config_service_client::ConfigServiceClient;
use crate::proto::config::{GetConfigRequest, PutConfigRequest};
use crate::store::ConfigEntry;
use crate::Result;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use tonic::transport::Channel;

/// Actions that can be performed by the client against a single node.
#[derive(Debug, Subcommand, Serialize, Deserialize)]
pub enum Action {
    /// Write a configuration property.
    Put { key: String, value: String },

    /// Read a configuration property from the node.
    Get { key: String },

    /// Poll the node until a property holds the expected value.
    Watch {
        key: String,
        value: String,

        /// Seconds between polls.
        #[clap(long, default_value = "3")]
        interval_secs: u64,

        /// Give up after this many seconds.
        #[clap(long)]
        timeout_secs: Option<u64>,
    },
}

/// Client for the configuration API of one node.
#[derive(Debug, Clone)]
pub struct ConfigClient {
    inner: ConfigServiceClient<Channel>,
}

impl ConfigClient {
    /// Connect to a node's API. Accepts `host:port` or a full `http://` URI.
    pub async fn connect(addr: impl AsRef<str>) -> Result<Self> {
        let addr = addr.as_ref();
        let uri = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };
        let inner = ConfigServiceClient::connect(uri).await?;
        Ok(Self { inner })
    }

    pub async fn put(&mut self, key: String, value: String) -> Result<ConfigEntry> {
        let response = self
            .inner
            .put(PutConfigRequest { key, value })
            .await?
            .into_inner();
        Ok(response.into())
    }

    pub async fn get(&mut self, key: String) -> Result<ConfigEntry> {
        let response = self.inner.get(GetConfigRequest { key }).await?.into_inner();
        Ok(response.into())
    }
}
