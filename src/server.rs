use crate::proto::config::{
    config_service_server::{ConfigService, ConfigServiceServer},
    Config, GetConfigRequest, PutConfigRequest,
};
use crate::store::ConfigEntry;
use crate::Node;

/// gRPC front end of a [`Node`]. Each request is handled on its own task and
/// goes straight to the node's local store.
#[derive(Clone)]
pub struct ConfigServer {
    node: Node,
}

impl ConfigServer {
    pub fn new(node: Node) -> Self {
        Self { node }
    }

    pub fn into_service(self) -> ConfigServiceServer<Self> {
        ConfigServiceServer::new(self)
    }
}

impl From<ConfigEntry> for Config {
    fn from(entry: ConfigEntry) -> Self {
        Config {
            key: entry.key,
            value: entry.value,
        }
    }
}

impl From<Config> for ConfigEntry {
    fn from(config: Config) -> Self {
        ConfigEntry {
            key: config.key,
            value: config.value,
        }
    }
}

#[tonic::async_trait]
impl ConfigService for ConfigServer {
    async fn put(
        &self,
        req: tonic::Request<PutConfigRequest>,
    ) -> tonic::Result<tonic::Response<Config>, tonic::Status> {
        let req = req.into_inner();
        let entry = self.node.put(req.key, req.value);
        Ok(tonic::Response::new(entry.into()))
    }

    async fn get(
        &self,
        req: tonic::Request<GetConfigRequest>,
    ) -> tonic::Result<tonic::Response<Config>, tonic::Status> {
        let req = req.into_inner();
        let entry = self.node.get(req.key);
        Ok(tonic::Response::new(entry.into()))
    }
}
