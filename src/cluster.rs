use crate::{Error, Node, Result};
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Supervises a set of nodes running in one process.
///
/// Each started node's error stream is forwarded, tagged with the node name,
/// into a single channel. The first error, or the shutdown future, stops
/// every node.
pub struct Cluster {
    nodes: Vec<Node>,
    errors_tx: mpsc::UnboundedSender<(String, Error)>,
    errors_rx: mpsc::UnboundedReceiver<(String, Error)>,
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster {
    pub fn new() -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            nodes: Vec::new(),
            errors_tx,
            errors_rx,
        }
    }

    /// Start `node` and watch its error stream.
    pub fn start(&mut self, node: Node) {
        let mut errors = node.start();
        let tx = self.errors_tx.clone();
        let name = node.name().to_string();
        tokio::spawn(async move {
            while let Some(e) = errors.recv().await {
                if tx.send((name.clone(), e)).is_err() {
                    break;
                }
            }
        });
        self.nodes.push(node);
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Run until a node reports an error or `shutdown` completes, then stop
    /// every node.
    ///
    /// Any node error is treated as fatal for the whole cluster and returned
    /// as [`Error::NodeFailed`]; a completed `shutdown` returns `Ok`.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let outcome = tokio::select! {
            Some((node, e)) = self.errors_rx.recv() => {
                error!(%node, "{e}");
                Err(Error::NodeFailed { node, source: Box::new(e) })
            }
            _ = &mut shutdown => {
                info!("shutting down...");
                Ok(())
            }
        };

        self.shutdown_all().await;
        outcome
    }

    /// Shut every node down in start order.
    pub async fn shutdown_all(&self) {
        for node in &self.nodes {
            if let Err(e) = node.shutdown().await {
                warn!(node = %node.name(), "unclean shutdown: {e}");
            }
        }
        info!("all nodes shutdown");
    }
}
