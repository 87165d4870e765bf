//! A cluster node: one configuration store served over gRPC and replicated
//! through the membership layer.
//!
//! Writes land in the local [`ConfigStore`] only. Other nodes pick them up on
//! their next push/pull exchange with this node, or with any node that has
//! already merged them.

use crate::config::NodeConfig;
use crate::membership::{Delegate, Member, Memberlist};
use crate::server::ConfigServer;
use crate::store::{ConfigEntry, ConfigStore, NodeMetadata};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch, OnceCell};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{error, info, warn};

/// Upper bound on how long a node waits for peers to acknowledge it leaving.
pub const LEAVE_TIMEOUT: Duration = Duration::from_secs(15);

/// Metadata key under which a node advertises its API port.
pub const API_PORT_META_KEY: &str = "apiPort";

/// Asynchronous failures of a started node.
pub type NodeErrors = mpsc::UnboundedReceiver<Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    Created,
    /// Binding the API listener and joining the cluster.
    Starting,
    /// Serving requests and a member of the cluster.
    Running,
    ShuttingDown,
    Stopped,
}

/// A gRPC serving node of the cluster.
#[derive(Clone)]
pub struct Node {
    config: Arc<NodeConfig>,

    /// Holds the node's data; it is also the delegate the membership layer
    /// gossips through.
    store: Arc<ConfigStore>,

    /// Set once the join task has created the membership layer.
    memberlist: Arc<OnceCell<Memberlist>>,

    lifecycle: Arc<Lifecycle>,
}

struct Lifecycle {
    state: watch::Sender<NodeState>,
    serving: AtomicBool,
    joined: AtomicBool,
    stop_serving: Mutex<Option<oneshot::Sender<()>>>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Create a node with the default membership timings. Nothing is bound
    /// until [`Node::start`].
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        api_port: u16,
        gossip_port: u16,
        cluster_node_addr: Option<String>,
    ) -> Self {
        Self::with_config(NodeConfig::new(
            name,
            addr,
            api_port,
            gossip_port,
            cluster_node_addr,
        ))
    }

    pub fn with_config(config: NodeConfig) -> Self {
        let mut metadata = NodeMetadata::new();
        metadata.insert(API_PORT_META_KEY.to_string(), config.api_port.to_string());

        let (state, _) = watch::channel(NodeState::Created);
        Self {
            config: Arc::new(config),
            store: Arc::new(ConfigStore::new(metadata)),
            memberlist: Arc::new(OnceCell::new()),
            lifecycle: Arc::new(Lifecycle {
                state,
                serving: AtomicBool::new(false),
                joined: AtomicBool::new(false),
                stop_serving: Mutex::new(None),
                serve_task: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Serve the API and join the cluster, both in the background.
    ///
    /// Returns immediately. Listener and join failures, as well as fatal
    /// gossip payload errors, arrive on the returned stream. A failed join
    /// does not stop the API listener.
    pub fn start(&self) -> NodeErrors {
        let (errors, rx) = mpsc::unbounded_channel();

        let started = self.lifecycle.state.send_if_modified(|state| {
            if *state == NodeState::Created {
                *state = NodeState::Starting;
                true
            } else {
                false
            }
        });
        if !started {
            warn!(node = %self.name(), "node was already started");
            return rx;
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        *lock(&self.lifecycle.stop_serving) = Some(stop_tx);

        let node = self.clone();
        let serve_errors = errors.clone();
        let serve = tokio::spawn(async move {
            if let Err(e) = node.serve(stop_rx).await {
                error!(node = %node.name(), "failed to serve: {e}");
                let _ = serve_errors.send(e);
            }
        });
        *lock(&self.lifecycle.serve_task) = Some(serve);

        let node = self.clone();
        tokio::spawn(async move {
            if let Err(e) = node.join_cluster(errors.clone()).await {
                error!(node = %node.name(), "failed to join cluster: {e}");
                let _ = errors.send(e);
            }
        });

        rx
    }

    /// Write a property locally and tell the other members about it on a
    /// best-effort basis.
    pub fn put(&self, key: String, value: String) -> ConfigEntry {
        self.store.put(key.clone(), value.clone());
        info!(node = %self.name(), key, value, "successfully put config");

        let entry = ConfigEntry { key, value };
        self.notify_members_best_effort(entry.clone());
        entry
    }

    /// Read a property from the local store; the value is empty when it has
    /// not been written here or propagated yet.
    pub fn get(&self, key: String) -> ConfigEntry {
        let value = self.store.get(&key);
        ConfigEntry { key, value }
    }

    /// Fire-and-forget notification of a change.
    ///
    /// Only walks the current members; nothing is transmitted and nothing is
    /// reported back. Propagation happens through push/pull alone.
    pub fn notify_members_best_effort(&self, entry: ConfigEntry) {
        let Some(list) = self.memberlist.get().cloned() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            let local = list.name().to_string();
            for member in list.members() {
                if member.name == local {
                    continue;
                }
                info!(node = %local, key = %entry.key, peer = %member.addr, "distributing config to");
            }
        });
    }

    /// Alive and suspect members as seen by this node, itself included.
    /// Empty until the node has joined.
    pub fn members(&self) -> Vec<Member> {
        self.memberlist
            .get()
            .map(Memberlist::members)
            .unwrap_or_default()
    }

    pub fn state(&self) -> NodeState {
        *self.lifecycle.state.borrow()
    }

    /// Wait until the node is serving and has joined, or has been shut down.
    pub async fn wait_running(&self) -> NodeState {
        let mut rx = self.lifecycle.state.subscribe();
        let reached = rx
            .wait_for(|state| *state >= NodeState::Running)
            .await
            .map(|state| *state);
        reached.unwrap_or_else(|_| self.state())
    }

    /// Stop serving, leave the cluster and release the membership layer.
    ///
    /// In-flight API calls are drained before the listener closes. Leaving is
    /// bounded by [`LEAVE_TIMEOUT`]; a timeout is returned after the node has
    /// been stopped anyway. Meant to be called once.
    pub async fn shutdown(&self) -> Result<()> {
        let first = self.lifecycle.state.send_if_modified(|state| {
            if *state < NodeState::ShuttingDown {
                *state = NodeState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if !first {
            warn!(node = %self.name(), "node is already shutting down");
            return Ok(());
        }

        let stop = lock(&self.lifecycle.stop_serving).take();
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        let serve = lock(&self.lifecycle.serve_task).take();
        if let Some(serve) = serve {
            let _ = serve.await;
        }

        let mut result = Ok(());
        if let Some(list) = self.memberlist.get() {
            match list.leave(LEAVE_TIMEOUT).await {
                Ok(()) | Err(Error::MembershipShutdown) => {}
                Err(e) => {
                    warn!(node = %self.name(), "failed to leave cluster: {e}");
                    result = Err(e);
                }
            }
            list.shutdown().await;
        }

        self.lifecycle.state.send_replace(NodeState::Stopped);
        info!(node = %self.name(), "node stopped");
        result
    }

    async fn serve(&self, stop: oneshot::Receiver<()>) -> Result<()> {
        let addr = self.config.api_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::Listen {
                addr: addr.clone(),
                source,
            })?;
        info!(node = %self.name(), "grpc api serving on {addr}");
        self.lifecycle.serving.store(true, Ordering::SeqCst);
        self.mark_running_if_ready();

        tonic::transport::Server::builder()
            .add_service(ConfigServer::new(self.clone()).into_service())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                let _ = stop.await;
            })
            .await?;
        info!(node = %self.name(), "grpc api stopped");
        Ok(())
    }

    async fn join_cluster(&self, errors: mpsc::UnboundedSender<Error>) -> Result<()> {
        let delegate: Arc<dyn Delegate> = self.store.clone();
        let list = Memberlist::create(self.config.membership.clone(), delegate, errors).await?;

        let _ = self.memberlist.set(list.clone());
        // Shutdown may have started while the listener was being bound, too
        // late to see the membership layer.
        if self.state() >= NodeState::ShuttingDown {
            list.shutdown().await;
            return Ok(());
        }

        let seed = match &self.config.cluster_node_addr {
            Some(addr) => {
                info!(node = %self.name(), "not the first node, joining {addr}...");
                addr.clone()
            }
            None => {
                info!(node = %self.name(), "first node of the cluster...");
                list.local_node().addr
            }
        };
        list.join(&[seed.clone()]).await?;
        info!(node = %self.name(), "successfully joined cluster via {seed}");

        self.lifecycle.joined.store(true, Ordering::SeqCst);
        self.mark_running_if_ready();
        Ok(())
    }

    fn mark_running_if_ready(&self) {
        let lifecycle = &self.lifecycle;
        if !(lifecycle.serving.load(Ordering::SeqCst) && lifecycle.joined.load(Ordering::SeqCst)) {
            return;
        }
        let running = lifecycle.state.send_if_modified(|state| {
            if *state == NodeState::Starting {
                *state = NodeState::Running;
                true
            } else {
                false
            }
        });
        if running {
            info!(node = %self.name(), "node running");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
