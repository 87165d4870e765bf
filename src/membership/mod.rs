//! Cluster membership and anti-entropy.
//!
//! Every node runs a small gossip service next to its client API. Peers find
//! each other through [`Memberlist::join`], detect failures with periodic
//! pings, and reconcile both the member table and the [`Delegate`]'s state
//! with full push/pull exchanges against one random peer at a time.
//!
//! Incremental broadcasts are supported through [`Delegate::get_broadcasts`]
//! but the configuration store never produces any; it relies entirely on
//! push/pull.

mod config;
mod delegate;
mod service;
mod state;

pub use config::{MembershipConfig, DEFAULT_GOSSIP_PORT, META_MAX_SIZE};
pub use delegate::Delegate;
pub use state::{Member, MemberState};

use crate::proto::gossip as pb;
use crate::proto::gossip::gossip_client::GossipClient;
use crate::proto::gossip::gossip_server::GossipServer;
use crate::{Error, Result};
use dashmap::DashMap;
use futures::future::join_all;
use rand::seq::SliceRandom;
use service::GossipService;
use state::{MemberTable, MergeOutcome};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, error, info, warn};

/// Overhead charged per broadcast payload when packing several together.
const COMPOUND_OVERHEAD: usize = 2;

/// Handle to the membership layer of one node.
///
/// Cloning is cheap; all clones drive the same member table and background
/// tasks.
#[derive(Clone)]
pub struct Memberlist {
    inner: Arc<Inner>,
}

struct Inner {
    config: MembershipConfig,
    local_addr: SocketAddr,
    delegate: Arc<dyn Delegate>,
    members: MemberTable,

    /// Delegate encode/decode failures are forwarded here.
    fatal_tx: mpsc::UnboundedSender<Error>,

    /// Lazily connected channels to peers, keyed by gossip address.
    clients: DashMap<String, GossipClient<Channel>>,

    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Memberlist {
    /// Bind the gossip listener and start the background loops.
    ///
    /// The node does not know any peer until [`Memberlist::join`] is called.
    pub async fn create(
        config: MembershipConfig,
        delegate: Arc<dyn Delegate>,
        fatal_tx: mpsc::UnboundedSender<Error>,
    ) -> Result<Memberlist> {
        let meta = delegate.node_meta(config.meta_max_size)?;

        let bind = format!("{}:{}", config.bind_addr, config.bind_port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|source| Error::Listen {
                addr: bind.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| Error::Listen {
            addr: bind.clone(),
            source,
        })?;

        let advertise = format!(
            "{}:{}",
            config
                .advertise_addr
                .clone()
                .unwrap_or_else(|| config.bind_addr.clone()),
            config.advertise_port.unwrap_or(local_addr.port())
        );
        let local = Member {
            name: config.name.clone(),
            addr: advertise,
            meta,
            incarnation: 0,
            state: MemberState::Alive,
        };
        info!(node = %local.name, addr = %local.addr, "gossip listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let list = Memberlist {
            inner: Arc::new(Inner {
                config,
                local_addr,
                delegate,
                members: MemberTable::new(local),
                fatal_tx,
                clients: DashMap::new(),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let server = {
            let service = GossipServer::new(GossipService::new(list.clone()));
            let mut shutdown = shutdown_rx.clone();
            let name = list.inner.config.name.clone();
            tokio::spawn(async move {
                let result = tonic::transport::Server::builder()
                    .add_service(service)
                    .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                        let _ = shutdown.wait_for(|stop| *stop).await;
                    })
                    .await;
                if let Err(e) = result {
                    error!(node = %name, "gossip server failed: {e}");
                }
            })
        };

        let tasks = vec![
            server,
            tokio::spawn(list.clone().push_pull_loop(shutdown_rx.clone())),
            tokio::spawn(list.clone().probe_loop(shutdown_rx.clone())),
            tokio::spawn(list.clone().gossip_loop(shutdown_rx)),
        ];
        list.tasks().extend(tasks);

        Ok(list)
    }

    /// Contact each address with a joining push/pull exchange.
    ///
    /// Returns the number of peers successfully contacted; fails only when
    /// none of them could be reached. Each address is tried exactly once.
    pub async fn join(&self, addrs: &[String]) -> Result<usize> {
        self.ensure_running()?;

        let mut joined = 0;
        let mut last_error = None;
        for addr in addrs {
            match self.push_pull_node(addr, true).await {
                Ok(()) => joined += 1,
                Err(e) => {
                    warn!(node = %self.name(), %addr, "failed to join: {e}");
                    last_error = Some(e);
                }
            }
        }

        if joined == 0 {
            return Err(Error::JoinFailed {
                addrs: addrs.to_vec(),
                reason: last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no addresses given".to_string()),
            });
        }
        Ok(joined)
    }

    /// Alive and suspect members, the local node included.
    pub fn members(&self) -> Vec<Member> {
        self.inner.members.active()
    }

    pub fn num_members(&self) -> usize {
        self.members().len()
    }

    pub fn local_node(&self) -> Member {
        self.inner.members.local()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn name(&self) -> &str {
        self.inner.members.local_name()
    }

    /// Announce to every active peer that this node is leaving.
    ///
    /// The notices are sent concurrently; if they are not all delivered
    /// within `timeout` the leave is abandoned with [`Error::LeaveTimeout`].
    /// Individual delivery failures are only logged.
    pub async fn leave(&self, timeout: Duration) -> Result<()> {
        self.ensure_running()?;

        let local = self.inner.members.leave_local();
        let peers = self.inner.members.peers();
        info!(node = %local.name, peers = peers.len(), "leaving cluster");

        let notices = peers.iter().map(|peer| {
            let notice = pb::LeaveNotice {
                name: local.name.clone(),
                incarnation: local.incarnation,
            };
            async move {
                let result = async {
                    let mut client = self.client(&peer.addr)?;
                    client.leave(notice).await?;
                    Ok::<_, Error>(())
                }
                .await;
                (peer, result)
            }
        });

        let results = tokio::time::timeout(timeout, join_all(notices))
            .await
            .map_err(|_| Error::LeaveTimeout(timeout))?;
        for (peer, result) in results {
            if let Err(e) = result {
                warn!(node = %local.name, peer = %peer.name, "leave notice not delivered: {e}");
            }
        }
        Ok(())
    }

    /// Stop the gossip server and background loops. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let already = self.inner.shutdown_tx.send_replace(true);
        if already {
            return;
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.inner.clients.clear();
        info!(node = %self.name(), "membership shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::MembershipShutdown);
        }
        Ok(())
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self, addr: &str) -> Result<GossipClient<Channel>> {
        if let Some(client) = self.inner.clients.get(addr) {
            return Ok(client.clone());
        }

        let timeout = self.inner.config.tcp_timeout;
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))
            .map_err(|e| Error::InvalidAddress {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?
            .connect_timeout(timeout)
            .timeout(timeout);
        let client = GossipClient::new(endpoint.connect_lazy());
        self.inner
            .clients
            .insert(addr.to_string(), client.clone());
        Ok(client)
    }

    /// Full state exchange with the peer at `addr`.
    async fn push_pull_node(&self, addr: &str, join: bool) -> Result<()> {
        let request = pb::PushPullRequest {
            from: Some(self.local_node().into()),
            members: self.member_records(),
            user_state: self.local_state(join)?,
            join,
        };

        let mut client = self.client(addr)?;
        let response = client.push_pull(request).await?.into_inner();
        debug!(
            node = %self.name(),
            %addr,
            members = response.members.len(),
            "push/pull exchange complete"
        );

        self.merge_members(response.members);
        self.merge_user_state(&response.user_state, join)
    }

    fn member_records(&self) -> Vec<pb::Member> {
        self.inner
            .members
            .all()
            .into_iter()
            .map(Into::into)
            .collect()
    }

    fn merge_members(&self, members: Vec<pb::Member>) {
        for member in members {
            let member = Member::from(member);
            let name = member.name.clone();
            let state = member.state;
            match self.inner.members.merge(member) {
                MergeOutcome::Inserted => {
                    info!(node = %self.name(), member = %name, ?state, "discovered member")
                }
                MergeOutcome::Updated => {
                    debug!(node = %self.name(), member = %name, ?state, "member updated")
                }
                MergeOutcome::Refuted => {
                    warn!(node = %self.name(), ?state, "refuted a claim that this node is not alive")
                }
                MergeOutcome::Ignored => {}
            }
        }
    }

    fn local_state(&self, join: bool) -> Result<Vec<u8>> {
        self.inner
            .delegate
            .local_state(join)
            .map_err(|e| self.report_fatal(e))
    }

    fn merge_user_state(&self, buf: &[u8], join: bool) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.inner
            .delegate
            .merge_remote_state(buf, join)
            .map_err(|e| self.report_fatal(e))
    }

    /// Forward a delegate failure to whoever owns this node. The current
    /// exchange is aborted with a summary of it.
    fn report_fatal(&self, e: Error) -> Error {
        error!(node = %self.name(), "delegate failed during gossip: {e}");
        let aborted = Error::ExchangeAborted(e.to_string());
        let _ = self.inner.fatal_tx.send(e);
        aborted
    }

    async fn push_pull_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.inner.config.push_pull_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            let Some(peer) = self.random_peers(1).pop() else {
                continue;
            };
            if let Err(e) = self.push_pull_node(&peer.addr, false).await {
                warn!(node = %self.name(), peer = %peer.name, "push/pull failed: {e}");
            }
        }
    }

    async fn probe_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.inner.config.probe_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            for name in self
                .inner
                .members
                .reap_suspects(self.inner.config.suspicion_timeout)
            {
                warn!(node = %self.name(), member = %name, "suspect member declared dead");
            }

            let target = {
                let peers = self.inner.members.peers();
                peers.choose(&mut rand::thread_rng()).cloned()
            };
            if let Some(peer) = target {
                self.probe(&peer).await;
            }
        }
    }

    async fn probe(&self, peer: &Member) {
        let ping = async {
            let mut client = self.client(&peer.addr)?;
            client
                .ping(pb::PingRequest {
                    from: self.name().to_string(),
                })
                .await?;
            Ok::<_, Error>(())
        };

        match tokio::time::timeout(self.inner.config.probe_timeout, ping).await {
            Ok(Ok(())) => {
                if self.inner.members.confirm_alive(&peer.name) {
                    info!(node = %self.name(), member = %peer.name, "suspect member is alive again");
                }
            }
            Ok(Err(e)) => self.mark_suspect(peer, &e.to_string()),
            Err(_) => self.mark_suspect(peer, "probe timed out"),
        }
    }

    fn mark_suspect(&self, peer: &Member, reason: &str) {
        if self.inner.members.suspect(&peer.name) {
            warn!(node = %self.name(), member = %peer.name, "member suspected: {reason}");
        }
    }

    async fn gossip_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.inner.config.gossip_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            let broadcasts = self
                .inner
                .delegate
                .get_broadcasts(COMPOUND_OVERHEAD, self.inner.config.gossip_size_limit);
            if broadcasts.is_empty() {
                continue;
            }

            for peer in self.random_peers(self.inner.config.gossip_nodes) {
                for payload in &broadcasts {
                    let message = pb::UserPayload {
                        from: self.name().to_string(),
                        payload: payload.clone(),
                    };
                    let result = async {
                        self.client(&peer.addr)?.user_message(message).await?;
                        Ok::<_, Error>(())
                    }
                    .await;
                    if let Err(e) = result {
                        debug!(node = %self.name(), peer = %peer.name, "broadcast not delivered: {e}");
                    }
                }
            }
        }
    }

    fn random_peers(&self, n: usize) -> Vec<Member> {
        let peers = self.inner.members.alive_peers();
        peers
            .choose_multiple(&mut rand::thread_rng(), n)
            .cloned()
            .collect()
    }
}
