use crate::Result;

/// Hooks the membership layer calls into while it gossips.
///
/// Implementations must not block for long: they are invoked from the gossip
/// server handlers and the background exchange loops.
pub trait Delegate: Send + Sync + 'static {
    /// Metadata advertised with this node's membership record, at most
    /// `limit` bytes once encoded.
    fn node_meta(&self, limit: usize) -> Result<Vec<u8>>;

    /// A user payload sent directly to this node by a peer.
    fn notify_msg(&self, msg: &[u8]);

    /// Payloads to gossip to a few random peers on the next gossip tick.
    /// Each payload is charged `overhead` bytes and together they must fit in
    /// `limit`.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Full local state sent during a push/pull exchange. `join` is set when
    /// the exchange is part of joining the cluster.
    fn local_state(&self, join: bool) -> Result<Vec<u8>>;

    /// Apply the state a peer produced with [`Delegate::local_state`].
    fn merge_remote_state(&self, buf: &[u8], join: bool) -> Result<()>;
}
