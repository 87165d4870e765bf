use super::{Member, MemberState, Memberlist};
use crate::proto::gossip::gossip_server::Gossip;
use crate::proto::gossip::{
    Ack, LeaveNotice, PingRequest, PushPullRequest, PushPullResponse, UserPayload,
};
use tonic::{Request, Response, Status};
use tracing::{debug, info};

/// Server side of the gossip protocol for one [`Memberlist`].
pub(super) struct GossipService {
    list: Memberlist,
}

impl GossipService {
    pub(super) fn new(list: Memberlist) -> Self {
        Self { list }
    }

    fn ack(&self) -> Response<Ack> {
        Response::new(Ack {
            from: self.list.name().to_string(),
        })
    }
}

#[tonic::async_trait]
impl Gossip for GossipService {
    /// The reply carries our state as it was before the request is merged,
    /// so both sides end up with the union of what they knew.
    async fn push_pull(
        &self,
        req: Request<PushPullRequest>,
    ) -> Result<Response<PushPullResponse>, Status> {
        let req = req.into_inner();
        if let Some(from) = req.from {
            let from = Member::from(from);
            debug!(node = %self.list.name(), peer = %from.name, join = req.join, "push/pull from peer");
            // A peer that is leaving may still have an exchange in flight.
            if from.state == MemberState::Alive {
                self.list.inner.members.observe_alive(from);
            } else {
                self.list.merge_members(vec![from.into()]);
            }
        }

        let members = self.list.member_records();
        let user_state = self
            .list
            .local_state(req.join)
            .map_err(|e| Status::internal(e.to_string()))?;

        self.list.merge_members(req.members);
        self.list
            .merge_user_state(&req.user_state, req.join)
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(PushPullResponse {
            members,
            user_state,
        }))
    }

    async fn ping(&self, _req: Request<PingRequest>) -> Result<Response<Ack>, Status> {
        Ok(self.ack())
    }

    async fn leave(&self, req: Request<LeaveNotice>) -> Result<Response<Ack>, Status> {
        let notice = req.into_inner();
        if self
            .list
            .inner
            .members
            .mark_left(&notice.name, notice.incarnation)
        {
            info!(node = %self.list.name(), member = %notice.name, "member left the cluster");
        }
        Ok(self.ack())
    }

    async fn user_message(&self, req: Request<UserPayload>) -> Result<Response<Ack>, Status> {
        let msg = req.into_inner();
        self.list.inner.delegate.notify_msg(&msg.payload);
        Ok(self.ack())
    }
}
