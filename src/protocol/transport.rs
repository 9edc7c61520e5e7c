use super::message::{
    AnnounceMessage, FollowUpMessage, PdelayReqMessage, PdelayRespFollowUpMessage,
    PdelayRespMessage, SyncMessage,
};

/// Transmit callbacks implemented by the network layer
///
/// Calls are fire-and-forget: a `false` return is counted by the calling
/// state machine and never retried or awaited.
pub trait MessageTransmitter: Send + Sync {
    fn send_announce(&self, msg: &AnnounceMessage) -> bool;
    fn send_sync(&self, msg: &SyncMessage) -> bool;
    fn send_follow_up(&self, msg: &FollowUpMessage) -> bool;
    fn send_pdelay_req(&self, msg: &PdelayReqMessage) -> bool;
    fn send_pdelay_resp(&self, msg: &PdelayRespMessage) -> bool;
    fn send_pdelay_resp_follow_up(&self, msg: &PdelayRespFollowUpMessage) -> bool;
}

/// A message queued for transmission
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Announce(AnnounceMessage),
    Sync(SyncMessage),
    FollowUp(FollowUpMessage),
    PdelayReq(PdelayReqMessage),
    PdelayResp(PdelayRespMessage),
    PdelayRespFollowUp(PdelayRespFollowUpMessage),
}

impl Outbound {
    /// Sequence id of the wrapped message
    pub fn sequence_id(&self) -> u16 {
        match self {
            Outbound::Announce(m) => m.header.sequence_id,
            Outbound::Sync(m) => m.header.sequence_id,
            Outbound::FollowUp(m) => m.header.sequence_id,
            Outbound::PdelayReq(m) => m.header.sequence_id,
            Outbound::PdelayResp(m) => m.header.sequence_id,
            Outbound::PdelayRespFollowUp(m) => m.header.sequence_id,
        }
    }
}

/// Any sink that accepts [`Outbound`] records can serve as a transmitter
pub trait OutboundSink: Send + Sync {
    fn push(&self, msg: Outbound) -> bool;
}

impl<T: OutboundSink> MessageTransmitter for T {
    fn send_announce(&self, msg: &AnnounceMessage) -> bool {
        self.push(Outbound::Announce(*msg))
    }

    fn send_sync(&self, msg: &SyncMessage) -> bool {
        self.push(Outbound::Sync(*msg))
    }

    fn send_follow_up(&self, msg: &FollowUpMessage) -> bool {
        self.push(Outbound::FollowUp(*msg))
    }

    fn send_pdelay_req(&self, msg: &PdelayReqMessage) -> bool {
        self.push(Outbound::PdelayReq(*msg))
    }

    fn send_pdelay_resp(&self, msg: &PdelayRespMessage) -> bool {
        self.push(Outbound::PdelayResp(*msg))
    }

    fn send_pdelay_resp_follow_up(&self, msg: &PdelayRespFollowUpMessage) -> bool {
        self.push(Outbound::PdelayRespFollowUp(*msg))
    }
}
