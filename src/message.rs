//! Wire message types exchanged between participants, plus the inbound queue
//! tuple wrapper with its special sentinels.

use serde::{Deserialize, Serialize};

use crate::zxid::{ClusterConfig, ServerId, Transaction, Zxid};

/// Peer-peer message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Follower -> prospective leader at the start of discovery, carrying
    /// its proposed epoch (f.p), acked epoch (f.a), and last seen config.
    ProposedEpoch {
        proposed_epoch: u32,
        ack_epoch: u32,
        config: Option<ClusterConfig>,
    },

    /// Leader-elect -> followers: the newly established epoch.
    NewEpoch { epoch: u32 },

    /// Follower -> leader: acknowledges NewEpoch with its acked epoch and
    /// last zxid in log.
    AckEpoch { ack_epoch: u32, last_zxid: Zxid },

    /// Leader -> the owner of the initial history: request its log entries
    /// after the given zxid.
    PullTxnReq { last_zxid: Zxid },

    /// Synchronization prologue: receiver must truncate its log back to
    /// `last_zxid` before applying the stream.
    Truncate { last_zxid: Zxid },

    /// Synchronization prologue: full state transfer; receiver restores the
    /// snapshot and resets its log.
    Snapshot { last_zxid: Zxid, data: Vec<u8> },

    /// Synchronization target: proposals follow until the receiver's log
    /// reaches `last_zxid`, which makes the stream self-terminating.
    Diff { last_zxid: Zxid },

    /// Leader -> follower after its synchronization payload, carrying the
    /// current membership; the new epoch is established once a quorum acks
    /// this.
    NewLeader {
        epoch: u32,
        config: Option<ClusterConfig>,
    },

    /// Acknowledges durability up to the given zxid.
    Ack { zxid: Zxid },

    /// Orders delivery of everything up to the given zxid.
    Commit { zxid: Zxid },

    /// A proposed transaction, in zxid order.
    Proposal { txn: Transaction },

    /// A client request body, forwarded to the current leader.
    Request { body: Vec<u8> },

    /// Liveness probe; the receiver echoes one back.
    Heartbeat,

    /// Asks a peer who it currently believes the leader is.
    QueryLeader,

    /// Reply to `QueryLeader`.
    QueryLeaderReply { leader: ServerId },

    /// Asks the current leader to admit this server into the cluster,
    /// telling it how far the joiner's log reaches.
    Join { last_zxid: Zxid },

    /// Administrative removal; the receiver leaves the cluster.
    ShutDown,
}

impl Message {
    /// Short tag used in trace lines and expected-message mismatch logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ProposedEpoch { .. } => "PROPOSED_EPOCH",
            Message::NewEpoch { .. } => "NEW_EPOCH",
            Message::AckEpoch { .. } => "ACK_EPOCH",
            Message::PullTxnReq { .. } => "PULL_TXN_REQ",
            Message::Truncate { .. } => "TRUNCATE",
            Message::Snapshot { .. } => "SNAPSHOT",
            Message::Diff { .. } => "DIFF",
            Message::NewLeader { .. } => "NEW_LEADER",
            Message::Ack { .. } => "ACK",
            Message::Commit { .. } => "COMMIT",
            Message::Proposal { .. } => "PROPOSAL",
            Message::Request { .. } => "REQUEST",
            Message::Heartbeat => "HEARTBEAT",
            Message::QueryLeader => "QUERY_LEADER",
            Message::QueryLeaderReply { .. } => "QUERY_LEADER_REPLY",
            Message::Join { .. } => "JOIN",
            Message::ShutDown => "SHUT_DOWN",
        }
    }
}

/// What the participant driver pulls off its inbound queue: either a message
/// tagged with its source, or one of two synthetic sentinels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTuple {
    /// A wire message from the given peer (or from self via loopback).
    Message { from: ServerId, msg: Message },

    /// The election oracle told us to abandon the current round.
    GoBack,

    /// The transport lost the connection to the given peer.
    Disconnected { peer: ServerId },
}

#[cfg(test)]
mod message_tests {
    use super::*;

    #[test]
    fn kind_tags() {
        assert_eq!(Message::Heartbeat.kind(), "HEARTBEAT");
        assert_eq!(
            Message::Commit { zxid: Zxid::NULL }.kind(),
            "COMMIT"
        );
        assert_eq!(
            Message::ProposedEpoch {
                proposed_epoch: 0,
                ack_epoch: 0,
                config: None
            }
            .kind(),
            "PROPOSED_EPOCH"
        );
    }
}
