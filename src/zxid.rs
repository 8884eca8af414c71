//! Core data model: transaction ids, transactions, and cluster configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Server ID type. Ids double as transport addresses and take the form
/// `host:port`.
pub type ServerId = String;

/// Transaction id: a (epoch, xid) pair ordered lexicographically. The
/// all-zeros value `Zxid::NULL` precedes every real id.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct Zxid {
    /// Establishment round this transaction was proposed in.
    pub epoch: u32,

    /// Per-epoch counter, starting from 1.
    pub xid: u64,
}

impl Zxid {
    /// The null sentinel, smaller than any real transaction id.
    pub const NULL: Zxid = Zxid { epoch: 0, xid: 0 };

    /// Creates a new transaction id.
    pub fn new(epoch: u32, xid: u64) -> Self {
        Zxid { epoch, xid }
    }

    /// True if this is the null sentinel.
    pub fn is_null(&self) -> bool {
        *self == Zxid::NULL
    }
}

// Implement `Display` trait for cleaner log lines.
impl fmt::Display for Zxid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.epoch, self.xid)
    }
}

/// Transaction type tag for application payloads submitted through
/// `Zab::send`. Other values are carried opaquely.
pub const TXN_TYPE_APP: u32 = 0;

/// A replicated transaction: id, type tag, and opaque payload. Created by
/// the leader's pre-processor and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Total-order transaction id.
    pub zxid: Zxid,

    /// Application-defined type tag.
    pub txn_type: u32,

    /// Opaque payload bytes.
    pub body: Vec<u8>,
}

impl Transaction {
    /// Creates a new transaction.
    pub fn new(zxid: Zxid, txn_type: u32, body: Vec<u8>) -> Self {
        Transaction {
            zxid,
            txn_type,
            body,
        }
    }
}

/// The most recently observed cluster membership, used for quorum counting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Version of this membership view.
    pub version: Zxid,

    /// Ids of all servers in the ensemble (including self).
    pub peers: Vec<ServerId>,
}

impl ClusterConfig {
    /// Creates a new cluster configuration.
    pub fn new(version: Zxid, peers: Vec<ServerId>) -> Self {
        ClusterConfig { version, peers }
    }

    /// Size of a strict majority of this membership.
    pub fn majority(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    /// True if the given server is a member.
    pub fn contains(&self, id: &ServerId) -> bool {
        self.peers.iter().any(|p| p == id)
    }
}
