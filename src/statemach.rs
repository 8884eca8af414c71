//! Application-facing state machine trait and a small in-memory key-value
//! reference implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::participant::Phase;
use crate::utils::ZabError;
use crate::zxid::{ServerId, Transaction, Zxid};

/// Callbacks from the engine into the application. Implementations must be
/// internally synchronized; `deliver` is invoked from the commit processor
/// task, the others from the participant driver.
///
/// Snapshot contract: `save` returns opaque bytes covering everything
/// delivered so far; the engine stores the delivery watermark next to them
/// and will never deliver a zxid at or below that watermark after a
/// `restore`, so `restore` only ever sees bytes a `save` produced.
pub trait StateMachine: Send + Sync {
    /// A committed transaction, in strictly increasing zxid order. The
    /// externally visible commit point.
    fn deliver(&self, txn: &Transaction);

    /// This participant established leadership over the given followers.
    fn leading(&self, followers: HashSet<ServerId>) {
        let _ = followers;
    }

    /// This participant is following the given leader.
    fn following(&self, leader: &ServerId) {
        let _ = leader;
    }

    /// The observed cluster membership changed.
    fn cluster_change(&self, peers: HashSet<ServerId>) {
        let _ = peers;
    }

    /// Produce a snapshot of all state delivered so far.
    fn save(&self) -> Result<Vec<u8>, ZabError>;

    /// Replace all state with the given snapshot.
    fn restore(&self, data: &[u8]) -> Result<(), ZabError>;

    /// The participant entered a new phase; for observability only.
    fn state_changed(&self, phase: Phase) {
        let _ = phase;
    }
}

/// Phase-transition observer used by tests to watch a participant walk
/// through election, discovery, synchronization, and broadcast.
#[allow(unused_variables)]
pub trait StateChangeCallback: Send + Sync {
    fn electing(&self) {}
    fn leader_discovering(&self) {}
    fn follower_discovering(&self, leader: &ServerId) {}
    fn initial_history_owner(&self, owner: &ServerId, epoch: u32, zxid: Zxid) {}
    fn leader_synchronizing(&self, epoch: u32) {}
    fn follower_synchronizing(&self, epoch: u32) {}
    fn leader_broadcasting(&self, epoch: u32) {}
    fn follower_broadcasting(&self, epoch: u32) {}
}

/// Command format understood by `MemoryKv`, rmp-serde encoded in the
/// transaction body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    /// Put a new value into key.
    Put { key: String, value: String },

    /// Delete a key.
    Del { key: String },
}

/// The in-memory key-value state machine: a `HashMap` behind a mutex.
#[derive(Debug, Default)]
pub struct MemoryKv {
    state: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the current value of a key.
    pub fn get(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().get(key).cloned()
    }

    /// Number of keys present.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().len()
    }

    /// True if no keys are present.
    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().is_empty()
    }
}

impl StateMachine for MemoryKv {
    fn deliver(&self, txn: &Transaction) {
        match rmp_serde::decode::from_slice::<KvCommand>(&txn.body) {
            Ok(KvCommand::Put { key, value }) => {
                self.state.lock().unwrap().insert(key, value);
            }
            Ok(KvCommand::Del { key }) => {
                self.state.lock().unwrap().remove(&key);
            }
            Err(e) => {
                pf_warn!("kv"; "undecodable body at {}: {}", txn.zxid, e);
            }
        }
    }

    fn save(&self) -> Result<Vec<u8>, ZabError> {
        let state = self.state.lock().unwrap();
        Ok(rmp_serde::encode::to_vec(&*state)?)
    }

    fn restore(&self, data: &[u8]) -> Result<(), ZabError> {
        let restored: HashMap<String, String> =
            rmp_serde::decode::from_slice(data)?;
        *self.state.lock().unwrap() = restored;
        Ok(())
    }
}

#[cfg(test)]
mod statemach_tests {
    use super::*;

    fn put_txn(epoch: u32, xid: u64, key: &str, value: &str) -> Transaction {
        let body = rmp_serde::encode::to_vec(&KvCommand::Put {
            key: key.into(),
            value: value.into(),
        })
        .unwrap();
        Transaction::new(Zxid::new(epoch, xid), 0, body)
    }

    #[test]
    fn put_del_get() {
        let kv = MemoryKv::new();
        kv.deliver(&put_txn(1, 1, "jose", "180"));
        assert_eq!(kv.get("jose"), Some("180".into()));
        kv.deliver(&put_txn(1, 2, "jose", "185"));
        assert_eq!(kv.get("jose"), Some("185".into()));

        let body = rmp_serde::encode::to_vec(&KvCommand::Del {
            key: "jose".into(),
        })
        .unwrap();
        kv.deliver(&Transaction::new(Zxid::new(1, 3), 0, body));
        assert_eq!(kv.get("jose"), None);
    }

    #[test]
    fn snapshot_round_trip() -> Result<(), ZabError> {
        let kv = MemoryKv::new();
        kv.deliver(&put_txn(1, 1, "a", "1"));
        kv.deliver(&put_txn(1, 2, "b", "2"));
        let snap = kv.save()?;

        let restored = MemoryKv::new();
        restored.deliver(&put_txn(9, 9, "junk", "junk"));
        restored.restore(&snap)?;
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get("a"), Some("1".into()));
        assert_eq!(restored.get("junk"), None);
        Ok(())
    }
}
