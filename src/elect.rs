//! Elected-leader oracle interface and two stock implementations.
//!
//! The engine only requires that, on demand, the oracle names one leader for
//! the upcoming round. Real deployments plug in a proper election protocol;
//! the stock oracles cover static clusters and deterministic tests. An
//! oracle owner may additionally push `MessageTuple::GoBack` into the
//! participant's inbound queue to abort a round in progress.

use async_trait::async_trait;

use rand::prelude::*;

use tokio::time::{self, Duration};

use crate::utils::ZabError;
use crate::zxid::ServerId;

/// Produces one leader identifier per election round.
#[async_trait]
pub trait ElectionOracle: Send + Sync {
    /// Returns the leader for the given round number (0-based, counted by
    /// the calling participant). May wait, e.g. for votes to settle.
    async fn elect(&self, round: u64) -> Result<ServerId, ZabError>;
}

/// Always elects the same, fixed server. Deterministic tests use this.
#[derive(Debug, Clone)]
pub struct FixedOracle {
    leader: ServerId,
}

impl FixedOracle {
    /// Creates an oracle pinned to the given leader id.
    pub fn new(leader: ServerId) -> Self {
        FixedOracle { leader }
    }
}

#[async_trait]
impl ElectionOracle for FixedOracle {
    async fn elect(&self, _round: u64) -> Result<ServerId, ZabError> {
        Ok(self.leader.clone())
    }
}

/// Elects the lexicographically lowest configured server id, after a small
/// randomized backoff on retry rounds so that restarted rounds do not
/// stampede.
#[derive(Debug, Clone)]
pub struct LowestIdOracle {
    servers: Vec<ServerId>,
}

impl LowestIdOracle {
    /// Creates an oracle over the given ensemble.
    pub fn new(mut servers: Vec<ServerId>) -> Result<Self, ZabError> {
        if servers.is_empty() {
            return logged_err!("oracle"; "empty server list for oracle");
        }
        servers.sort();
        Ok(LowestIdOracle { servers })
    }
}

#[async_trait]
impl ElectionOracle for LowestIdOracle {
    async fn elect(&self, round: u64) -> Result<ServerId, ZabError> {
        if round > 0 {
            let jitter_ms = thread_rng().gen_range(50..300);
            time::sleep(Duration::from_millis(jitter_ms)).await;
        }
        Ok(self.servers[0].clone())
    }
}

#[cfg(test)]
mod elect_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn fixed_oracle() -> Result<(), ZabError> {
        let oracle = FixedOracle::new("s2:7002".into());
        assert_eq!(oracle.elect(0).await?, "s2:7002".to_string());
        assert_eq!(oracle.elect(7).await?, "s2:7002".to_string());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn lowest_id_oracle() -> Result<(), ZabError> {
        let oracle = LowestIdOracle::new(vec![
            "c:3".into(),
            "a:1".into(),
            "b:2".into(),
        ])?;
        assert_eq!(oracle.elect(0).await?, "a:1".to_string());
        assert!(LowestIdOracle::new(vec![]).is_err());
        Ok(())
    }
}
