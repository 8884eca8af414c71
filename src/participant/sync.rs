//! Log synchronization between peers: strategy selection and the sending
//! and receiving halves of a sync stream.
//!
//! A stream is an optional `TRUNCATE` or `SNAPSHOT` prologue, a `DIFF`
//! naming the target zxid, and then `PROPOSAL`s until the receiver's log
//! reaches the target. The same stream shape serves the leader aligning a
//! follower and a follower answering the leader's `PULL_TXN_REQ`.

use std::sync::Arc;

use crate::message::Message;
use crate::participant::Participant;
use crate::storage::Persistence;
use crate::transport::Transport;
use crate::utils::ZabError;
use crate::zxid::{ServerId, Zxid};

/// How to bring a peer whose log ends at some zxid up to ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SyncStrategy {
    /// Peer's log is a prefix of ours: ship everything after its last zxid.
    Diff { from: Zxid },

    /// Peer's log diverges: it truncates back to `to` first, then receives
    /// everything after `to`.
    TruncateDiff { to: Zxid },

    /// Peer's position predates our retained log window: full state
    /// transfer, then everything after the snapshot watermark.
    Snapshot,
}

/// Chooses the strategy for a peer whose log ends at `peer_last`.
pub(crate) async fn choose_strategy(
    persistence: &Persistence,
    peer_last: Zxid,
) -> SyncStrategy {
    let snap = persistence.snapshot_watermark().await;

    if peer_last.is_null() {
        if snap.is_null() {
            return SyncStrategy::Diff { from: Zxid::NULL };
        }
        // our history before the snapshot is gone
        return SyncStrategy::Snapshot;
    }

    if persistence.log_contains(peer_last).await {
        return SyncStrategy::Diff { from: peer_last };
    }

    match persistence.log_highest_le(peer_last).await {
        // the retained log still covers the divergence point
        Some(base) => SyncStrategy::TruncateDiff { to: base },
        None if snap.is_null() => SyncStrategy::TruncateDiff { to: Zxid::NULL },
        None => SyncStrategy::Snapshot,
    }
}

/// Streams our log to `peer` following the chosen strategy, ending the
/// prologue with the `DIFF` target. The caller follows up with whatever
/// closes its exchange (`NEW_LEADER` from a leader; nothing for a pull).
pub(crate) async fn send_sync(
    me: &ServerId,
    persistence: &Arc<Persistence>,
    transport: &Arc<dyn Transport>,
    peer: &ServerId,
    peer_last: Zxid,
) -> Result<(), ZabError> {
    let strategy = choose_strategy(persistence, peer_last).await;
    let target = persistence.latest_zxid().await;
    pf_debug!(me; "syncing '{}' (at {}) to {} via {:?}",
                  peer, peer_last, target, strategy);

    let diff_from = match strategy {
        SyncStrategy::Diff { from } => from,
        SyncStrategy::TruncateDiff { to } => {
            transport.send(peer, Message::Truncate { last_zxid: to });
            to
        }
        SyncStrategy::Snapshot => {
            let (snap_zxid, data) =
                persistence.load_snapshot().await?.ok_or_else(|| {
                    ZabError::msg("snapshot strategy chosen with no snapshot")
                })?;
            transport.send(
                peer,
                Message::Snapshot {
                    last_zxid: snap_zxid,
                    data,
                },
            );
            snap_zxid
        }
    };

    transport.send(peer, Message::Diff { last_zxid: target });
    for txn in persistence.txns_after(diff_from).await? {
        transport.send(peer, Message::Proposal { txn });
    }
    Ok(())
}

impl Participant {
    /// Applies a sync stream from `src` to the local log (and state machine,
    /// for snapshots), returning once the log has reached the stream's
    /// `DIFF` target. Also answers `PULL_TXN_REQ`, which a new leader may
    /// send first when our history is the freshest.
    pub(crate) async fn sync_with(
        &mut self,
        src: &ServerId,
    ) -> Result<(), ZabError> {
        let mut target: Option<Zxid> = None;

        loop {
            if let Some(target) = target {
                if self.persistence.latest_zxid().await >= target {
                    pf_debug!(self.me; "synchronized up to {}", target);
                    return Ok(());
                }
            }

            let (from, msg) =
                self.get_message_guarding(|p| p == src).await?;
            if &from != src {
                pf_debug!(self.me; "discarding {} <- '{}' during sync",
                                   msg.kind(), from);
                continue;
            }

            match msg {
                Message::PullTxnReq { last_zxid } => {
                    send_sync(
                        &self.me,
                        &self.persistence,
                        &self.transport,
                        src,
                        last_zxid,
                    )
                    .await?;
                }
                Message::Truncate { last_zxid } => {
                    if self.last_delivered > last_zxid {
                        return Err(ZabError::Protocol(format!(
                            "asked to truncate to {} below delivered {}",
                            last_zxid, self.last_delivered
                        )));
                    }
                    pf_debug!(self.me; "truncating log to {}", last_zxid);
                    self.persistence.truncate_log(last_zxid).await?;
                }
                Message::Snapshot { last_zxid, data } => {
                    pf_info!(self.me; "installing snapshot up to {}", last_zxid);
                    self.state_machine.restore(&data)?;
                    self.persistence.install_snapshot(last_zxid, data).await?;
                    self.last_delivered = last_zxid;
                }
                Message::Diff { last_zxid } => {
                    target = Some(last_zxid);
                }
                Message::Proposal { txn } => {
                    self.persistence.append_txn(&txn).await?;
                }
                other => {
                    pf_warn!(self.me; "unexpected {} <- '{}' during sync",
                                      other.kind(), src);
                }
            }
        }
    }
}

#[cfg(test)]
mod sync_tests {
    use super::*;
    use crate::zxid::Transaction;
    use std::path::PathBuf;
    use tokio::fs;

    async fn fresh_dir(name: &str) -> Result<PathBuf, ZabError> {
        let dir = std::env::temp_dir().join(name);
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(dir)
    }

    fn txn(epoch: u32, xid: u64) -> Transaction {
        Transaction::new(Zxid::new(epoch, xid), 0, b"body".to_vec())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn strategy_selection() -> Result<(), ZabError> {
        let dir = fresh_dir("zab-test-sync-0").await?;
        let persistence = Persistence::open(&dir).await?;
        for xid in 1..=3 {
            persistence.append_txn(&txn(3, xid)).await?;
        }
        persistence.sync_log().await?;

        // empty peer, no snapshot: ship everything
        assert_eq!(
            choose_strategy(&persistence, Zxid::NULL).await,
            SyncStrategy::Diff { from: Zxid::NULL }
        );

        // clean prefix: plain diff
        assert_eq!(
            choose_strategy(&persistence, Zxid::new(3, 2)).await,
            SyncStrategy::Diff {
                from: Zxid::new(3, 2)
            }
        );

        // peer ran ahead on a dead epoch: truncate to the common ancestor
        assert_eq!(
            choose_strategy(&persistence, Zxid::new(3, 9)).await,
            SyncStrategy::TruncateDiff {
                to: Zxid::new(3, 3)
            }
        );
        assert_eq!(
            choose_strategy(&persistence, Zxid::new(2, 5)).await,
            SyncStrategy::TruncateDiff { to: Zxid::NULL }
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn strategy_snapshot_when_trimmed() -> Result<(), ZabError> {
        let dir = fresh_dir("zab-test-sync-1").await?;
        let persistence = Persistence::open(&dir).await?;
        for xid in 1..=3 {
            persistence.append_txn(&txn(1, xid)).await?;
        }
        persistence.sync_log().await?;
        persistence
            .store_snapshot(Zxid::new(1, 3), b"state".to_vec())
            .await?;

        // an empty peer can no longer be served from the log alone
        assert_eq!(
            choose_strategy(&persistence, Zxid::NULL).await,
            SyncStrategy::Snapshot
        );
        Ok(())
    }
}
