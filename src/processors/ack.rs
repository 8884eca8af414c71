//! Ack processor (leader side): counts per-zxid acks, including the
//! leader's own looped-back ones, and emits COMMITs in zxid order once a
//! quorum is reached.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::message::Message;
use crate::processors::PROC_QUEUE_CAP;
use crate::transport::Transport;
use crate::utils::ZabError;
use crate::zxid::{ServerId, Zxid};

/// Input to the ack processor.
#[derive(Debug)]
pub(crate) enum AckInput {
    /// A follower (or the leader itself) acked durability up to this zxid.
    Ack { from: ServerId, zxid: Zxid },

    /// The broadcast membership changed (a joiner was admitted).
    SetFollowers {
        followers: HashSet<ServerId>,
        majority: usize,
    },

    /// Poison pill: exit.
    Shutdown,
}

/// Ack processor module.
pub(crate) struct AckProcessor {
    /// Sender side of the input channel.
    tx_input: mpsc::Sender<AckInput>,

    /// Join handle of the worker task.
    worker_handle: JoinHandle<()>,
}

impl AckProcessor {
    /// Creates an ack processor and spawns its worker task. Commits are only
    /// emitted for zxids beyond `committed`; `followers` are the commit
    /// fan-out targets besides the leader itself.
    pub(crate) fn new_and_setup(
        me: ServerId,
        committed: Zxid,
        followers: HashSet<ServerId>,
        majority: usize,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (tx_input, rx_input) = mpsc::channel(PROC_QUEUE_CAP);
        let worker_handle = tokio::spawn(Self::worker_task(
            me,
            committed,
            followers,
            majority,
            transport,
            rx_input,
        ));
        AckProcessor {
            tx_input,
            worker_handle,
        }
    }

    /// Submits an input, waiting if the queue is full.
    pub(crate) async fn submit(&self, input: AckInput) -> Result<(), ZabError> {
        self.tx_input.send(input).await.map_err(ZabError::from)
    }

    /// Shuts the worker down.
    pub(crate) async fn shutdown(self) -> Result<(), ZabError> {
        self.tx_input.send(AckInput::Shutdown).await?;
        self.worker_handle.await?;
        Ok(())
    }

    /// Worker task: quorum accounting with in-order commit emission. An ack
    /// for zxid z covers every pending zxid ≤ z (acks are cumulative, since
    /// the log below z is durable once z is).
    async fn worker_task(
        me: ServerId,
        mut committed: Zxid,
        mut followers: HashSet<ServerId>,
        mut majority: usize,
        transport: Arc<dyn Transport>,
        mut rx_input: mpsc::Receiver<AckInput>,
    ) {
        pf_debug!(me; "ack processor task spawned, majority {}", majority);

        let mut acked: BTreeMap<Zxid, HashSet<ServerId>> = BTreeMap::new();

        while let Some(input) = rx_input.recv().await {
            match input {
                AckInput::Ack { from, zxid } => {
                    if zxid <= committed {
                        continue; // stale ack from a catching-up follower
                    }
                    acked.entry(zxid).or_default();
                    for (_, set) in acked.range_mut(..=zxid) {
                        set.insert(from.clone());
                    }
                }
                AckInput::SetFollowers {
                    followers: new_followers,
                    majority: new_majority,
                } => {
                    followers = new_followers;
                    majority = new_majority;
                    continue;
                }
                AckInput::Shutdown => break,
            }

            // commits must fire in zxid order: stop at the first pending
            // zxid short of quorum even if later ones have reached it
            while let Some((&zxid, set)) = acked.iter().next() {
                if set.len() < majority {
                    break;
                }
                pf_trace!(me; "quorum on {}, committing", zxid);
                for peer in followers.iter() {
                    transport.send(peer, Message::Commit { zxid });
                }
                transport.send(&me, Message::Commit { zxid });
                committed = zxid;
                acked.remove(&zxid);
            }
        }

        pf_debug!(me; "ack processor task exited");
    }
}

#[cfg(test)]
mod ack_tests {
    use super::*;
    use crate::message::Message;
    use std::sync::Mutex;

    #[derive(Default)]
    struct SinkTransport {
        sent: Mutex<Vec<(ServerId, Message)>>,
    }

    impl Transport for SinkTransport {
        fn send(&self, peer: &ServerId, msg: Message) {
            self.sent.lock().unwrap().push((peer.clone(), msg));
        }
        fn clear(&self, _peer: &ServerId) {}
    }

    fn commits_of(transport: &SinkTransport) -> Vec<(ServerId, Zxid)> {
        transport
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(peer, msg)| match msg {
                Message::Commit { zxid } => Some((peer.clone(), *zxid)),
                _ => None,
            })
            .collect()
    }

    fn two_followers() -> HashSet<ServerId> {
        ["s2:2".to_string(), "s3:3".to_string()].into_iter().collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commit_on_quorum() -> Result<(), ZabError> {
        let transport = Arc::new(SinkTransport::default());
        let proc = AckProcessor::new_and_setup(
            "s1:1".into(),
            Zxid::NULL,
            two_followers(),
            2,
            transport.clone(),
        );
        let z = Zxid::new(1, 1);
        proc.submit(AckInput::Ack {
            from: "s1:1".into(),
            zxid: z,
        })
        .await?;
        proc.submit(AckInput::Ack {
            from: "s2:2".into(),
            zxid: z,
        })
        .await?;
        proc.shutdown().await?;

        let commits = commits_of(&transport);
        // one commit per member plus the leader's own loopback
        assert_eq!(commits.len(), 3);
        assert!(commits.iter().all(|(_, zxid)| *zxid == z));
        assert!(commits.iter().any(|(peer, _)| peer == "s1:1"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_commit_below_quorum() -> Result<(), ZabError> {
        let transport = Arc::new(SinkTransport::default());
        let proc = AckProcessor::new_and_setup(
            "s1:1".into(),
            Zxid::NULL,
            two_followers(),
            2,
            transport.clone(),
        );
        proc.submit(AckInput::Ack {
            from: "s1:1".into(),
            zxid: Zxid::new(1, 1),
        })
        .await?;
        proc.shutdown().await?;
        assert!(commits_of(&transport).is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commits_fire_in_zxid_order() -> Result<(), ZabError> {
        let transport = Arc::new(SinkTransport::default());
        let proc = AckProcessor::new_and_setup(
            "s1:1".into(),
            Zxid::NULL,
            two_followers(),
            2,
            transport.clone(),
        );
        let z1 = Zxid::new(1, 1);
        let z2 = Zxid::new(1, 2);
        // (1,1) pending with one ack; batch acks for (1,2) then cover both,
        // and the commits must come out in zxid order
        proc.submit(AckInput::Ack {
            from: "s3:3".into(),
            zxid: z1,
        })
        .await?;
        proc.submit(AckInput::Ack {
            from: "s1:1".into(),
            zxid: z2,
        })
        .await?;
        proc.submit(AckInput::Ack {
            from: "s2:2".into(),
            zxid: z2,
        })
        .await?;
        proc.shutdown().await?;

        let commits = commits_of(&transport);
        let to_s2: Vec<Zxid> = commits
            .iter()
            .filter(|(peer, _)| peer == "s2:2")
            .map(|(_, z)| *z)
            .collect();
        assert_eq!(to_s2, vec![z1, z2]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_acks_ignored() -> Result<(), ZabError> {
        let transport = Arc::new(SinkTransport::default());
        let proc = AckProcessor::new_and_setup(
            "s1:1".into(),
            Zxid::new(1, 5),
            two_followers(),
            2,
            transport.clone(),
        );
        for peer in ["s1:1", "s2:2", "s3:3"] {
            proc.submit(AckInput::Ack {
                from: peer.into(),
                zxid: Zxid::new(1, 4),
            })
            .await?;
        }
        proc.shutdown().await?;
        assert!(commits_of(&transport).is_empty());
        Ok(())
    }
}
