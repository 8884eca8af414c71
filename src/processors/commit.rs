//! Commit processor: turns the proposal + commit streams into in-order
//! deliver callbacks to the application state machine.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::processors::PROC_QUEUE_CAP;
use crate::statemach::StateMachine;
use crate::utils::ZabError;
use crate::zxid::{ServerId, Transaction, Zxid};

/// Input to the commit processor.
#[derive(Debug)]
pub(crate) enum CommitInput {
    /// A proposal observed (from the leader, or replayed from the log).
    Proposal { txn: Transaction },

    /// Everything up to this zxid is committed and may be delivered.
    Commit { zxid: Zxid },

    /// Poison pill: drain and exit.
    Shutdown,
}

/// Commit processor module. Owns a worker task that buffers proposals by
/// zxid and delivers them to the state machine once committed, in strictly
/// increasing zxid order, each at most once.
pub(crate) struct CommitProcessor {
    /// Sender side of the input channel.
    tx_input: mpsc::Sender<CommitInput>,

    /// Live view of the delivery watermark, for snapshotting.
    rx_watermark: watch::Receiver<Zxid>,

    /// Join handle of the worker task; resolves to the final delivery
    /// watermark.
    worker_handle: JoinHandle<Zxid>,
}

impl CommitProcessor {
    /// Creates a commit processor and spawns its worker task. Deliveries
    /// start strictly after `last_delivered`.
    pub(crate) fn new_and_setup(
        me: ServerId,
        last_delivered: Zxid,
        state_machine: Arc<dyn StateMachine>,
    ) -> Self {
        let (tx_input, rx_input) = mpsc::channel(PROC_QUEUE_CAP);
        let (tx_watermark, rx_watermark) = watch::channel(last_delivered);
        let worker_handle = tokio::spawn(Self::worker_task(
            me,
            last_delivered,
            state_machine,
            rx_input,
            tx_watermark,
        ));
        CommitProcessor {
            tx_input,
            rx_watermark,
            worker_handle,
        }
    }

    /// Current delivery watermark (may lag a just-finished delivery by an
    /// instant; only ever monotone).
    pub(crate) fn last_delivered(&self) -> Zxid {
        *self.rx_watermark.borrow()
    }

    /// Submits an input, waiting if the queue is full.
    pub(crate) async fn submit(
        &self,
        input: CommitInput,
    ) -> Result<(), ZabError> {
        self.tx_input.send(input).await.map_err(ZabError::from)
    }

    /// Shuts the worker down after it drains queued work, returning the
    /// final delivery watermark.
    pub(crate) async fn shutdown(self) -> Result<Zxid, ZabError> {
        self.tx_input.send(CommitInput::Shutdown).await?;
        Ok(self.worker_handle.await?)
    }

    /// Worker task: applies commits to the buffered proposal stream.
    async fn worker_task(
        me: ServerId,
        mut last_delivered: Zxid,
        state_machine: Arc<dyn StateMachine>,
        mut rx_input: mpsc::Receiver<CommitInput>,
        tx_watermark: watch::Sender<Zxid>,
    ) -> Zxid {
        pf_debug!(me; "commit processor task spawned");

        let mut pending: VecDeque<Transaction> = VecDeque::new();
        let mut committed_up_to = Zxid::NULL;

        while let Some(input) = rx_input.recv().await {
            match input {
                CommitInput::Proposal { txn } => {
                    if txn.zxid <= last_delivered {
                        // replay overlap after a re-sync; already delivered
                        continue;
                    }
                    debug_assert!(
                        pending.back().map(|t| t.zxid < txn.zxid).unwrap_or(true)
                    );
                    pending.push_back(txn);
                }
                CommitInput::Commit { zxid } => {
                    if zxid > committed_up_to {
                        committed_up_to = zxid;
                    }
                }
                CommitInput::Shutdown => break,
            }

            while let Some(txn) = pending.front() {
                if txn.zxid > committed_up_to {
                    break;
                }
                let txn = pending.pop_front().unwrap();
                pf_trace!(me; "delivering {}", txn.zxid);
                state_machine.deliver(&txn);
                last_delivered = txn.zxid;
                let _ = tx_watermark.send(last_delivered);
            }
        }

        pf_debug!(me; "commit processor task exited at {}", last_delivered);
        last_delivered
    }
}

#[cfg(test)]
mod commit_tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<Vec<Zxid>>,
    }

    impl StateMachine for Recorder {
        fn deliver(&self, txn: &Transaction) {
            self.delivered.lock().unwrap().push(txn.zxid);
        }
        fn save(&self) -> Result<Vec<u8>, ZabError> {
            Ok(vec![])
        }
        fn restore(&self, _data: &[u8]) -> Result<(), ZabError> {
            Ok(())
        }
    }

    fn txn(epoch: u32, xid: u64) -> Transaction {
        Transaction::new(Zxid::new(epoch, xid), 0, vec![])
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivers_in_order_after_commit() -> Result<(), ZabError> {
        let sm = Arc::new(Recorder::default());
        let proc = CommitProcessor::new_and_setup(
            "s1:1".into(),
            Zxid::NULL,
            sm.clone(),
        );
        proc.submit(CommitInput::Proposal { txn: txn(1, 1) }).await?;
        proc.submit(CommitInput::Proposal { txn: txn(1, 2) }).await?;
        proc.submit(CommitInput::Proposal { txn: txn(1, 3) }).await?;
        // commit of (1,2) releases the first two only
        proc.submit(CommitInput::Commit {
            zxid: Zxid::new(1, 2),
        })
        .await?;
        proc.submit(CommitInput::Commit {
            zxid: Zxid::new(1, 3),
        })
        .await?;
        let last = proc.shutdown().await?;
        assert_eq!(last, Zxid::new(1, 3));
        assert_eq!(
            *sm.delivered.lock().unwrap(),
            vec![Zxid::new(1, 1), Zxid::new(1, 2), Zxid::new(1, 3)]
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn uncommitted_tail_not_delivered() -> Result<(), ZabError> {
        let sm = Arc::new(Recorder::default());
        let proc = CommitProcessor::new_and_setup(
            "s1:1".into(),
            Zxid::NULL,
            sm.clone(),
        );
        proc.submit(CommitInput::Proposal { txn: txn(1, 1) }).await?;
        proc.submit(CommitInput::Proposal { txn: txn(1, 2) }).await?;
        proc.submit(CommitInput::Commit {
            zxid: Zxid::new(1, 1),
        })
        .await?;
        let last = proc.shutdown().await?;
        assert_eq!(last, Zxid::new(1, 1));
        assert_eq!(*sm.delivered.lock().unwrap(), vec![Zxid::new(1, 1)]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_redelivery_below_watermark() -> Result<(), ZabError> {
        let sm = Arc::new(Recorder::default());
        let proc = CommitProcessor::new_and_setup(
            "s1:1".into(),
            Zxid::new(1, 2),
            sm.clone(),
        );
        // replay overlap: (1,1) and (1,2) were already delivered before
        for xid in 1..=3 {
            proc.submit(CommitInput::Proposal { txn: txn(1, xid) }).await?;
        }
        proc.submit(CommitInput::Commit {
            zxid: Zxid::new(1, 3),
        })
        .await?;
        let last = proc.shutdown().await?;
        assert_eq!(last, Zxid::new(1, 3));
        assert_eq!(*sm.delivered.lock().unwrap(), vec![Zxid::new(1, 3)]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commit_before_proposal_buffered() -> Result<(), ZabError> {
        let sm = Arc::new(Recorder::default());
        let proc = CommitProcessor::new_and_setup(
            "s1:1".into(),
            Zxid::NULL,
            sm.clone(),
        );
        proc.submit(CommitInput::Commit {
            zxid: Zxid::new(1, 1),
        })
        .await?;
        proc.submit(CommitInput::Proposal { txn: txn(1, 1) }).await?;
        let last = proc.shutdown().await?;
        assert_eq!(last, Zxid::new(1, 1));
        assert_eq!(*sm.delivered.lock().unwrap(), vec![Zxid::new(1, 1)]);
        Ok(())
    }
}
