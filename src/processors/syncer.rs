//! Sync-proposal processor: batches proposal appends to the log, fsyncs
//! once per batch, then acks the last zxid of the batch to the
//! peer-of-record (the leader for followers; self via loopback for the
//! leader, whose own acks count toward quorum like anyone else's).

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;

use crate::message::Message;
use crate::processors::PROC_QUEUE_CAP;
use crate::storage::Persistence;
use crate::transport::Transport;
use crate::utils::ZabError;
use crate::zxid::{ServerId, Transaction};

/// Input to the sync-proposal processor.
#[derive(Debug)]
pub(crate) enum SyncInput {
    /// A proposal to persist, in zxid order.
    Proposal { txn: Transaction },

    /// Poison pill: flush pending work and exit.
    Shutdown,
}

/// Sync-proposal processor module.
pub(crate) struct SyncProposalProcessor {
    /// Sender side of the input channel.
    tx_input: mpsc::Sender<SyncInput>,

    /// Join handle of the worker task.
    worker_handle: JoinHandle<()>,
}

impl SyncProposalProcessor {
    /// Creates a sync-proposal processor and spawns its worker task. Acks
    /// for persisted batches go to `ack_to`.
    pub(crate) fn new_and_setup(
        me: ServerId,
        persistence: Arc<Persistence>,
        transport: Arc<dyn Transport>,
        ack_to: ServerId,
        max_batch_size: usize,
    ) -> Self {
        let (tx_input, rx_input) = mpsc::channel(PROC_QUEUE_CAP);
        let worker_handle = tokio::spawn(Self::worker_task(
            me,
            persistence,
            transport,
            ack_to,
            max_batch_size,
            rx_input,
        ));
        SyncProposalProcessor {
            tx_input,
            worker_handle,
        }
    }

    /// Submits an input, waiting if the queue is full.
    pub(crate) async fn submit(
        &self,
        input: SyncInput,
    ) -> Result<(), ZabError> {
        self.tx_input.send(input).await.map_err(ZabError::from)
    }

    /// Shuts the worker down after it flushes in-flight appends.
    pub(crate) async fn shutdown(self) -> Result<(), ZabError> {
        self.tx_input.send(SyncInput::Shutdown).await?;
        self.worker_handle.await?;
        Ok(())
    }

    /// Worker task: FIFO batching loop.
    async fn worker_task(
        me: ServerId,
        persistence: Arc<Persistence>,
        transport: Arc<dyn Transport>,
        ack_to: ServerId,
        max_batch_size: usize,
        mut rx_input: mpsc::Receiver<SyncInput>,
    ) {
        pf_debug!(me; "sync processor task spawned, acking -> {}", ack_to);

        let mut exiting = false;
        while !exiting {
            // block for the first proposal of a batch
            let mut batch = Vec::new();
            match rx_input.recv().await {
                Some(SyncInput::Proposal { txn }) => batch.push(txn),
                Some(SyncInput::Shutdown) | None => break,
            }

            // opportunistically extend the batch until the queue drains or
            // the batch limit is hit
            while batch.len() < max_batch_size {
                match rx_input.try_recv() {
                    Ok(SyncInput::Proposal { txn }) => batch.push(txn),
                    Ok(SyncInput::Shutdown) => {
                        exiting = true;
                        break;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        exiting = true;
                        break;
                    }
                }
            }

            let mut appended = 0;
            for txn in &batch {
                if let Err(e) = persistence.append_txn(txn).await {
                    pf_error!(me; "error appending {}: {}", txn.zxid, e);
                    break;
                }
                appended += 1;
            }
            if appended == 0 {
                continue;
            }
            if let Err(e) = persistence.sync_log().await {
                pf_error!(me; "error syncing log: {}", e);
                continue;
            }

            let last_zxid = batch[appended - 1].zxid;
            transport.send(&ack_to, Message::Ack { zxid: last_zxid });
            pf_trace!(me; "synced batch of {}, acked {} -> {}",
                          appended, last_zxid, ack_to);
        }

        pf_debug!(me; "sync processor task exited");
    }
}

#[cfg(test)]
mod syncer_tests {
    use super::*;
    use crate::zxid::Zxid;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tokio::fs;

    /// Transport double that records everything sent through it.
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

    async fn fresh_dir(name: &str) -> Result<PathBuf, ZabError> {
        let dir = std::env::temp_dir().join(name);
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(dir)
    }

    fn txn(epoch: u32, xid: u64) -> Transaction {
        Transaction::new(Zxid::new(epoch, xid), 0, b"payload".to_vec())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn appends_and_acks() -> Result<(), ZabError> {
        let dir = fresh_dir("zab-test-syncer-0").await?;
        let persistence = Arc::new(Persistence::open(&dir).await?);
        let transport = Arc::new(SinkTransport::default());
        let proc = SyncProposalProcessor::new_and_setup(
            "s1:1".into(),
            persistence.clone(),
            transport.clone(),
            "leader:1".into(),
            100,
        );
        for xid in 1..=3 {
            proc.submit(SyncInput::Proposal { txn: txn(1, xid) }).await?;
        }
        proc.shutdown().await?;

        assert_eq!(persistence.latest_zxid().await, Zxid::new(1, 3));
        let sent = transport.sent.lock().unwrap();
        // all acks target the leader and the last one covers the batch tail
        assert!(!sent.is_empty());
        assert!(sent.iter().all(|(peer, _)| peer == "leader:1"));
        match &sent.last().unwrap().1 {
            Message::Ack { zxid } => assert_eq!(*zxid, Zxid::new(1, 3)),
            msg => panic!("unexpected message {:?}", msg),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flushes_before_shutdown() -> Result<(), ZabError> {
        let dir = fresh_dir("zab-test-syncer-1").await?;
        let persistence = Arc::new(Persistence::open(&dir).await?);
        let transport = Arc::new(SinkTransport::default());
        let proc = SyncProposalProcessor::new_and_setup(
            "s1:1".into(),
            persistence.clone(),
            transport.clone(),
            "s1:1".into(),
            2, // force multiple small batches
        );
        for xid in 1..=5 {
            proc.submit(SyncInput::Proposal { txn: txn(2, xid) }).await?;
        }
        proc.shutdown().await?;
        assert_eq!(persistence.latest_zxid().await, Zxid::new(2, 5));
        Ok(())
    }
}
