//! Pre-processor (leader side): assigns the next zxid to each accepted
//! client request and fans the resulting PROPOSAL out to all followers plus
//! the leader itself (whose loopback copy feeds its own sync and commit
//! processors like any follower's).

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::message::Message;
use crate::processors::PROC_QUEUE_CAP;
use crate::transport::Transport;
use crate::utils::ZabError;
use crate::zxid::{ServerId, Transaction, Zxid, TXN_TYPE_APP};

/// Input to the pre-processor.
#[derive(Debug)]
pub(crate) enum PrepInput {
    /// An accepted client request body.
    Request { body: Vec<u8> },

    /// The broadcast membership changed (a joiner was admitted).
    SetFollowers { followers: HashSet<ServerId> },

    /// Poison pill: exit.
    Shutdown,
}

/// Pre-processor module.
pub(crate) struct PreProcessor {
    /// Sender side of the input channel.
    tx_input: mpsc::Sender<PrepInput>,

    /// Join handle of the worker task.
    worker_handle: JoinHandle<()>,
}

impl PreProcessor {
    /// Creates a pre-processor for the given established epoch and spawns
    /// its worker task. Zxid counters start at 1 within the epoch.
    pub(crate) fn new_and_setup(
        me: ServerId,
        epoch: u32,
        followers: HashSet<ServerId>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (tx_input, rx_input) = mpsc::channel(PROC_QUEUE_CAP);
        let worker_handle = tokio::spawn(Self::worker_task(
            me, epoch, followers, transport, rx_input,
        ));
        PreProcessor {
            tx_input,
            worker_handle,
        }
    }

    /// Submits an input, waiting if the queue is full.
    pub(crate) async fn submit(
        &self,
        input: PrepInput,
    ) -> Result<(), ZabError> {
        self.tx_input.send(input).await.map_err(ZabError::from)
    }

    /// Shuts the worker down.
    pub(crate) async fn shutdown(self) -> Result<(), ZabError> {
        self.tx_input.send(PrepInput::Shutdown).await?;
        self.worker_handle.await?;
        Ok(())
    }

    /// Worker task: zxid assignment and proposal fan-out.
    async fn worker_task(
        me: ServerId,
        epoch: u32,
        mut followers: HashSet<ServerId>,
        transport: Arc<dyn Transport>,
        mut rx_input: mpsc::Receiver<PrepInput>,
    ) {
        pf_debug!(me; "pre-processor task spawned for epoch {}", epoch);

        let mut counter: u64 = 0;
        while let Some(input) = rx_input.recv().await {
            match input {
                PrepInput::Request { body } => {
                    counter += 1;
                    let txn = Transaction::new(
                        Zxid::new(epoch, counter),
                        TXN_TYPE_APP,
                        body,
                    );
                    pf_trace!(me; "proposing {}", txn.zxid);
                    let msg = Message::Proposal { txn };
                    for peer in followers.iter() {
                        transport.send(peer, msg.clone());
                    }
                    transport.send(&me, msg);
                }
                PrepInput::SetFollowers {
                    followers: new_followers,
                } => {
                    followers = new_followers;
                }
                PrepInput::Shutdown => break,
            }
        }

        pf_debug!(me; "pre-processor task exited");
    }
}

#[cfg(test)]
mod prep_tests {
    use super::*;
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

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn assigns_consecutive_zxids() -> Result<(), ZabError> {
        let transport = Arc::new(SinkTransport::default());
        let followers: HashSet<ServerId> = ["s2:2".to_string()].into();
        let proc = PreProcessor::new_and_setup(
            "s1:1".into(),
            3,
            followers,
            transport.clone(),
        );
        proc.submit(PrepInput::Request { body: b"x".to_vec() }).await?;
        proc.submit(PrepInput::Request { body: b"y".to_vec() }).await?;
        proc.shutdown().await?;

        let sent = transport.sent.lock().unwrap();
        // each request fans out to the follower and to self
        assert_eq!(sent.len(), 4);
        let zxids_to_self: Vec<Zxid> = sent
            .iter()
            .filter(|(peer, _)| peer == "s1:1")
            .map(|(_, msg)| match msg {
                Message::Proposal { txn } => txn.zxid,
                msg => panic!("unexpected message {:?}", msg),
            })
            .collect();
        assert_eq!(zxids_to_self, vec![Zxid::new(3, 1), Zxid::new(3, 2)]);
        Ok(())
    }
}
