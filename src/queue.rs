//! Single bounded inbound message queue feeding the participant driver.
//!
//! The transport's per-peer messenger tasks and the election oracle hold
//! cloned sender handles; the driver is the only consumer. Backpressure on
//! the bounded channel is what slows a fast leader down to the speed of this
//! replica's intake.

use tokio::sync::mpsc;

use crate::message::MessageTuple;
use crate::utils::ZabError;

/// Capacity of the inbound queue.
pub(crate) const MSG_QUEUE_CAP: usize = 16384;

/// Producer handle to the inbound queue.
#[derive(Debug, Clone)]
pub struct MessageQueueTx {
    tx: mpsc::Sender<MessageTuple>,
}

impl MessageQueueTx {
    /// Enqueues a tuple, waiting if the queue is full.
    pub async fn push(&self, tuple: MessageTuple) -> Result<(), ZabError> {
        self.tx.send(tuple).await.map_err(ZabError::from)
    }

    /// Enqueues a tuple from sync context, dropping it if the queue is full.
    /// Used by the transport where blocking a socket task on a stalled
    /// driver is worse than dropping (the channel is best-effort anyway).
    pub fn push_or_drop(&self, tuple: MessageTuple) {
        if let Err(e) = self.tx.try_send(tuple) {
            pf_warn!("queue"; "inbound queue full, dropping: {}", e);
        }
    }
}

/// Consumer side of the inbound queue, owned by the participant driver.
#[derive(Debug)]
pub struct MessageQueue {
    rx: mpsc::Receiver<MessageTuple>,
    tx: mpsc::Sender<MessageTuple>,
}

impl MessageQueue {
    /// Creates a new bounded inbound queue.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(MSG_QUEUE_CAP);
        MessageQueue { rx, tx }
    }

    /// Returns a new producer handle.
    pub fn sender(&self) -> MessageQueueTx {
        MessageQueueTx {
            tx: self.tx.clone(),
        }
    }

    /// Receives the next tuple; `None` only if all senders are gone.
    pub async fn recv(&mut self) -> Option<MessageTuple> {
        self.rx.recv().await
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}
