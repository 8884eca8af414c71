//! Core of a ZooKeeper-style atomic broadcast (ZAB) replication engine:
//! the per-participant phase machine driving leader election, discovery,
//! synchronization and broadcast; the crash-safe transaction log and epoch
//! persistence; and the commit pipeline turning a quorum-ordered proposal
//! stream into in-order deliveries to an application state machine.

#[macro_use]
mod utils;

mod elect;
mod message;
mod participant;
mod processors;
mod queue;
mod statemach;
mod storage;
mod transport;
mod zxid;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use participant::Participant;
use queue::MessageQueue;

pub use elect::{ElectionOracle, FixedOracle, LowestIdOracle};
pub use message::{Message, MessageTuple};
pub use participant::{Phase, ZabConfig};
pub use statemach::{
    KvCommand, MemoryKv, StateChangeCallback, StateMachine,
};
pub use storage::{LogIter, Persistence, SegmentLog};
pub use transport::{TcpTransport, Transport};
pub use utils::ZabError;
pub use zxid::{ClusterConfig, ServerId, Transaction, Zxid, TXN_TYPE_APP};

/// Capacity of the client request intake queue.
const REQUEST_QUEUE_CAP: usize = 4096;

/// Handle to a running replication participant. Dropping the handle does
/// not stop the participant; use `shutdown` (or await `wait` for a natural
/// exit such as cluster removal).
pub struct Zab {
    /// My server ID.
    me: ServerId,

    /// Client request intake.
    tx_request: mpsc::Sender<Vec<u8>>,

    /// Cancellation signal to the participant driver.
    tx_cancel: watch::Sender<bool>,

    /// Join handle of the participant driver task.
    driver_handle: JoinHandle<Result<(), ZabError>>,
}

impl Zab {
    /// Boots a participant: opens (and locks) the log directory, binds the
    /// TCP transport, and spawns the driver task.
    pub async fn start(
        config: ZabConfig,
        state_machine: Arc<dyn StateMachine>,
        oracle: Arc<dyn ElectionOracle>,
    ) -> Result<Zab, ZabError> {
        Self::start_with_callback(config, state_machine, oracle, None).await
    }

    /// Like `start`, with a phase-transition observer attached.
    pub async fn start_with_callback(
        config: ZabConfig,
        state_machine: Arc<dyn StateMachine>,
        oracle: Arc<dyn ElectionOracle>,
        callback: Option<Arc<dyn StateChangeCallback>>,
    ) -> Result<Zab, ZabError> {
        config.validate()?;
        let me = config.server_id.clone();

        let persistence =
            Arc::new(Persistence::open(Path::new(&config.logdir)).await?);
        let queue = MessageQueue::new();
        let transport: Arc<dyn Transport> = Arc::new(
            TcpTransport::new_and_setup(me.clone(), queue.sender()).await?,
        );
        let (tx_request, rx_request) = mpsc::channel(REQUEST_QUEUE_CAP);
        let (tx_cancel, rx_cancel) = watch::channel(false);

        let mut participant = Participant::new(
            config,
            persistence,
            transport,
            state_machine,
            oracle,
            callback,
            queue,
            rx_request,
        );
        let driver_handle =
            tokio::spawn(async move { participant.run(rx_cancel).await });
        pf_info!(me; "participant started");

        Ok(Zab {
            me,
            tx_request,
            tx_cancel,
            driver_handle,
        })
    }

    /// My server ID.
    pub fn id(&self) -> &ServerId {
        &self.me
    }

    /// Enqueues an opaque client request for replication. It will be
    /// forwarded to the current leader, assigned a zxid, and eventually
    /// delivered on every replica.
    pub async fn send(&self, body: Vec<u8>) -> Result<(), ZabError> {
        self.tx_request.send(body).await.map_err(ZabError::from)
    }

    /// Cancels the participant and waits for it to unwind.
    pub async fn shutdown(self) -> Result<(), ZabError> {
        let _ = self.tx_cancel.send(true);
        match self.driver_handle.await? {
            Ok(()) | Err(ZabError::Cancelled) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Waits for the participant to exit on its own (cluster removal,
    /// corruption, join failure).
    pub async fn wait(self) -> Result<(), ZabError> {
        self.driver_handle.await?
    }
}
