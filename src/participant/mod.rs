//! The participant phase machine: one driver task walking ELECTING ->
//! DISCOVERING -> SYNCHRONIZING -> BROADCASTING in either the leader or the
//! follower role, restarting the round on any recoverable failure.

mod follower;
mod leader;
mod sync;

use std::sync::Arc;

use serde::Deserialize;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::elect::ElectionOracle;
use crate::message::{Message, MessageTuple};
use crate::processors::CommitProcessor;
use crate::queue::MessageQueue;
use crate::statemach::{StateChangeCallback, StateMachine};
use crate::storage::Persistence;
use crate::transport::Transport;
use crate::utils::{Timer, ZabError};
use crate::zxid::{ClusterConfig, ServerId, Zxid};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ZabConfig {
    /// My server id, `host:port`; doubles as the transport bind address.
    pub server_id: String,

    /// Ids of all ensemble members including self. Empty means this replica
    /// is uninitialized and must join through `join_peer`.
    pub servers: Vec<ServerId>,

    /// Path to the durable log directory.
    pub logdir: String,

    /// Heartbeat / election timeout in millisecs.
    pub timeout_ms: u64,

    /// Maximum proposals batched per log sync.
    pub sync_max_batch_size: usize,

    /// Snapshot self-triggering interval in secs. 0 means never snapshot
    /// autonomously.
    pub snapshot_interval_s: u64,

    /// A member of an existing cluster to join through, for replicas not in
    /// `servers`.
    pub join_peer: Option<ServerId>,
}

impl Default for ZabConfig {
    fn default() -> Self {
        ZabConfig {
            server_id: String::new(),
            servers: vec![],
            logdir: "/tmp/zab.logdir".into(),
            timeout_ms: 5000,
            sync_max_batch_size: 1000,
            snapshot_interval_s: 0,
            join_peer: None,
        }
    }
}

impl ZabConfig {
    /// Sanity-checks the configuration.
    pub fn validate(&self) -> Result<(), ZabError> {
        if self.server_id.parse::<std::net::SocketAddr>().is_err() {
            return Err(ZabError::msg(format!(
                "server_id '{}' is not of host:port form",
                self.server_id
            )));
        }
        for server in &self.servers {
            if server.parse::<std::net::SocketAddr>().is_err() {
                return Err(ZabError::msg(format!(
                    "server '{}' is not of host:port form",
                    server
                )));
            }
        }
        if !self.servers.is_empty()
            && !self.servers.contains(&self.server_id)
        {
            return Err(ZabError::msg(format!(
                "server_id '{}' not in servers list",
                self.server_id
            )));
        }
        if self.servers.is_empty() && self.join_peer.is_none() {
            return Err(ZabError::msg(
                "neither a servers list nor a join_peer given",
            ));
        }
        if self.timeout_ms < 100 {
            return Err(ZabError::msg(format!(
                "invalid timeout_ms {}",
                self.timeout_ms
            )));
        }
        if self.sync_max_batch_size == 0 {
            return Err(ZabError::msg("invalid sync_max_batch_size 0"));
        }
        Ok(())
    }
}

/// Phase of the protocol a participant is currently in.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Phase {
    Electing,
    Discovering,
    Synchronizing,
    Broadcasting,
}

/// Role a participant currently acts in.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum Role {
    Electing,
    Leading,
    Following,
}

/// What `get_incoming` hands back to the phase logic: a peer message, or a
/// lost connection that the call site decides how to treat.
#[derive(Debug)]
pub(crate) enum Incoming {
    Msg { from: ServerId, msg: Message },
    Lost { peer: ServerId },
}

/// The participant: owns the durable state, the inbound queue, and the
/// per-round processor pipelines.
pub(crate) struct Participant {
    /// My server ID.
    pub(crate) me: ServerId,

    /// Configuration parameters struct.
    pub(crate) config: ZabConfig,

    /// Durable state (epochs, config, snapshot, log).
    pub(crate) persistence: Arc<Persistence>,

    /// Transport handle, shared with the processors.
    pub(crate) transport: Arc<dyn Transport>,

    /// Application state machine.
    pub(crate) state_machine: Arc<dyn StateMachine>,

    /// Elected-leader oracle.
    pub(crate) oracle: Arc<dyn ElectionOracle>,

    /// Optional phase-transition observer.
    pub(crate) callback: Option<Arc<dyn StateChangeCallback>>,

    /// Inbound message queue (consumer side).
    pub(crate) queue: MessageQueue,

    /// Timer bounding each inbound queue poll.
    pub(crate) poll_timer: Timer,

    /// Client request intake; lent to the request forwarder task each round.
    pub(crate) rx_request: Option<mpsc::Receiver<Vec<u8>>>,

    /// Current phase, for logging and `state_changed`.
    pub(crate) phase: Phase,

    /// Current role, drives `get_incoming` message filtering.
    pub(crate) role: Role,

    /// Leader of the current round, if one is decided.
    pub(crate) elected_leader: Option<ServerId>,

    /// Highest zxid delivered to the state machine.
    pub(crate) last_delivered: Zxid,

    /// Election round counter fed to the oracle.
    pub(crate) round: u64,

    /// Cached `config.timeout_ms`.
    pub(crate) timeout: Duration,
}

impl Participant {
    /// Creates the participant state. The transport must already feed the
    /// given queue.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ZabConfig,
        persistence: Arc<Persistence>,
        transport: Arc<dyn Transport>,
        state_machine: Arc<dyn StateMachine>,
        oracle: Arc<dyn ElectionOracle>,
        callback: Option<Arc<dyn StateChangeCallback>>,
        queue: MessageQueue,
        rx_request: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        let me = config.server_id.clone();
        let timeout = Duration::from_millis(config.timeout_ms);
        Participant {
            me,
            config,
            persistence,
            transport,
            state_machine,
            oracle,
            callback,
            queue,
            poll_timer: Timer::new(),
            rx_request: Some(rx_request),
            phase: Phase::Electing,
            role: Role::Electing,
            elected_leader: None,
            last_delivered: Zxid::NULL,
            round: 0,
            timeout,
        }
    }

    /// Runs the participant until cancelled, shut down by the cluster, or
    /// hit by unrecoverable corruption. Recoverable round failures loop back
    /// to electing.
    pub(crate) async fn run(
        &mut self,
        mut rx_cancel: watch::Receiver<bool>,
    ) -> Result<(), ZabError> {
        // restore a stored snapshot before anything can be delivered
        if let Some((zxid, data)) = self.persistence.load_snapshot().await? {
            self.state_machine.restore(&data)?;
            self.last_delivered = zxid;
            pf_info!(self.me; "restored snapshot up to {}", zxid);
        }

        // very first boot of a configured ensemble member seeds the stored
        // membership from the static configuration
        if self.persistence.last_seen_config().await.is_none()
            && !self.config.servers.is_empty()
        {
            let cfg =
                ClusterConfig::new(Zxid::NULL, self.config.servers.clone());
            self.persistence.set_last_seen_config(&cfg).await?;
        }

        loop {
            let outcome = tokio::select! {
                res = self.one_round() => res,
                _ = rx_cancel.changed() => Err(ZabError::Cancelled),
            };

            let err = match outcome {
                Ok(()) => continue,
                Err(err) => err,
            };
            if err.restarts_round() {
                pf_debug!(self.me; "round failed ({}), back to electing", err);
                continue;
            }

            let epoch = self.persistence.ack_epoch().await;
            let last_zxid = self.persistence.latest_zxid().await;
            match err {
                ZabError::Cancelled => {
                    pf_info!(self.me; "participant cancelled in phase {:?}, \
                                       role {:?}, epoch {}, last zxid {}",
                                      self.phase, self.role, epoch, last_zxid);
                }
                _ => {
                    pf_error!(self.me; "participant exiting ({}) in phase \
                                        {:?}, role {:?}, epoch {}, last zxid {}",
                                       err, self.phase, self.role, epoch,
                                       last_zxid);
                }
            }
            return Err(err);
        }
    }

    /// One election-to-broadcast round.
    async fn one_round(&mut self) -> Result<(), ZabError> {
        self.phase = Phase::Electing;
        self.role = Role::Electing;
        self.elected_leader = None;
        self.state_machine.state_changed(Phase::Electing);
        if let Some(cb) = &self.callback {
            cb.electing();
        }

        if self.persistence.last_seen_config().await.is_none() {
            // uninitialized replica: join an existing cluster through a seed
            let seed = self.config.join_peer.clone().ok_or_else(|| {
                ZabError::JoinFailure(
                    "no stored configuration and no join peer".into(),
                )
            })?;
            return self.join(&seed).await;
        }

        let round = self.round;
        self.round += 1;
        let leader = self.oracle.elect(round).await?;
        pf_info!(self.me; "round {}: elected leader '{}'", round, leader);

        if leader == self.me {
            self.lead().await
        } else {
            self.follow(leader).await
        }
    }

    /// Pulls the next tuple off the inbound queue, enforcing the poll
    /// deadline, the go-back sentinel, and role-based filtering of stray
    /// messages. Lost connections are returned for the call site to judge.
    pub(crate) async fn get_incoming(&mut self) -> Result<Incoming, ZabError> {
        loop {
            self.poll_timer.kickoff(self.timeout)?;
            let tuple = tokio::select! {
                tuple = self.queue.recv() => match tuple {
                    Some(tuple) => tuple,
                    None => {
                        return logged_err!(self.me; "inbound queue closed");
                    }
                },
                () = self.poll_timer.timeout() => {
                    return Err(ZabError::Timeout);
                },
            };
            self.poll_timer.cancel()?;

            match tuple {
                MessageTuple::GoBack => return Err(ZabError::BackToElection),
                MessageTuple::Disconnected { peer } => {
                    return Ok(Incoming::Lost { peer });
                }
                MessageTuple::Message { from, msg } => {
                    if self.role == Role::Following
                        && matches!(msg, Message::ProposedEpoch { .. })
                    {
                        // a peer probing for a leader picked us; closing the
                        // connection helps it look elsewhere faster
                        pf_debug!(self.me; "got PROPOSED_EPOCH while \
                                            following, clearing '{}'", from);
                        self.transport.clear(&from);
                        continue;
                    }
                    if self.role == Role::Leading
                        && matches!(
                            msg,
                            Message::NewEpoch { .. }
                                | Message::NewLeader { .. }
                        )
                    {
                        // someone else believes it leads; cut the connection
                        // so its round fails fast
                        pf_debug!(self.me; "got {} while leading, clearing \
                                            '{}'", msg.kind(), from);
                        self.transport.clear(&from);
                        continue;
                    }
                    return Ok(Incoming::Msg { from, msg });
                }
            }
        }
    }

    /// Like `get_incoming`, but losing a peer the round depends on unwinds
    /// to election; other lost peers are cleared and skipped.
    pub(crate) async fn get_message_guarding<F>(
        &mut self,
        critical: F,
    ) -> Result<(ServerId, Message), ZabError>
    where
        F: Fn(&ServerId) -> bool,
    {
        loop {
            match self.get_incoming().await? {
                Incoming::Msg { from, msg } => return Ok((from, msg)),
                Incoming::Lost { peer } => {
                    if critical(&peer) {
                        pf_debug!(self.me; "lost peer '{}' this round \
                                            depends on", peer);
                        return Err(ZabError::BackToElection);
                    }
                    self.transport.clear(&peer);
                }
            }
        }
    }

    /// Loops `get_message_guarding` until a message of the wanted kind
    /// arrives from the wanted peer, discarding everything else.
    pub(crate) async fn get_expected_message(
        &mut self,
        kind: &'static str,
        from_peer: &ServerId,
    ) -> Result<Message, ZabError> {
        loop {
            let (from, msg) =
                self.get_message_guarding(|p| p == from_peer).await?;
            if &from == from_peer && msg.kind() == kind {
                return Ok(msg);
            }
            pf_debug!(self.me; "discarding {} <- '{}' while expecting {} \
                                <- '{}'", msg.kind(), from, kind, from_peer);
        }
    }

    /// Delivers all log entries beyond the delivery watermark straight to
    /// the state machine. Used at the end of synchronization, before the
    /// commit processor takes over.
    pub(crate) async fn deliver_undelivered(&mut self) -> Result<(), ZabError> {
        let txns = self.persistence.txns_after(self.last_delivered).await?;
        for txn in txns {
            pf_trace!(self.me; "delivering {} from log", txn.zxid);
            self.state_machine.deliver(&txn);
            self.last_delivered = txn.zxid;
        }
        Ok(())
    }

    /// Takes a snapshot at the commit processor's current watermark and
    /// compacts the log, if delivery has advanced past the last snapshot.
    pub(crate) async fn take_snapshot(
        &self,
        commit_proc: &CommitProcessor,
    ) -> Result<(), ZabError> {
        let watermark = commit_proc.last_delivered();
        if watermark <= self.persistence.snapshot_watermark().await {
            return Ok(());
        }
        let data = self.state_machine.save()?;
        self.persistence.store_snapshot(watermark, data).await?;
        pf_info!(self.me; "took snapshot up to {}", watermark);
        Ok(())
    }
}

/// Per-round task forwarding client request bodies to the current leader.
/// Hands the request receiver back on shutdown so the next round can lend
/// it out again.
pub(crate) struct SendRequestTask {
    tx_stop: watch::Sender<bool>,
    handle: JoinHandle<mpsc::Receiver<Vec<u8>>>,
}

impl SendRequestTask {
    /// Spawns the forwarder for this round's leader.
    pub(crate) fn spawn(
        me: ServerId,
        leader: ServerId,
        transport: Arc<dyn Transport>,
        mut rx_request: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        let (tx_stop, mut rx_stop) = watch::channel(false);
        let handle = tokio::spawn(async move {
            pf_debug!(me; "request forwarder spawned -> '{}'", leader);
            loop {
                tokio::select! {
                    _ = rx_stop.changed() => break,
                    body = rx_request.recv() => {
                        match body {
                            Some(body) => transport
                                .send(&leader, Message::Request { body }),
                            None => break, // handle dropped, engine going down
                        }
                    }
                }
            }
            pf_debug!(me; "request forwarder exited");
            rx_request
        });
        SendRequestTask { tx_stop, handle }
    }

    /// Stops the forwarder and reclaims the request receiver.
    pub(crate) async fn shutdown(
        self,
        me: &ServerId,
    ) -> Option<mpsc::Receiver<Vec<u8>>> {
        let _ = self.tx_stop.send(true);
        match self.handle.await {
            Ok(rx_request) => Some(rx_request),
            Err(e) => {
                pf_error!(me; "request forwarder task lost: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod config_validate_tests {
    use super::*;

    fn valid_config() -> ZabConfig {
        ZabConfig {
            server_id: "127.0.0.1:7001".into(),
            servers: vec![
                "127.0.0.1:7001".into(),
                "127.0.0.1:7002".into(),
                "127.0.0.1:7003".into(),
            ],
            logdir: "/tmp/zab-test".into(),
            ..Default::default()
        }
    }

    #[test]
    fn validate_ok() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_bad_id() {
        let mut config = valid_config();
        config.server_id = "not-an-address".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_id_not_member() {
        let mut config = valid_config();
        config.server_id = "127.0.0.1:7009".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_joiner_needs_seed() {
        let mut config = valid_config();
        config.servers.clear();
        assert!(config.validate().is_err());
        config.join_peer = Some("127.0.0.1:7001".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_bad_timeout() {
        let mut config = valid_config();
        config.timeout_ms = 10;
        assert!(config.validate().is_err());
    }
}
