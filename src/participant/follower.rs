//! Follower side of the phase machine: the discovery/synchronization
//! handshake with the elected leader, the join path for uninitialized
//! replicas, and the broadcasting accepting loop.

use std::collections::HashSet;

use tokio::time::{self, Duration, Instant, MissedTickBehavior};

use crate::message::Message;
use crate::participant::{
    Incoming, Participant, Phase, Role, SendRequestTask,
};
use crate::processors::{
    CommitInput, CommitProcessor, SyncInput, SyncProposalProcessor,
};
use crate::utils::ZabError;
use crate::zxid::ServerId;

impl Participant {
    /// Follows the elected leader through discovery, synchronization, and
    /// broadcast. Any failure unwinds here, releasing round resources.
    pub(crate) async fn follow(
        &mut self,
        leader: ServerId,
    ) -> Result<(), ZabError> {
        self.role = Role::Following;
        self.elected_leader = Some(leader.clone());

        let result = self.follow_inner(&leader).await;

        self.transport.clear(&leader);
        self.elected_leader = None;
        self.role = Role::Electing;
        result
    }

    async fn follow_inner(
        &mut self,
        leader: &ServerId,
    ) -> Result<(), ZabError> {
        /* -- Discovering phase -- */
        self.change_phase_follower(Phase::Discovering).await;
        self.send_proposed_epoch(leader).await;
        self.wait_for_new_epoch(leader).await?;

        /* -- Synchronizing phase -- */
        self.change_phase_follower(Phase::Synchronizing).await;
        self.sync_with(leader).await?;
        let epoch = self.wait_for_new_leader(leader).await?;
        self.wait_for_commit(leader).await?;
        // quiescent: promised and acknowledged epochs agree again
        self.persistence.set_proposed_epoch(epoch).await?;
        // hand everything synchronized to the state machine before the
        // commit processor takes over the delivery watermark
        self.deliver_undelivered().await?;

        /* -- Broadcasting phase -- */
        self.change_phase_follower(Phase::Broadcasting).await;
        self.accepting_follower(leader, epoch).await
    }

    /// Starts from joining someone who is already in the cluster. An
    /// uninitialized replica (no stored config) surfaces `JoinFailure` if
    /// this fails; one with a stored config falls back to electing.
    pub(crate) async fn join(
        &mut self,
        seed: &ServerId,
    ) -> Result<(), ZabError> {
        self.role = Role::Following;
        pf_debug!(self.me; "joining cluster through '{}'", seed);

        let result = self.join_inner(seed).await;

        if let Some(leader) = self.elected_leader.take() {
            self.transport.clear(&leader);
        }
        self.role = Role::Electing;

        match result {
            Err(e @ (ZabError::Timeout | ZabError::BackToElection))
                if self.persistence.last_seen_config().await.is_none() =>
            {
                Err(ZabError::JoinFailure(format!(
                    "failed to join cluster: {}",
                    e
                )))
            }
            other => other,
        }
    }

    async fn join_inner(
        &mut self,
        seed: &ServerId,
    ) -> Result<(), ZabError> {
        self.transport.send(seed, Message::QueryLeader);
        let leader = match self
            .get_expected_message("QUERY_LEADER_REPLY", seed)
            .await?
        {
            Message::QueryLeaderReply { leader } => leader,
            _ => unreachable!(),
        };
        pf_debug!(self.me; "current leader is '{}'", leader);
        self.elected_leader = Some(leader.clone());

        let last_zxid = self.persistence.latest_zxid().await;
        self.transport.send(&leader, Message::Join { last_zxid });

        /* -- Synchronizing phase -- */
        self.change_phase_follower(Phase::Synchronizing).await;
        self.sync_with(&leader).await?;
        let epoch = self.wait_for_new_leader(&leader).await?;
        self.wait_for_commit(&leader).await?;
        self.persistence.set_proposed_epoch(epoch).await?;
        self.deliver_undelivered().await?;

        /* -- Broadcasting phase -- */
        self.change_phase_follower(Phase::Broadcasting).await;
        self.accepting_follower(&leader, epoch).await
    }

    /// Phase bookkeeping plus the follower-side observer callbacks.
    async fn change_phase_follower(&mut self, phase: Phase) {
        self.phase = phase;
        self.state_machine.state_changed(phase);
        if let Some(cb) = &self.callback {
            match phase {
                Phase::Discovering => {
                    let leader = self.elected_leader.as_ref().unwrap();
                    cb.follower_discovering(leader);
                }
                Phase::Synchronizing => {
                    cb.follower_synchronizing(
                        self.persistence.proposed_epoch().await,
                    );
                }
                Phase::Broadcasting => {
                    cb.follower_broadcasting(
                        self.persistence.ack_epoch().await,
                    );
                }
                Phase::Electing => cb.electing(),
            }
        }
    }

    /// Sends PROPOSED_EPOCH to the prospective leader.
    async fn send_proposed_epoch(&mut self, leader: &ServerId) {
        let msg = Message::ProposedEpoch {
            proposed_epoch: self.persistence.proposed_epoch().await,
            ack_epoch: self.persistence.ack_epoch().await,
            config: self.persistence.last_seen_config().await,
        };
        self.transport.send(leader, msg);
    }

    /// Waits for NEW_EPOCH from the leader, persists the raised promise,
    /// and acks with our acked epoch and last zxid.
    async fn wait_for_new_epoch(
        &mut self,
        leader: &ServerId,
    ) -> Result<(), ZabError> {
        let epoch = match self.get_expected_message("NEW_EPOCH", leader).await?
        {
            Message::NewEpoch { epoch } => epoch,
            _ => unreachable!(),
        };
        let proposed = self.persistence.proposed_epoch().await;
        if epoch < proposed {
            return Err(ZabError::Protocol(format!(
                "new epoch {} from '{}' smaller than promised {}",
                epoch, leader, proposed
            )));
        }
        self.persistence.set_proposed_epoch(epoch).await?;
        pf_debug!(self.me; "received new epoch proposal {} <- '{}'",
                           epoch, leader);

        self.transport.send(
            leader,
            Message::AckEpoch {
                ack_epoch: self.persistence.ack_epoch().await,
                last_zxid: self.persistence.latest_zxid().await,
            },
        );
        Ok(())
    }

    /// Waits for NEW_LEADER, makes the synchronized log durable, records
    /// the acknowledged epoch (and any shipped membership), and acks with
    /// our last zxid. Returns the established epoch.
    async fn wait_for_new_leader(
        &mut self,
        leader: &ServerId,
    ) -> Result<u32, ZabError> {
        pf_debug!(self.me; "waiting for NEW_LEADER from '{}'", leader);
        let (epoch, config) =
            match self.get_expected_message("NEW_LEADER", leader).await? {
                Message::NewLeader { epoch, config } => (epoch, config),
                _ => unreachable!(),
            };

        // everything synchronized must be durable before the ack makes
        // this replica count toward the new epoch's quorum
        self.persistence.sync_log().await?;
        self.persistence.set_ack_epoch(epoch).await?;
        if let Some(config) = config {
            self.persistence.set_last_seen_config(&config).await?;
        }

        self.transport.send(
            leader,
            Message::Ack {
                zxid: self.persistence.latest_zxid().await,
            },
        );
        Ok(epoch)
    }

    /// Waits for the establishment COMMIT; its zxid must match our log end.
    async fn wait_for_commit(
        &mut self,
        leader: &ServerId,
    ) -> Result<(), ZabError> {
        pf_debug!(self.me; "waiting for COMMIT from '{}'", leader);
        let zxid = match self.get_expected_message("COMMIT", leader).await? {
            Message::Commit { zxid } => zxid,
            _ => unreachable!(),
        };
        let last_zxid = self.persistence.latest_zxid().await;
        if zxid != last_zxid {
            return Err(ZabError::Protocol(format!(
                "commit zxid {} does not match log end {}",
                zxid, last_zxid
            )));
        }
        Ok(())
    }

    /// The follower's broadcasting loop: feed the sync and commit
    /// processors, answer heartbeats, watch the leader's liveness.
    async fn accepting_follower(
        &mut self,
        leader: &ServerId,
        epoch: u32,
    ) -> Result<(), ZabError> {
        if let Some(config) = self.persistence.last_seen_config().await {
            self.state_machine
                .cluster_change(config.peers.into_iter().collect::<HashSet<_>>());
        }
        self.state_machine.following(leader);

        let sync_proc = SyncProposalProcessor::new_and_setup(
            self.me.clone(),
            self.persistence.clone(),
            self.transport.clone(),
            leader.clone(),
            self.config.sync_max_batch_size,
        );
        let commit_proc = CommitProcessor::new_and_setup(
            self.me.clone(),
            self.last_delivered,
            self.state_machine.clone(),
        );
        let rx_request = match self.rx_request.take() {
            Some(rx_request) => rx_request,
            None => {
                return logged_err!(self.me; "request channel lost in a \
                                             prior round");
            }
        };
        let send_task = SendRequestTask::spawn(
            self.me.clone(),
            leader.clone(),
            self.transport.clone(),
            rx_request,
        );

        let mut snap_interval = time::interval(Duration::from_secs(
            if self.config.snapshot_interval_s > 0 {
                self.config.snapshot_interval_s
            } else {
                3600 // dummy non-zero value to make `time::interval` happy
            },
        ));
        snap_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // last time any message came in over the leader's connection;
        // traffic from other peers must not extend its liveness
        let mut last_heartbeat = Instant::now();

        let result = loop {
            tokio::select! {
                _ = snap_interval.tick(),
                        if self.config.snapshot_interval_s > 0 => {
                    if let Err(e) = self.take_snapshot(&commit_proc).await {
                        pf_error!(self.me; "error taking snapshot: {}", e);
                    }
                },

                incoming = self.get_incoming() => {
                    let incoming = match incoming {
                        Ok(incoming) => incoming,
                        Err(e) => break Err(e),
                    };
                    let (from, msg) = match incoming {
                        Incoming::Lost { peer } => {
                            if &peer == leader {
                                pf_debug!(self.me; "lost elected leader '{}'",
                                                   peer);
                                break Err(ZabError::BackToElection);
                            }
                            self.transport.clear(&peer);
                            continue;
                        }
                        Incoming::Msg { from, msg } => (from, msg),
                    };

                    if msg == Message::QueryLeader {
                        self.transport.send(&from, Message::QueryLeaderReply {
                            leader: leader.clone(),
                        });
                        continue;
                    }

                    if &from == leader {
                        last_heartbeat = Instant::now();
                    } else {
                        if last_heartbeat.elapsed() >= self.timeout {
                            pf_warn!(self.me; "nothing from leader '{}' for \
                                               {:?}, back to electing",
                                              leader, self.timeout);
                            break Err(ZabError::Timeout);
                        }
                        if from != self.me {
                            pf_debug!(self.me; "unexpected {} <- '{}', \
                                                ignored", msg.kind(), from);
                            continue;
                        }
                    }

                    match msg {
                        Message::Proposal { txn } => {
                            if txn.zxid.epoch != epoch {
                                break Err(ZabError::Protocol(format!(
                                    "proposal epoch {} in epoch {}",
                                    txn.zxid.epoch, epoch
                                )));
                            }
                            let res = sync_proc
                                .submit(SyncInput::Proposal {
                                    txn: txn.clone(),
                                })
                                .await;
                            if let Err(e) = res {
                                break Err(e);
                            }
                            if let Err(e) = commit_proc
                                .submit(CommitInput::Proposal { txn })
                                .await
                            {
                                break Err(e);
                            }
                        }
                        Message::Commit { zxid } => {
                            if let Err(e) = commit_proc
                                .submit(CommitInput::Commit { zxid })
                                .await
                            {
                                break Err(e);
                            }
                        }
                        Message::Heartbeat => {
                            self.transport.send(&from, Message::Heartbeat);
                        }
                        Message::ShutDown => {
                            pf_info!(self.me; "told to shut down");
                            break Err(ZabError::LeftCluster);
                        }
                        msg => {
                            pf_warn!(self.me; "unexpected {} <- '{}', \
                                               ignored", msg.kind(), from);
                        }
                    }
                },
            }
        };

        // teardown: stop the forwarder, drain the processors, adopt the
        // final delivery watermark
        self.rx_request = send_task.shutdown(&self.me).await;
        if let Err(e) = sync_proc.shutdown().await {
            pf_error!(self.me; "error shutting down sync processor: {}", e);
        }
        match commit_proc.shutdown().await {
            Ok(last_delivered) => self.last_delivered = last_delivered,
            Err(e) => {
                pf_error!(self.me; "error shutting down commit processor: {}",
                                   e);
            }
        }
        result
    }
}

