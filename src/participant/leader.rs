//! Leader side of the phase machine: epoch establishment over a quorum of
//! promises, initial-history selection and per-follower alignment, and the
//! broadcasting accepting loop with its processor pipeline.

use std::collections::{HashMap, HashSet};

use tokio::time::{self, Duration, Instant, MissedTickBehavior};

use crate::message::Message;
use crate::participant::sync::send_sync;
use crate::participant::{
    Incoming, Participant, Phase, Role, SendRequestTask,
};
use crate::processors::{
    AckInput, AckProcessor, CommitInput, CommitProcessor, PrepInput,
    PreProcessor, SyncInput, SyncProposalProcessor,
};
use crate::utils::ZabError;
use crate::zxid::{ClusterConfig, ServerId, Zxid};

impl Participant {
    /// Leads one round: establish a higher epoch over a quorum, align every
    /// responder to the freshest history, then broadcast.
    pub(crate) async fn lead(&mut self) -> Result<(), ZabError> {
        self.role = Role::Leading;
        self.elected_leader = Some(self.me.clone());

        let result = self.lead_inner().await;

        self.elected_leader = None;
        self.role = Role::Electing;
        result
    }

    async fn lead_inner(&mut self) -> Result<(), ZabError> {
        /* -- Discovering phase -- */
        self.change_phase_leader(Phase::Discovering, 0);
        let mut config = match self.persistence.last_seen_config().await {
            Some(config) => config,
            None => {
                return logged_err!(self.me; "leading without a stored \
                                             configuration");
            }
        };

        // wait until a quorum (counting self) has promised its epoch
        let mut promises: HashMap<ServerId, u32> = HashMap::new();
        promises.insert(
            self.me.clone(),
            self.persistence.proposed_epoch().await,
        );
        while promises.len() < config.majority() {
            let (from, msg) = self
                .get_message_guarding(|p| promises.contains_key(p))
                .await?;
            match msg {
                Message::ProposedEpoch {
                    proposed_epoch,
                    config: follower_config,
                    ..
                } => {
                    pf_debug!(self.me; "promise f.p {} <- '{}'",
                                       proposed_epoch, from);
                    promises.insert(from, proposed_epoch);
                    if let Some(follower_config) = follower_config {
                        if follower_config.version > config.version {
                            self.persistence
                                .set_last_seen_config(&follower_config)
                                .await?;
                            config = follower_config;
                        }
                    }
                }
                msg => {
                    pf_debug!(self.me; "discarding {} <- '{}' during \
                                        discovery", msg.kind(), from);
                }
            }
        }

        // e' = max over all promised epochs, plus one
        let new_epoch = promises.values().copied().max().unwrap_or(0) + 1;
        self.persistence.set_proposed_epoch(new_epoch).await?;
        for peer in promises.keys().filter(|p| **p != self.me) {
            self.transport
                .send(peer, Message::NewEpoch { epoch: new_epoch });
        }
        pf_info!(self.me; "proposing new epoch {} to {} responders",
                          new_epoch, promises.len() - 1);

        // every responder must acknowledge the new epoch, reporting its
        // acked epoch and log end
        let mut epoch_acks: HashMap<ServerId, (u32, Zxid)> = HashMap::new();
        epoch_acks.insert(
            self.me.clone(),
            (
                self.persistence.ack_epoch().await,
                self.persistence.latest_zxid().await,
            ),
        );
        while epoch_acks.len() < promises.len() {
            let (from, msg) = self
                .get_message_guarding(|p| promises.contains_key(p))
                .await?;
            match msg {
                Message::AckEpoch {
                    ack_epoch,
                    last_zxid,
                } => {
                    epoch_acks.insert(from, (ack_epoch, last_zxid));
                }
                Message::ProposedEpoch { proposed_epoch, .. } => {
                    // a straggler still gets folded into this round
                    pf_debug!(self.me; "late promise f.p {} <- '{}'",
                                       proposed_epoch, from);
                    promises.insert(from.clone(), proposed_epoch);
                    self.transport
                        .send(&from, Message::NewEpoch { epoch: new_epoch });
                }
                msg => {
                    pf_debug!(self.me; "discarding {} <- '{}' during \
                                        discovery", msg.kind(), from);
                }
            }
        }

        /* -- Synchronizing phase -- */
        self.change_phase_leader(Phase::Synchronizing, new_epoch);

        // the freshest (f.a, last zxid) pair owns the initial history;
        // ties go to the smallest server id
        let mut ids: Vec<ServerId> = epoch_acks.keys().cloned().collect();
        ids.sort();
        let mut owner = ids[0].clone();
        for id in &ids[1..] {
            if epoch_acks[id] > epoch_acks[&owner] {
                owner = id.clone();
            }
        }
        let (owner_epoch, owner_zxid) = epoch_acks[&owner];
        pf_info!(self.me; "initial history owner '{}' at f.a {}, zxid {}",
                          owner, owner_epoch, owner_zxid);
        if let Some(cb) = &self.callback {
            cb.initial_history_owner(&owner, owner_epoch, owner_zxid);
        }

        if owner != self.me {
            let own_last = self.persistence.latest_zxid().await;
            self.transport
                .send(&owner, Message::PullTxnReq { last_zxid: own_last });
            self.sync_with(&owner).await?;
        }

        // adopt the new epoch for the (now durable) initial history
        self.persistence.sync_log().await?;
        self.persistence.set_ack_epoch(new_epoch).await?;

        // align every responder and announce leadership to it
        let followers: Vec<ServerId> = epoch_acks
            .keys()
            .filter(|p| **p != self.me)
            .cloned()
            .collect();
        for peer in &followers {
            let (_, peer_last) = epoch_acks[peer];
            send_sync(
                &self.me,
                &self.persistence,
                &self.transport,
                peer,
                peer_last,
            )
            .await?;
            self.transport.send(
                peer,
                Message::NewLeader {
                    epoch: new_epoch,
                    config: Some(config.clone()),
                },
            );
        }

        // the epoch is established once a quorum (counting self) has acked
        // NEW_LEADER against the full synchronized history
        let target = self.persistence.latest_zxid().await;
        let mut established: HashSet<ServerId> =
            [self.me.clone()].into_iter().collect();
        while established.len() < config.majority() {
            let (from, msg) = self
                .get_message_guarding(|p| epoch_acks.contains_key(p))
                .await?;
            match msg {
                Message::Ack { zxid } if zxid == target => {
                    established.insert(from);
                }
                Message::Ack { zxid } => {
                    pf_warn!(self.me; "establishment ack {} <- '{}' does \
                                       not match history end {}",
                                      zxid, from, target);
                }
                msg => {
                    pf_debug!(self.me; "discarding {} <- '{}' during \
                                        establishment", msg.kind(), from);
                }
            }
        }

        // only now is the history quorum-durable; release it everywhere
        for peer in established.iter().filter(|p| **p != self.me) {
            self.transport.send(peer, Message::Commit { zxid: target });
        }
        self.deliver_undelivered().await?;

        /* -- Broadcasting phase -- */
        self.change_phase_leader(Phase::Broadcasting, new_epoch);
        let follower_set: HashSet<ServerId> = established
            .into_iter()
            .filter(|p| *p != self.me)
            .collect();
        self.state_machine.leading(follower_set.clone());
        self.state_machine
            .cluster_change(config.peers.iter().cloned().collect());

        self.accepting_leader(new_epoch, config, follower_set).await
    }

    /// Phase bookkeeping plus the leader-side observer callbacks.
    fn change_phase_leader(&mut self, phase: Phase, epoch: u32) {
        self.phase = phase;
        self.state_machine.state_changed(phase);
        if let Some(cb) = &self.callback {
            match phase {
                Phase::Discovering => cb.leader_discovering(),
                Phase::Synchronizing => cb.leader_synchronizing(epoch),
                Phase::Broadcasting => cb.leader_broadcasting(epoch),
                Phase::Electing => cb.electing(),
            }
        }
    }

    /// The leader's broadcasting loop: requests in, proposals out, acks
    /// counted, heartbeats to the live follower set, joiners admitted.
    async fn accepting_leader(
        &mut self,
        epoch: u32,
        mut config: ClusterConfig,
        mut followers: HashSet<ServerId>,
    ) -> Result<(), ZabError> {
        let mut majority = config.majority();

        let commit_proc = CommitProcessor::new_and_setup(
            self.me.clone(),
            self.last_delivered,
            self.state_machine.clone(),
        );
        let sync_proc = SyncProposalProcessor::new_and_setup(
            self.me.clone(),
            self.persistence.clone(),
            self.transport.clone(),
            self.me.clone(), // own acks loop back and count toward quorum
            self.config.sync_max_batch_size,
        );
        let ack_proc = AckProcessor::new_and_setup(
            self.me.clone(),
            self.persistence.latest_zxid().await,
            followers.clone(),
            majority,
            self.transport.clone(),
        );
        let pre_proc = PreProcessor::new_and_setup(
            self.me.clone(),
            epoch,
            followers.clone(),
            self.transport.clone(),
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
            self.me.clone(),
            self.transport.clone(),
            rx_request,
        );

        let mut hb_interval = time::interval(self.timeout / 3);
        hb_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut snap_interval = time::interval(Duration::from_secs(
            if self.config.snapshot_interval_s > 0 {
                self.config.snapshot_interval_s
            } else {
                3600 // dummy non-zero value to make `time::interval` happy
            },
        ));
        snap_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_heard: HashMap<ServerId, Instant> = followers
            .iter()
            .map(|p| (p.clone(), Instant::now()))
            .collect();

        let result = loop {
            tokio::select! {
                _ = hb_interval.tick() => {
                    for peer in &followers {
                        self.transport.send(peer, Message::Heartbeat);
                    }

                    let now = Instant::now();
                    let dead: Vec<ServerId> = followers
                        .iter()
                        .filter(|p| {
                            last_heard
                                .get(*p)
                                .map(|t| now.duration_since(*t) >= self.timeout)
                                .unwrap_or(true)
                        })
                        .cloned()
                        .collect();
                    if !dead.is_empty() {
                        for peer in &dead {
                            pf_warn!(self.me; "follower '{}' timed out", peer);
                            followers.remove(peer);
                            last_heard.remove(peer);
                            self.transport.clear(peer);
                        }
                        if followers.len() + 1 < majority {
                            pf_warn!(self.me; "lost quorum, back to electing");
                            break Err(ZabError::Timeout);
                        }
                        if let Err(e) = update_membership(
                            &ack_proc, &pre_proc, &followers, majority,
                        ).await {
                            break Err(e);
                        }
                    }
                },

                _ = snap_interval.tick(),
                        if self.config.snapshot_interval_s > 0 => {
                    if let Err(e) = self.take_snapshot(&commit_proc).await {
                        pf_error!(self.me; "error taking snapshot: {}", e);
                    }
                },

                incoming = self.get_incoming() => {
                    let incoming = match incoming {
                        Ok(incoming) => incoming,
                        Err(ZabError::Timeout) => {
                            // total silence is fine while we still hold a
                            // quorum (e.g. an idle singleton ensemble); the
                            // heartbeat clocks above judge liveness
                            if followers.len() + 1 >= majority {
                                continue;
                            }
                            break Err(ZabError::Timeout);
                        }
                        Err(e) => break Err(e),
                    };
                    let (from, msg) = match incoming {
                        Incoming::Lost { peer } => {
                            if followers.remove(&peer) {
                                pf_warn!(self.me; "follower '{}' disconnected",
                                                  peer);
                                last_heard.remove(&peer);
                                self.transport.clear(&peer);
                                if followers.len() + 1 < majority {
                                    break Err(ZabError::BackToElection);
                                }
                                if let Err(e) = update_membership(
                                    &ack_proc, &pre_proc, &followers, majority,
                                ).await {
                                    break Err(e);
                                }
                            } else {
                                self.transport.clear(&peer);
                            }
                            continue;
                        }
                        Incoming::Msg { from, msg } => (from, msg),
                    };

                    if followers.contains(&from) {
                        last_heard.insert(from.clone(), Instant::now());
                    }

                    match msg {
                        Message::Request { body } => {
                            if let Err(e) = pre_proc
                                .submit(PrepInput::Request { body })
                                .await
                            {
                                break Err(e);
                            }
                        }
                        Message::Proposal { txn } => {
                            // own broadcast fan-out looping back
                            if from != self.me {
                                pf_warn!(self.me; "PROPOSAL <- '{}' at the \
                                                   leader, ignored", from);
                                continue;
                            }
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
                            if from != self.me {
                                pf_warn!(self.me; "COMMIT <- '{}' at the \
                                                   leader, ignored", from);
                                continue;
                            }
                            if let Err(e) = commit_proc
                                .submit(CommitInput::Commit { zxid })
                                .await
                            {
                                break Err(e);
                            }
                        }
                        Message::Ack { zxid } => {
                            if from == self.me || followers.contains(&from) {
                                if let Err(e) = ack_proc
                                    .submit(AckInput::Ack { from, zxid })
                                    .await
                                {
                                    break Err(e);
                                }
                            } else {
                                // a freshly synced joiner (or a laggard from
                                // establishment): commit it and admit it
                                pf_info!(self.me; "admitting '{}' at {}",
                                                  from, zxid);
                                self.transport
                                    .send(&from, Message::Commit { zxid });
                                followers.insert(from.clone());
                                last_heard.insert(from, Instant::now());
                                if let Err(e) = update_membership(
                                    &ack_proc, &pre_proc, &followers, majority,
                                ).await {
                                    break Err(e);
                                }
                            }
                        }
                        Message::Heartbeat => {
                            // follower echo; liveness recorded above
                        }
                        Message::ProposedEpoch { .. } => {
                            // a restarted replica rediscovering the cluster
                            pf_debug!(self.me; "late discovery <- '{}'", from);
                            self.transport
                                .send(&from, Message::NewEpoch { epoch });
                        }
                        Message::AckEpoch { last_zxid, .. } => {
                            // second step of late discovery: align it, the
                            // admission happens on its ACK
                            if let Err(e) = send_sync(
                                &self.me,
                                &self.persistence,
                                &self.transport,
                                &from,
                                last_zxid,
                            )
                            .await
                            {
                                break Err(e);
                            }
                            self.transport.send(&from, Message::NewLeader {
                                epoch,
                                config: Some(config.clone()),
                            });
                        }
                        Message::Join { last_zxid } => {
                            pf_info!(self.me; "JOIN <- '{}' at {}",
                                              from, last_zxid);
                            if !config.contains(&from) {
                                let mut peers = config.peers.clone();
                                peers.push(from.clone());
                                config = ClusterConfig::new(
                                    self.persistence.latest_zxid().await,
                                    peers,
                                );
                                if let Err(e) = self
                                    .persistence
                                    .set_last_seen_config(&config)
                                    .await
                                {
                                    break Err(e);
                                }
                                majority = config.majority();
                                self.state_machine.cluster_change(
                                    config.peers.iter().cloned().collect(),
                                );
                            }
                            if let Err(e) = send_sync(
                                &self.me,
                                &self.persistence,
                                &self.transport,
                                &from,
                                last_zxid,
                            )
                            .await
                            {
                                break Err(e);
                            }
                            self.transport.send(&from, Message::NewLeader {
                                epoch,
                                config: Some(config.clone()),
                            });
                        }
                        Message::QueryLeader => {
                            self.transport.send(
                                &from,
                                Message::QueryLeaderReply {
                                    leader: self.me.clone(),
                                },
                            );
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

        // teardown: forwarder first, then the pipeline front to back
        self.rx_request = send_task.shutdown(&self.me).await;
        if let Err(e) = pre_proc.shutdown().await {
            pf_error!(self.me; "error shutting down pre-processor: {}", e);
        }
        if let Err(e) = ack_proc.shutdown().await {
            pf_error!(self.me; "error shutting down ack processor: {}", e);
        }
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
        for peer in &followers {
            self.transport.clear(peer);
        }
        result
    }
}

/// Pushes the current broadcast membership into the fan-out processors.
async fn update_membership(
    ack_proc: &AckProcessor,
    pre_proc: &PreProcessor,
    followers: &HashSet<ServerId>,
    majority: usize,
) -> Result<(), ZabError> {
    ack_proc
        .submit(AckInput::SetFollowers {
            followers: followers.clone(),
            majority,
        })
        .await?;
    pre_proc
        .submit(PrepInput::SetFollowers {
            followers: followers.clone(),
        })
        .await?;
    Ok(())
}
