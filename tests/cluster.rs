//! Multi-node cluster scenarios over localhost TCP: happy-path broadcast,
//! crash/rejoin catch-up, leader turnover, divergent-suffix truncation,
//! stale-epoch rejoin, and loss-of-leader re-election.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::fs;
use tokio::time::{self, Duration, Instant};

use zab::{
    FixedOracle, Persistence, SegmentLog, StateChangeCallback, StateMachine,
    Transaction, Zab, ZabConfig, ZabError, Zxid,
};

/// State machine double recording every delivery.
#[derive(Default)]
struct Recorder {
    delivered: Mutex<Vec<(Zxid, Vec<u8>)>>,
}

impl Recorder {
    fn zxids(&self) -> Vec<Zxid> {
        self.delivered.lock().unwrap().iter().map(|(z, _)| *z).collect()
    }

    fn bodies(&self) -> Vec<Vec<u8>> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(_, b)| b.clone())
            .collect()
    }
}

impl StateMachine for Recorder {
    fn deliver(&self, txn: &Transaction) {
        self.delivered
            .lock()
            .unwrap()
            .push((txn.zxid, txn.body.clone()));
    }

    fn save(&self) -> Result<Vec<u8>, ZabError> {
        Ok(vec![])
    }

    fn restore(&self, _data: &[u8]) -> Result<(), ZabError> {
        Ok(())
    }
}

/// Phase observer counting election entries and flagging broadcast entry.
#[derive(Default)]
struct PhaseWatch {
    electing: Mutex<u32>,
    broadcasting: Mutex<bool>,
}

impl PhaseWatch {
    fn electing_count(&self) -> u32 {
        *self.electing.lock().unwrap()
    }

    fn is_broadcasting(&self) -> bool {
        *self.broadcasting.lock().unwrap()
    }
}

impl StateChangeCallback for PhaseWatch {
    fn electing(&self) {
        *self.electing.lock().unwrap() += 1;
        *self.broadcasting.lock().unwrap() = false;
    }

    fn leader_broadcasting(&self, _epoch: u32) {
        *self.broadcasting.lock().unwrap() = true;
    }

    fn follower_broadcasting(&self, _epoch: u32) {
        *self.broadcasting.lock().unwrap() = true;
    }
}

async fn fresh_dir(name: &str) -> Result<PathBuf, ZabError> {
    let dir = std::env::temp_dir().join(name);
    if fs::try_exists(&dir).await? {
        fs::remove_dir_all(&dir).await?;
    }
    Ok(dir)
}

fn node_config(id: &str, servers: &[&str], logdir: &PathBuf) -> ZabConfig {
    ZabConfig {
        server_id: id.into(),
        servers: servers.iter().map(|s| s.to_string()).collect(),
        logdir: logdir.to_string_lossy().into_owned(),
        timeout_ms: 1000,
        sync_max_batch_size: 100,
        snapshot_interval_s: 0,
        join_peer: None,
    }
}

/// Polls `cond` until it holds or the deadline passes.
async fn wait_until<F>(what: &str, deadline: Duration, mut cond: F)
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        time::sleep(Duration::from_millis(50)).await;
    }
}

/// Boots one node with a fresh recorder and phase watch attached.
async fn boot_node(
    config: ZabConfig,
    leader: &str,
) -> Result<(Zab, Arc<Recorder>, Arc<PhaseWatch>), ZabError> {
    let _ = env_logger::builder().is_test(true).try_init();
    let recorder = Arc::new(Recorder::default());
    let watch = Arc::new(PhaseWatch::default());
    let node = Zab::start_with_callback(
        config,
        recorder.clone(),
        Arc::new(FixedOracle::new(leader.into())),
        Some(watch.clone()),
    )
    .await?;
    Ok((node, recorder, watch))
}

/// Reads back the zxids persisted in a node's log after it shut down.
async fn persisted_zxids(logdir: &PathBuf) -> Result<Vec<Zxid>, ZabError> {
    let log = SegmentLog::open(&logdir.join("log")).await?;
    let mut iter = log.iterate(Zxid::NULL);
    let mut zxids = Vec::new();
    while let Some(txn) = iter.next().await? {
        zxids.push(txn.zxid);
    }
    Ok(zxids)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_happy_path() -> Result<(), ZabError> {
    let servers = ["127.0.0.1:43111", "127.0.0.1:43112", "127.0.0.1:43113"];
    let mut dirs = Vec::new();
    let mut nodes = Vec::new();
    for (i, id) in servers.iter().enumerate() {
        let dir = fresh_dir(&format!("zab-it-happy-{}", i)).await?;
        let node = boot_node(node_config(id, &servers, &dir), servers[0])
            .await?;
        dirs.push(dir);
        nodes.push(node);
    }

    wait_until("all nodes broadcasting", Duration::from_secs(15), || {
        nodes.iter().all(|(_, _, watch)| watch.is_broadcasting())
    })
    .await;

    nodes[0].0.send(b"x".to_vec()).await?;

    wait_until("x delivered everywhere", Duration::from_secs(15), || {
        nodes
            .iter()
            .all(|(_, recorder, _)| recorder.zxids() == vec![Zxid::new(1, 1)])
    })
    .await;
    for (_, recorder, _) in &nodes {
        assert_eq!(recorder.bodies(), vec![b"x".to_vec()]);
    }

    for (node, _, _) in nodes.drain(..) {
        node.shutdown().await?;
    }
    for dir in &dirs {
        assert_eq!(persisted_zxids(dir).await?, vec![Zxid::new(1, 1)]);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_crash_and_rejoin() -> Result<(), ZabError> {
    let servers = ["127.0.0.1:43121", "127.0.0.1:43122", "127.0.0.1:43123"];
    let mut dirs = Vec::new();
    let mut nodes = Vec::new();
    for (i, id) in servers.iter().enumerate() {
        let dir = fresh_dir(&format!("zab-it-rejoin-{}", i)).await?;
        let node = boot_node(node_config(id, &servers, &dir), servers[0])
            .await?;
        dirs.push(dir);
        nodes.push(node);
    }

    wait_until("all nodes broadcasting", Duration::from_secs(15), || {
        nodes.iter().all(|(_, _, watch)| watch.is_broadcasting())
    })
    .await;

    nodes[0].0.send(b"x".to_vec()).await?;
    wait_until("x delivered everywhere", Duration::from_secs(15), || {
        nodes
            .iter()
            .all(|(_, recorder, _)| recorder.zxids() == vec![Zxid::new(1, 1)])
    })
    .await;

    // kill the third follower; the leader keeps its quorum of two
    let (s3, _, _) = nodes.pop().unwrap();
    s3.shutdown().await?;
    time::sleep(Duration::from_millis(500)).await;

    nodes[0].0.send(b"y".to_vec()).await?;
    wait_until("y delivered on survivors", Duration::from_secs(15), || {
        nodes.iter().all(|(_, recorder, _)| {
            recorder.zxids() == vec![Zxid::new(1, 1), Zxid::new(1, 2)]
        })
    })
    .await;

    // the restarted follower catches up over a DIFF and delivers both
    let (s3, recorder3, _) =
        boot_node(node_config(servers[2], &servers, &dirs[2]), servers[0])
            .await?;
    wait_until("rejoined follower caught up", Duration::from_secs(15), || {
        recorder3.zxids() == vec![Zxid::new(1, 1), Zxid::new(1, 2)]
    })
    .await;
    assert_eq!(recorder3.bodies(), vec![b"x".to_vec(), b"y".to_vec()]);

    s3.shutdown().await?;
    for (node, _, _) in nodes.drain(..) {
        node.shutdown().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_crash_before_commit() -> Result<(), ZabError> {
    let servers = ["127.0.0.1:43131", "127.0.0.1:43132", "127.0.0.1:43133"];
    let body = b"w".to_vec();

    // stage the aftermath of a leader crash at epoch 1: the dead leader got
    // (1,3) onto the second replica only
    let dir2 = fresh_dir("zab-it-turnover-1").await?;
    {
        let persist = Persistence::open(&dir2).await?;
        for xid in 1..=3 {
            persist
                .append_txn(&Transaction::new(Zxid::new(1, xid), 0, body.clone()))
                .await?;
        }
        persist.sync_log().await?;
        persist.set_proposed_epoch(1).await?;
        persist.set_ack_epoch(1).await?;
    }
    let dir3 = fresh_dir("zab-it-turnover-2").await?;
    {
        let persist = Persistence::open(&dir3).await?;
        for xid in 1..=2 {
            persist
                .append_txn(&Transaction::new(Zxid::new(1, xid), 0, body.clone()))
                .await?;
        }
        persist.sync_log().await?;
        persist.set_proposed_epoch(1).await?;
        persist.set_ack_epoch(1).await?;
    }

    // survivors elect the second replica; its longer history wins
    let (s2, recorder2, _) =
        boot_node(node_config(servers[1], &servers, &dir2), servers[1])
            .await?;
    let (s3, recorder3, _) =
        boot_node(node_config(servers[2], &servers, &dir3), servers[1])
            .await?;

    let expect =
        vec![Zxid::new(1, 1), Zxid::new(1, 2), Zxid::new(1, 3)];
    wait_until("survivors adopt the pending entry", Duration::from_secs(15), || {
        recorder2.zxids() == expect && recorder3.zxids() == expect
    })
    .await;

    // new rounds run at an epoch beyond the crashed leader's
    s2.shutdown().await?;
    s3.shutdown().await?;
    time::sleep(Duration::from_millis(500)).await; // let the logdir unlock
    let persist = Persistence::open(&dir2).await?;
    assert!(persist.ack_epoch().await >= 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn divergent_suffix_truncated() -> Result<(), ZabError> {
    let servers = ["127.0.0.1:43141", "127.0.0.1:43142", "127.0.0.1:43143"];
    let body = b"d".to_vec();

    // a partitioned ex-leader kept an uncommitted (3,2); the other side
    // moved on to epoch 4 and committed (4,1)
    let dir1 = fresh_dir("zab-it-diverge-0").await?;
    {
        let persist = Persistence::open(&dir1).await?;
        persist
            .append_txn(&Transaction::new(Zxid::new(3, 1), 0, body.clone()))
            .await?;
        persist
            .append_txn(&Transaction::new(Zxid::new(3, 2), 0, body.clone()))
            .await?;
        persist.sync_log().await?;
        persist.set_proposed_epoch(3).await?;
        persist.set_ack_epoch(3).await?;
    }
    let mut other_dirs = Vec::new();
    for i in 1..=2 {
        let dir = fresh_dir(&format!("zab-it-diverge-{}", i)).await?;
        let persist = Persistence::open(&dir).await?;
        persist
            .append_txn(&Transaction::new(Zxid::new(3, 1), 0, body.clone()))
            .await?;
        persist
            .append_txn(&Transaction::new(Zxid::new(4, 1), 0, body.clone()))
            .await?;
        persist.sync_log().await?;
        persist.set_proposed_epoch(4).await?;
        persist.set_ack_epoch(4).await?;
        drop(persist);
        other_dirs.push(dir);
    }

    let (s2, recorder2, _) =
        boot_node(node_config(servers[1], &servers, &other_dirs[0]), servers[1])
            .await?;
    let (s3, _recorder3, _) =
        boot_node(node_config(servers[2], &servers, &other_dirs[1]), servers[1])
            .await?;
    let healthy = vec![Zxid::new(3, 1), Zxid::new(4, 1)];
    wait_until("majority side settles", Duration::from_secs(15), || {
        recorder2.zxids() == healthy
    })
    .await;

    // the partition heals: the ex-leader must drop (3,2) and align
    let (s1, recorder1, _) =
        boot_node(node_config(servers[0], &servers, &dir1), servers[1])
            .await?;
    wait_until("ex-leader realigned", Duration::from_secs(15), || {
        recorder1.zxids() == healthy
    })
    .await;
    assert!(!recorder1.zxids().contains(&Zxid::new(3, 2)));

    s1.shutdown().await?;
    s2.shutdown().await?;
    s3.shutdown().await?;

    // the divergent entry is gone from the realigned log as well
    assert_eq!(persisted_zxids(&dir1).await?, healthy);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_epoch_rejoin() -> Result<(), ZabError> {
    let servers = ["127.0.0.1:43151", "127.0.0.1:43152", "127.0.0.1:43153"];

    // two members sit at epoch 5; the third is far behind at epoch 1
    let mut dirs = Vec::new();
    for (i, epoch) in [(0, 5u32), (1, 5), (2, 1)] {
        let dir = fresh_dir(&format!("zab-it-stale-{}", i)).await?;
        let persist = Persistence::open(&dir).await?;
        persist.set_proposed_epoch(epoch).await?;
        persist.set_ack_epoch(epoch).await?;
        drop(persist);
        dirs.push(dir);
    }

    let mut nodes = Vec::new();
    for (i, id) in servers.iter().enumerate() {
        let node = boot_node(node_config(id, &servers, &dirs[i]), servers[0])
            .await?;
        nodes.push(node);
    }
    wait_until("all nodes broadcasting", Duration::from_secs(15), || {
        nodes.iter().all(|(_, _, watch)| watch.is_broadcasting())
    })
    .await;
    for (node, _, _) in nodes.drain(..) {
        node.shutdown().await?;
    }
    time::sleep(Duration::from_millis(500)).await; // let the logdir unlock

    // the stale member was raised to the freshly established epoch 6
    let persist = Persistence::open(&dirs[2]).await?;
    assert_eq!(persist.proposed_epoch().await, 6);
    assert_eq!(persist.ack_epoch().await, 6);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_leader_reelection() -> Result<(), ZabError> {
    let servers = ["127.0.0.1:43161", "127.0.0.1:43162", "127.0.0.1:43163"];

    // the pinned leader never starts: followers must keep timing out back
    // into election, one round per timeout window
    let dir = fresh_dir("zab-it-reelect-0").await?;
    let (s2, _, watch2) =
        boot_node(node_config(servers[1], &servers, &dir), servers[0])
            .await?;
    wait_until("repeated election rounds", Duration::from_secs(15), || {
        watch2.electing_count() >= 3
    })
    .await;
    s2.shutdown().await?;

    // and a live cluster whose leader dies unwinds to election as well
    let servers = ["127.0.0.1:43164", "127.0.0.1:43165", "127.0.0.1:43166"];
    let mut dirs = Vec::new();
    let mut nodes = Vec::new();
    for (i, id) in servers.iter().enumerate() {
        let dir = fresh_dir(&format!("zab-it-reelect-live-{}", i)).await?;
        let node = boot_node(node_config(id, &servers, &dir), servers[0])
            .await?;
        dirs.push(dir);
        nodes.push(node);
    }
    wait_until("all nodes broadcasting", Duration::from_secs(15), || {
        nodes.iter().all(|(_, _, watch)| watch.is_broadcasting())
    })
    .await;

    let (s1, _, _) = nodes.remove(0);
    let baseline: Vec<u32> = nodes
        .iter()
        .map(|(_, _, watch)| watch.electing_count())
        .collect();
    s1.shutdown().await?;

    wait_until("followers re-enter election", Duration::from_secs(15), || {
        nodes
            .iter()
            .zip(baseline.iter())
            .all(|((_, _, watch), base)| watch.electing_count() > *base)
    })
    .await;
    for (node, _, _) in nodes.drain(..) {
        node.shutdown().await?;
    }
    Ok(())
}
