//! Durable participant state: epoch counters, last seen cluster config,
//! snapshot, and the transaction log, all under one log directory.
//!
//! Directory layout:
//!   `ProposedEpoch`  4-byte big-endian integer (f.p)
//!   `AckEpoch`       4-byte big-endian integer (f.a)
//!   `ClusterConfig`  rmp-serde encoded `ClusterConfig`
//!   `Snapshot`       rmp-serde encoded `SnapshotFile`
//!   `zab.lock`       exclusive-owner lock file
//!   `log/`           segment transaction log
//!
//! Metadata updates are crash-safe: write `<file>.tmp`, fsync, rename over
//! the old file, fsync the directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::storage::SegmentLog;
use crate::utils::ZabError;
use crate::zxid::{ClusterConfig, Transaction, Zxid};

const F_PROPOSED_EPOCH: &str = "ProposedEpoch";
const F_ACK_EPOCH: &str = "AckEpoch";
const F_CLUSTER_CONFIG: &str = "ClusterConfig";
const F_SNAPSHOT: &str = "Snapshot";
const F_LOCK: &str = "zab.lock";

/// On-disk snapshot envelope: opaque state machine bytes plus the delivery
/// watermark they cover.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotFile {
    last_zxid: Zxid,
    data: Vec<u8>,
}

#[derive(Debug)]
struct PersistInner {
    log: SegmentLog,
    proposed_epoch: u32,
    ack_epoch: u32,
    config: Option<ClusterConfig>,
    snap_zxid: Zxid,
}

/// Durable state of one participant. Exclusively owns its log directory
/// (enforced by the lock file); interior state sits behind one async mutex,
/// the only shared-mutable state in the engine besides the transport.
#[derive(Debug)]
pub struct Persistence {
    dir: PathBuf,
    inner: Mutex<PersistInner>,
}

impl Persistence {
    /// Opens (or initializes) the durable state under `dir` and takes the
    /// directory lock. Absent files read as epochs `(0, 0)`, no config, and
    /// no snapshot.
    pub async fn open(dir: &Path) -> Result<Persistence, ZabError> {
        if !fs::try_exists(dir).await? {
            fs::create_dir_all(dir).await?;
        }

        // the lock file enforces single-process ownership of the directory
        let lock_path = dir.join(F_LOCK);
        if OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .await
            .is_err()
        {
            return logged_err!("persist"; "logdir '{}' is locked by another \
                                           participant", dir.display());
        }

        match Self::open_locked(dir).await {
            Ok(persist) => Ok(persist),
            Err(e) => {
                // a failed open must not leave the directory locked
                let _ = fs::remove_file(&lock_path).await;
                Err(e)
            }
        }
    }

    async fn open_locked(dir: &Path) -> Result<Persistence, ZabError> {
        let proposed_epoch = read_epoch_file(&dir.join(F_PROPOSED_EPOCH)).await?;
        let ack_epoch = read_epoch_file(&dir.join(F_ACK_EPOCH)).await?;
        if ack_epoch > proposed_epoch {
            return Err(ZabError::Corruption(format!(
                "acked epoch {} exceeds proposed epoch {}",
                ack_epoch, proposed_epoch
            )));
        }

        let config = match fs::try_exists(dir.join(F_CLUSTER_CONFIG)).await? {
            true => {
                let bytes = fs::read(dir.join(F_CLUSTER_CONFIG)).await?;
                Some(rmp_serde::decode::from_slice(&bytes).map_err(|e| {
                    ZabError::Corruption(format!("bad cluster config: {}", e))
                })?)
            }
            false => None,
        };

        let snap_zxid = match fs::try_exists(dir.join(F_SNAPSHOT)).await? {
            true => {
                let bytes = fs::read(dir.join(F_SNAPSHOT)).await?;
                let snap: SnapshotFile = rmp_serde::decode::from_slice(&bytes)
                    .map_err(|e| {
                        ZabError::Corruption(format!("bad snapshot: {}", e))
                    })?;
                snap.last_zxid
            }
            false => Zxid::NULL,
        };

        let log = SegmentLog::open(&dir.join("log")).await?;

        Ok(Persistence {
            dir: dir.to_path_buf(),
            inner: Mutex::new(PersistInner {
                log,
                proposed_epoch,
                ack_epoch,
                config,
                snap_zxid,
            }),
        })
    }

    /// Highest epoch this participant has promised to join (f.p).
    pub async fn proposed_epoch(&self) -> u32 {
        self.inner.lock().await.proposed_epoch
    }

    /// Highest epoch this participant has acknowledged a NEW_LEADER for (f.a).
    pub async fn ack_epoch(&self) -> u32 {
        self.inner.lock().await.ack_epoch
    }

    /// Durably updates f.p. The counter never decreases.
    pub async fn set_proposed_epoch(&self, epoch: u32) -> Result<(), ZabError> {
        let mut inner = self.inner.lock().await;
        if epoch < inner.proposed_epoch {
            return logged_err!("persist"; "proposed epoch {} would decrease \
                                           below {}",
                                          epoch, inner.proposed_epoch);
        }
        atomic_write(&self.dir, F_PROPOSED_EPOCH, &epoch.to_be_bytes()).await?;
        inner.proposed_epoch = epoch;
        Ok(())
    }

    /// Durably updates f.a. The counter never decreases.
    pub async fn set_ack_epoch(&self, epoch: u32) -> Result<(), ZabError> {
        let mut inner = self.inner.lock().await;
        if epoch < inner.ack_epoch {
            return logged_err!("persist"; "acked epoch {} would decrease \
                                           below {}",
                                          epoch, inner.ack_epoch);
        }
        atomic_write(&self.dir, F_ACK_EPOCH, &epoch.to_be_bytes()).await?;
        inner.ack_epoch = epoch;
        Ok(())
    }

    /// The most recently observed cluster membership, if any.
    pub async fn last_seen_config(&self) -> Option<ClusterConfig> {
        self.inner.lock().await.config.clone()
    }

    /// Durably records a newly observed cluster membership.
    pub async fn set_last_seen_config(
        &self,
        config: &ClusterConfig,
    ) -> Result<(), ZabError> {
        let mut inner = self.inner.lock().await;
        let bytes = rmp_serde::encode::to_vec(config)?;
        atomic_write(&self.dir, F_CLUSTER_CONFIG, &bytes).await?;
        inner.config = Some(config.clone());
        Ok(())
    }

    /// Zxid of the last log entry, or the snapshot watermark if it is
    /// higher (a freshly snapshot-installed replica has an empty log).
    pub async fn latest_zxid(&self) -> Zxid {
        let inner = self.inner.lock().await;
        std::cmp::max(inner.log.latest_zxid(), inner.snap_zxid)
    }

    /// Appends one transaction to the log (may buffer until `sync_log`).
    pub async fn append_txn(&self, txn: &Transaction) -> Result<(), ZabError> {
        self.inner.lock().await.log.append(txn).await
    }

    /// Flushes all prior appends to stable storage.
    pub async fn sync_log(&self) -> Result<(), ZabError> {
        self.inner.lock().await.log.sync().await
    }

    /// Removes all log entries after the given zxid.
    pub async fn truncate_log(&self, zxid: Zxid) -> Result<(), ZabError> {
        self.inner.lock().await.log.truncate(zxid).await
    }

    /// True if the log holds an entry with exactly this zxid.
    pub async fn log_contains(&self, zxid: Zxid) -> bool {
        self.inner.lock().await.log.contains(zxid)
    }

    /// Greatest log entry zxid ≤ the given one, if any.
    pub async fn log_highest_le(&self, zxid: Zxid) -> Option<Zxid> {
        self.inner.lock().await.log.highest_zxid_le(zxid)
    }

    /// Collects all log entries with zxid strictly greater than `after`, in
    /// order.
    pub async fn txns_after(
        &self,
        after: Zxid,
    ) -> Result<Vec<Transaction>, ZabError> {
        let inner = self.inner.lock().await;
        let mut iter = inner.log.iterate(after);
        let mut txns = Vec::new();
        while let Some(txn) = iter.next().await? {
            if txn.zxid > after {
                txns.push(txn);
            }
        }
        Ok(txns)
    }

    /// Delivery watermark covered by the stored snapshot (`Zxid::NULL` if no
    /// snapshot exists).
    pub async fn snapshot_watermark(&self) -> Zxid {
        self.inner.lock().await.snap_zxid
    }

    /// Durably stores a snapshot taken locally and compacts fully covered
    /// log segments.
    pub async fn store_snapshot(
        &self,
        last_zxid: Zxid,
        data: Vec<u8>,
    ) -> Result<(), ZabError> {
        let mut inner = self.inner.lock().await;
        let bytes = rmp_serde::encode::to_vec(&SnapshotFile { last_zxid, data })?;
        atomic_write(&self.dir, F_SNAPSHOT, &bytes).await?;
        inner.snap_zxid = last_zxid;
        inner.log.trim_front(last_zxid).await?;
        Ok(())
    }

    /// Installs a snapshot received from the leader: stores it and resets
    /// the log, which will be refilled by the DIFF tail that follows.
    pub async fn install_snapshot(
        &self,
        last_zxid: Zxid,
        data: Vec<u8>,
    ) -> Result<(), ZabError> {
        let mut inner = self.inner.lock().await;
        let bytes = rmp_serde::encode::to_vec(&SnapshotFile { last_zxid, data })?;
        atomic_write(&self.dir, F_SNAPSHOT, &bytes).await?;
        inner.snap_zxid = last_zxid;
        inner.log.wipe().await?;
        Ok(())
    }

    /// Reads the stored snapshot bytes and watermark, if any.
    pub async fn load_snapshot(
        &self,
    ) -> Result<Option<(Zxid, Vec<u8>)>, ZabError> {
        if !fs::try_exists(self.dir.join(F_SNAPSHOT)).await? {
            return Ok(None);
        }
        let bytes = fs::read(self.dir.join(F_SNAPSHOT)).await?;
        let snap: SnapshotFile = rmp_serde::decode::from_slice(&bytes)
            .map_err(|e| ZabError::Corruption(format!("bad snapshot: {}", e)))?;
        Ok(Some((snap.last_zxid, snap.data)))
    }
}

impl Drop for Persistence {
    fn drop(&mut self) {
        // release the directory for the next incarnation
        let _ = std::fs::remove_file(self.dir.join(F_LOCK));
    }
}

/// Reads a 4-byte big-endian epoch file; absent means 0.
async fn read_epoch_file(path: &Path) -> Result<u32, ZabError> {
    if !fs::try_exists(path).await? {
        return Ok(0);
    }
    let bytes = fs::read(path).await?;
    if bytes.len() != 4 {
        return Err(ZabError::Corruption(format!(
            "epoch file '{}' has {} bytes",
            path.display(),
            bytes.len()
        )));
    }
    Ok(u32::from_be_bytes(bytes[..4].try_into().unwrap()))
}

/// Crash-safe file replacement: write tmp, fsync, rename, fsync directory.
async fn atomic_write(
    dir: &Path,
    name: &str,
    bytes: &[u8],
) -> Result<(), ZabError> {
    let tmp_path = dir.join(format!("{}.tmp", name));
    let dst_path = dir.join(name);

    let mut file = File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp_path, &dst_path).await?;
    std::fs::File::open(dir)?.sync_all()?;
    Ok(())
}
