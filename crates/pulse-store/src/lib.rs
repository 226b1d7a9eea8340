//! Append-only snapshot persistence. Snapshots are keyed by extraction
//! timestamp, written atomically via temp-file rename, and never mutated in
//! place; "current" is a most-recent-timestamp lookup.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

use pulse_core::Snapshot;

pub mod delta;

pub use delta::{Change, ChangeKind, DeltaEngine};

pub const CRATE_NAME: &str = "pulse-store";

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub extracted_at: DateTime<Utc>,
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn snapshot_path(&self, extracted_at: DateTime<Utc>) -> PathBuf {
        self.root
            .join(format!("{}.json", extracted_at.format(STAMP_FORMAT)))
    }

    /// Writes one snapshot atomically. A snapshot for the same timestamp may
    /// not be overwritten; the store is append-only.
    pub async fn write(&self, snapshot: &Snapshot) -> anyhow::Result<StoredSnapshot> {
        let bytes = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;
        let path = self.snapshot_path(snapshot.extracted_at);

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating snapshot directory {}", self.root.display()))?;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking snapshot path {}", path.display()))?
        {
            bail!("snapshot already exists: {}", path.display());
        }

        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming snapshot {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        let sha256 = Self::sha256_hex(&bytes);
        info!(
            path = %path.display(),
            bytes = bytes.len(),
            sha256 = %sha256,
            "snapshot written"
        );
        Ok(StoredSnapshot {
            extracted_at: snapshot.extracted_at,
            path,
            sha256,
            byte_size: bytes.len(),
        })
    }

    /// All snapshots, oldest first.
    pub async fn list(&self) -> anyhow::Result<Vec<(DateTime<Utc>, PathBuf)>> {
        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking {}", self.root.display()))?
        {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading {}", self.root.display()))?;
        let mut snapshots = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("iterating {}", self.root.display()))?
        {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(naive) = NaiveDateTime::parse_from_str(stem, STAMP_FORMAT) else {
                continue;
            };
            snapshots.push((naive.and_utc(), path));
        }
        snapshots.sort_by_key(|(ts, _)| *ts);
        Ok(snapshots)
    }

    /// Resolves the current snapshot by most-recent timestamp.
    pub async fn latest(&self) -> anyhow::Result<Option<(DateTime<Utc>, PathBuf)>> {
        Ok(self.list().await?.into_iter().next_back())
    }

    pub async fn load(&self, path: &Path) -> anyhow::Result<Snapshot> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing snapshot {}", path.display()))
    }

    pub async fn load_latest(&self) -> anyhow::Result<Option<Snapshot>> {
        match self.latest().await? {
            Some((_, path)) => Ok(Some(self.load(&path).await?)),
            None => Ok(None),
        }
    }

    /// The two most recent snapshots, older first, when at least two exist.
    pub async fn latest_pair(&self) -> anyhow::Result<Option<(Snapshot, Snapshot)>> {
        let all = self.list().await?;
        let n = all.len();
        if n < 2 {
            return Ok(None);
        }
        let older = self.load(&all[n - 2].1).await?;
        let newer = self.load(&all[n - 1].1).await?;
        Ok(Some((older, newer)))
    }
}
