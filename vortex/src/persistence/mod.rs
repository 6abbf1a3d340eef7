use crate::{engine::state::order::PendingOrder, strategy::runtime::StrategySnapshot};
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    io::Write,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, warn};
use vortex_execution::balance::AssetBalance;
use vortex_instrument::symbol::SymbolId;

/// Snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Canonical placeholder substituted for the checksum field while hashing.
const CHECKSUM_PLACEHOLDER: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".json";

/// All errors generated by state persistence.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persistence IO failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization failure: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state corruption: no valid snapshot among {candidates} candidates")]
    AllSnapshotsCorrupt { candidates: usize },
}

/// Snapshot metadata. `checksum_hex` is the SHA-256 of the canonical
/// serialization of the whole snapshot with this field zeroed.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct SnapshotMeta {
    pub version: u32,
    pub ts_ns: i64,
    pub sequence_num: u64,
    pub checksum_hex: String,
}

/// Last known reference price of a symbol, persisted for warm restart.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct SymbolPrice {
    pub symbol: SymbolId,
    pub price: Decimal,
}

/// Durable engine state: everything required to warm-restart without losing
/// balances, open orders or strategy state. Reservations are rebuilt from
/// the pending orders on restore.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StateSnapshot {
    pub meta: SnapshotMeta,
    pub balances: Vec<AssetBalance>,
    pub pending_orders: Vec<PendingOrder>,
    pub prices: Vec<SymbolPrice>,
    pub venue_counter: u64,
    pub strategies: Vec<StrategySnapshot>,
}

impl StateSnapshot {
    pub fn new(
        time: DateTime<Utc>,
        sequence_num: u64,
        balances: Vec<AssetBalance>,
        pending_orders: Vec<PendingOrder>,
        prices: Vec<SymbolPrice>,
        venue_counter: u64,
        strategies: Vec<StrategySnapshot>,
    ) -> Result<Self, PersistenceError> {
        let mut snapshot = Self {
            meta: SnapshotMeta {
                version: SNAPSHOT_VERSION,
                ts_ns: time.timestamp_nanos_opt().unwrap_or_default(),
                sequence_num,
                checksum_hex: CHECKSUM_PLACEHOLDER.to_string(),
            },
            balances,
            pending_orders,
            prices,
            venue_counter,
            strategies,
        };

        snapshot.meta.checksum_hex = snapshot.compute_checksum()?;
        Ok(snapshot)
    }

    /// SHA-256 over the canonical serialization with the checksum zeroed.
    fn compute_checksum(&self) -> Result<String, PersistenceError> {
        let mut canonical = self.clone();
        canonical.meta.checksum_hex = CHECKSUM_PLACEHOLDER.to_string();

        let body = serde_json::to_vec(&canonical)?;
        let mut hasher = Sha256::new();
        hasher.update(&body);
        Ok(hex::encode(hasher.finalize()))
    }

    /// True if the stored checksum matches the recomputed one.
    pub fn verify(&self) -> bool {
        self.compute_checksum()
            .map(|computed| computed == self.meta.checksum_hex)
            .unwrap_or(false)
    }
}

/// Snapshot cadence configuration. The time and mutation triggers are each
/// AND-ed against the minimum interval to avoid thrash.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SnapshotCadence {
    /// Time-based trigger.
    pub interval_secs: i64,
    /// Sequence-based trigger: snapshot after this many applied mutations.
    pub every_mutations: u64,
    /// Floor between consecutive snapshots.
    pub min_interval_secs: i64,
}

impl Default for SnapshotCadence {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            every_mutations: 1_000,
            min_interval_secs: 5,
        }
    }
}

/// Writes periodic [`StateSnapshot`]s to `snapshot_dir` and restores the
/// most recent valid one on startup.
#[derive(Debug)]
pub struct SnapshotManager {
    dir: PathBuf,
    cadence: SnapshotCadence,
    max_snapshots: usize,
    time_last_snapshot: Option<DateTime<Utc>>,
    mutations_since_snapshot: u64,
}

impl SnapshotManager {
    pub fn new(dir: PathBuf, cadence: SnapshotCadence, max_snapshots: usize) -> Self {
        Self {
            dir,
            cadence,
            max_snapshots: max_snapshots.max(1),
            time_last_snapshot: None,
            mutations_since_snapshot: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record one applied state mutation towards the sequence trigger.
    pub fn record_mutation(&mut self) {
        self.mutations_since_snapshot += 1;
    }

    /// True if either cadence trigger fired and the minimum interval has
    /// elapsed.
    pub fn should_snapshot(&self, now: DateTime<Utc>) -> bool {
        let since_last = self
            .time_last_snapshot
            .map(|last| now.signed_duration_since(last));

        if since_last
            .is_some_and(|elapsed| elapsed < TimeDelta::seconds(self.cadence.min_interval_secs))
        {
            return false;
        }

        let time_due = since_last
            .is_none_or(|elapsed| elapsed >= TimeDelta::seconds(self.cadence.interval_secs));
        let mutations_due = self.mutations_since_snapshot >= self.cadence.every_mutations;

        (time_due || mutations_due) && self.mutations_since_snapshot > 0
    }

    /// Atomically write a snapshot (temp file + fsync + rename) and prune
    /// retention.
    pub fn write(&mut self, snapshot: &StateSnapshot) -> Result<PathBuf, PersistenceError> {
        std::fs::create_dir_all(&self.dir)?;

        let final_path = self.dir.join(format!(
            "{SNAPSHOT_PREFIX}{}{SNAPSHOT_SUFFIX}",
            snapshot.meta.sequence_num
        ));
        let tmp_path = self.dir.join(format!(
            ".{SNAPSHOT_PREFIX}{}{SNAPSHOT_SUFFIX}.tmp",
            snapshot.meta.sequence_num
        ));

        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&serde_json::to_vec_pretty(snapshot)?)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;

        self.time_last_snapshot = Some(Utc::now());
        self.mutations_since_snapshot = 0;

        info!(
            path = %final_path.display(),
            sequence_num = snapshot.meta.sequence_num,
            "state snapshot written"
        );

        self.prune()?;
        Ok(final_path)
    }

    /// Load the most recent valid snapshot.
    ///
    /// Snapshots failing checksum verification are skipped with a warning,
    /// falling back to the next most recent. Returns `Ok(None)` for a fresh
    /// start (no snapshots present); errs with `AllSnapshotsCorrupt` when
    /// snapshots exist but none verify.
    pub fn load_latest(&self) -> Result<Option<StateSnapshot>, PersistenceError> {
        let mut candidates = self.list_snapshots()?;
        if candidates.is_empty() {
            return Ok(None);
        }

        candidates.sort_by_key(|(sequence, _)| std::cmp::Reverse(*sequence));
        let total = candidates.len();

        for (sequence, path) in candidates {
            match Self::read_snapshot(&path) {
                Ok(snapshot) if snapshot.verify() => {
                    info!(sequence, path = %path.display(), "restoring state snapshot");
                    return Ok(Some(snapshot));
                }
                Ok(_) => {
                    warn!(
                        sequence,
                        path = %path.display(),
                        "snapshot checksum mismatch - skipping"
                    );
                }
                Err(read_error) => {
                    warn!(
                        sequence,
                        path = %path.display(),
                        %read_error,
                        "snapshot unreadable - skipping"
                    );
                }
            }
        }

        Err(PersistenceError::AllSnapshotsCorrupt { candidates: total })
    }

    fn read_snapshot(path: &Path) -> Result<StateSnapshot, PersistenceError> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn list_snapshots(&self) -> Result<Vec<(u64, PathBuf)>, PersistenceError> {
        let mut snapshots = Vec::new();

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(snapshots);
            }
            Err(error) => return Err(error.into()),
        };

        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some(sequence) = name
                .strip_prefix(SNAPSHOT_PREFIX)
                .and_then(|rest| rest.strip_suffix(SNAPSHOT_SUFFIX))
                .and_then(|sequence| sequence.parse::<u64>().ok())
            else {
                continue;
            };
            snapshots.push((sequence, path));
        }

        Ok(snapshots)
    }

    /// Remove the oldest snapshots beyond `max_snapshots`.
    fn prune(&self) -> Result<(), PersistenceError> {
        let mut snapshots = self.list_snapshots()?;
        if snapshots.len() <= self.max_snapshots {
            return Ok(());
        }

        snapshots.sort_by_key(|(sequence, _)| *sequence);
        let excess = snapshots.len() - self.max_snapshots;

        for (sequence, path) in snapshots.into_iter().take(excess) {
            if let Err(remove_error) = std::fs::remove_file(&path) {
                warn!(sequence, %remove_error, "failed to prune old snapshot");
            }
        }
        Ok(())
    }
}
