//! Durable registry of in-flight leases.
//!
//! One JSON file per lease under the configured state directory. A record is
//! written before the first control-plane call for its lease and removed only
//! once teardown has finished (or been abandoned). Records are plain pretty-
//! printed JSON so an operator can inspect or delete them individually.
//!
//! Writes use the write-temp → fsync → rename pattern, so a crash mid-write
//! never corrupts an existing record. Concurrent operations from different
//! connections always target different lease ids, hence disjoint files.

use super::Lease;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("lease registry I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed lease record {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode lease record: {0}")]
    Encode(serde_json::Error),
}

pub struct LeaseRegistry {
    dir: PathBuf,
}

impl LeaseRegistry {
    /// Open (creating if necessary) the registry directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, lease_id: &str) -> PathBuf {
        self.dir.join(format!("{lease_id}.json"))
    }

    /// Durably persist (or overwrite) the record for a lease.
    ///
    /// Must complete before any control-plane attach call is issued for the
    /// lease: a record with no attachment is a safe no-op to tear down, an
    /// attachment with no record is a leak.
    pub fn register(&self, lease: &Lease) -> Result<(), RegistryError> {
        let path = self.entry_path(&lease.lease_id);
        let tmp = path.with_extension("json.tmp");

        let data = serde_json::to_vec_pretty(lease).map_err(RegistryError::Encode)?;

        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;

        debug!(lease_id = %lease.lease_id, state = ?lease.state, "lease record persisted");
        Ok(())
    }

    /// Durably remove the record for a lease. Removing an absent id is not
    /// an error.
    pub fn unregister(&self, lease_id: &str) -> Result<(), RegistryError> {
        match fs::remove_file(self.entry_path(lease_id)) {
            Ok(()) => {
                debug!(lease_id, "lease record removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(lease_id, "lease record already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All persisted records. Used only during recovery.
    ///
    /// A record that no longer parses is surfaced as an error rather than
    /// skipped: silently ignoring it would leave its attachment untracked.
    /// The operator can delete the offending file by hand.
    pub fn scan(&self) -> Result<Vec<Lease>, RegistryError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                // leftover .json.tmp from an interrupted write, or foreign file
                continue;
            }
            let data = fs::read(&path)?;
            let lease: Lease = serde_json::from_slice(&data)
                .map_err(|source| RegistryError::Malformed { path: path.clone(), source })?;
            entries.push(lease);
        }
        Ok(entries)
    }
}
