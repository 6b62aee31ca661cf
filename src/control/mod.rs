//! Storage control-plane collaborator.
//!
//! The control plane owns attach/detach semantics; this module only defines
//! the contract the gateway consumes and an HTTP client for it. Every lease
//! operation is keyed by `(lease_id, volume_id, sr_id)`.

pub mod http;

use crate::lease::{AccessMode, LeaseKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub use http::HttpControlPlane;

#[derive(Error, Debug)]
pub enum ControlError {
    /// The volume, SR, or lease is not known to the control plane. During
    /// teardown this is the expected "already absent" answer and is treated
    /// as success by callers.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("control plane returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("control plane unreachable: {0}")]
    Transport(String),

    #[error("invalid control plane response: {0}")]
    Json(#[from] serde_json::Error),
}

impl ControlError {
    /// True for the "already absent" answers that leak-tolerant teardown
    /// accepts as success.
    pub fn is_absent(&self) -> bool {
        matches!(self, ControlError::NotFound(_))
    }
}

/// A volume as resolved by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub volume_id: String,
    pub sr_id: String,
    pub read_only: bool,
}

/// Operations the gateway needs from the storage control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Look up a volume by id, yielding its SR and read-only flag.
    async fn resolve_volume(&self, volume_id: &str) -> Result<VolumeInfo, ControlError>;

    async fn create_lease(&self, key: &LeaseKey, mode: AccessMode) -> Result<(), ControlError>;

    /// Attach the volume's backing storage to this host, yielding the local
    /// device path.
    async fn attach(&self, key: &LeaseKey) -> Result<PathBuf, ControlError>;

    /// Make the attached device ready for I/O.
    async fn activate(&self, key: &LeaseKey) -> Result<(), ControlError>;

    async fn deactivate(&self, key: &LeaseKey) -> Result<(), ControlError>;

    async fn detach(&self, key: &LeaseKey) -> Result<(), ControlError>;

    /// Destroy the lease. With `allow_leak` the control plane suppresses
    /// internal errors rather than failing the caller, for paths that cannot
    /// safely retry.
    async fn destroy_lease(&self, key: &LeaseKey, allow_leak: bool) -> Result<(), ControlError>;
}
