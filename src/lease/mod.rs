//! Lease lifecycle for control-plane volume attachments.
//!
//! A lease tracks one in-progress attachment of a volume onto this host. It
//! is durably registered (see [`registry`]) before the first control-plane
//! call is issued, which is what makes crash recovery possible: after a
//! restart, surviving records are exactly the attachments that must be
//! re-examined.
//!
//! State transitions:
//! - Requested → Attached → Activated → Releasing → Released (terminal)
//! - any state → Leaked (terminal, teardown abandoned by policy)

pub mod orchestrator;
pub mod recovery;
pub mod registry;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// How the client intends to use the attached volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Where a lease is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    /// Registered durably; no control-plane call issued yet.
    Requested,
    /// The control plane has attached the volume to this host.
    Attached,
    /// The attachment is live and the device path is usable for I/O.
    Activated,
    /// Teardown in progress.
    Releasing,
    /// Teardown completed; the record has no reason to exist.
    Released,
    /// Teardown could not be completed and was abandoned.
    Leaked,
}

impl LeaseState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LeaseState::Released | LeaseState::Leaked)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: LeaseState) -> bool {
        use LeaseState::*;
        match (self, next) {
            (_, Leaked) => !self.is_terminal(),
            (Requested, Attached) => true,
            (Attached, Activated) => true,
            (Requested | Attached | Activated, Releasing) => true,
            (Releasing, Released) => true,
            _ => false,
        }
    }
}

/// The identifiers every control-plane operation is keyed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseKey {
    pub lease_id: String,
    pub volume_id: String,
    pub sr_id: String,
}

/// One in-progress volume attachment.
///
/// Serialized form doubles as the on-disk registry record, so it stays
/// individually inspectable with standard tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: String,
    pub volume_id: String,
    pub sr_id: String,
    pub mode: AccessMode,
    /// Unix timestamp of lease creation.
    pub created_at: u64,
    pub state: LeaseState,
}

impl Lease {
    pub fn new(
        principal: &str,
        conn_id: Uuid,
        volume_id: impl Into<String>,
        sr_id: impl Into<String>,
        mode: AccessMode,
    ) -> Self {
        Self {
            lease_id: derive_lease_id(principal, conn_id, std::process::id()),
            volume_id: volume_id.into(),
            sr_id: sr_id.into(),
            mode,
            created_at: unix_now(),
            state: LeaseState::Requested,
        }
    }

    pub fn key(&self) -> LeaseKey {
        LeaseKey {
            lease_id: self.lease_id.clone(),
            volume_id: self.volume_id.clone(),
            sr_id: self.sr_id.clone(),
        }
    }

    /// Advance the state machine. Illegal transitions indicate a logic error
    /// in the orchestrator, the only writer.
    pub fn advance(&mut self, next: LeaseState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal lease transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }
}

/// Build a lease id from the validated principal, the connection id, and the
/// process id, so two processes or two connections never collide. The result
/// is filesystem-safe: it is used as the registry file name.
pub fn derive_lease_id(principal: &str, conn_id: Uuid, pid: u32) -> String {
    let principal: String = principal
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("{}.{}.{}", principal, conn_id.simple(), pid)
}

/// Current time as Unix timestamp.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
