//! Attach/release orchestration against the storage control plane.
//!
//! The ordering contract: a lease record is durably registered before the
//! first control-plane call, so a crash at any later point leaves a record
//! that recovery can safely tear down (teardown of a not-yet-attached lease
//! is a no-op on the control-plane side). A lease is "real" the instant it
//! is registered, regardless of whether the calls that follow ever complete.

use super::registry::{LeaseRegistry, RegistryError};
use super::{AccessMode, Lease, LeaseState};
use crate::control::{ControlError, ControlPlane, VolumeInfo};
use crate::identity::SessionIdentity;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AttachError {
    /// The durable store is unreachable; acquire must not continue without
    /// a persisted record.
    #[error("lease registry unavailable: {0}")]
    Registry(#[from] RegistryError),

    #[error("control plane {op} failed for lease {lease_id}: {source}")]
    Control {
        op: &'static str,
        lease_id: String,
        source: ControlError,
    },
}

/// How far the forward attach sequence got before failing; drives the
/// reverse unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Progress {
    Registered,
    Created,
    Attached,
}

pub struct AttachmentOrchestrator {
    registry: Arc<LeaseRegistry>,
    control: Arc<dyn ControlPlane>,
}

impl AttachmentOrchestrator {
    pub fn new(registry: Arc<LeaseRegistry>, control: Arc<dyn ControlPlane>) -> Self {
        Self { registry, control }
    }

    /// Attach and activate a volume for one connection, yielding the live
    /// lease and the local device path.
    ///
    /// On a control-plane failure after registration, whatever succeeded is
    /// torn down best-effort (tolerating "already absent"), the record is
    /// removed, and the original error is surfaced. Never leaves a record
    /// for a lease that is confirmed not attached.
    pub async fn acquire(
        &self,
        identity: &SessionIdentity,
        conn_id: Uuid,
        volume: &VolumeInfo,
        mode: AccessMode,
    ) -> Result<(Lease, PathBuf), AttachError> {
        let mut lease = Lease::new(
            &identity.principal,
            conn_id,
            &volume.volume_id,
            &volume.sr_id,
            mode,
        );

        // Durable record first; everything after this is recoverable.
        self.registry.register(&lease)?;

        match self.attach_sequence(&mut lease).await {
            Ok(device) => {
                info!(
                    lease_id = %lease.lease_id,
                    volume_id = %lease.volume_id,
                    device = %device.display(),
                    "volume attached and activated"
                );
                Ok((lease, device))
            }
            Err((op, source, progress)) => {
                warn!(
                    lease_id = %lease.lease_id,
                    op,
                    error = %source,
                    "attach failed, unwinding partial attachment"
                );
                self.unwind(&lease, progress).await;
                if let Err(e) = self.registry.unregister(&lease.lease_id) {
                    warn!(lease_id = %lease.lease_id, error = %e, "failed to remove lease record after unwind");
                }
                Err(AttachError::Control {
                    op,
                    lease_id: lease.lease_id.clone(),
                    source,
                })
            }
        }
    }

    async fn attach_sequence(
        &self,
        lease: &mut Lease,
    ) -> Result<PathBuf, (&'static str, ControlError, Progress)> {
        let key = lease.key();

        self.control
            .create_lease(&key, lease.mode)
            .await
            .map_err(|e| ("create_lease", e, Progress::Registered))?;

        let device = self
            .control
            .attach(&key)
            .await
            .map_err(|e| ("attach", e, Progress::Created))?;
        lease.advance(LeaseState::Attached);
        self.persist_state(lease);

        self.control
            .activate(&key)
            .await
            .map_err(|e| ("activate", e, Progress::Attached))?;
        lease.advance(LeaseState::Activated);
        self.persist_state(lease);

        Ok(device)
    }

    /// Overwrite the record with the lease's current state. Best-effort: the
    /// invariant only needs the record to exist, which the initial register
    /// guaranteed; a stale state field just makes operator inspection less
    /// precise.
    fn persist_state(&self, lease: &Lease) {
        if let Err(e) = self.registry.register(lease) {
            warn!(lease_id = %lease.lease_id, error = %e, "failed to persist lease state transition");
        }
    }

    /// Reverse teardown of the steps that completed before an acquire
    /// failure. "Already absent" is success; a real failure is logged and
    /// abandoned, the stale resource left for the control plane's own
    /// accounting.
    async fn unwind(&self, lease: &Lease, progress: Progress) {
        let key = lease.key();

        if progress >= Progress::Attached {
            tolerate("detach", &lease.lease_id, self.control.detach(&key).await);
        }
        if progress >= Progress::Created {
            tolerate(
                "destroy_lease",
                &lease.lease_id,
                self.control.destroy_lease(&key, true).await,
            );
        }
    }

    /// Tear down a lease: deactivate → detach → destroy, leak-tolerant,
    /// then remove the record unconditionally.
    ///
    /// Never fails outward: this runs on already-failing paths and from
    /// cleanup handlers, where propagating an error would mask the original
    /// fault or block connection teardown. Failures are logged; a lease
    /// whose teardown definitively failed is marked `Leaked`.
    pub async fn release(&self, mut lease: Lease) {
        debug!(lease_id = %lease.lease_id, "releasing lease");
        lease.advance(LeaseState::Releasing);

        let key = lease.key();
        let mut leaked = false;

        leaked |= !tolerate("deactivate", &lease.lease_id, self.control.deactivate(&key).await);
        leaked |= !tolerate("detach", &lease.lease_id, self.control.detach(&key).await);
        leaked |= !tolerate(
            "destroy_lease",
            &lease.lease_id,
            self.control.destroy_lease(&key, true).await,
        );

        if leaked {
            lease.advance(LeaseState::Leaked);
            warn!(
                lease_id = %lease.lease_id,
                volume_id = %lease.volume_id,
                "lease teardown incomplete; resources abandoned"
            );
        } else {
            lease.advance(LeaseState::Released);
            info!(lease_id = %lease.lease_id, "lease released");
        }

        if let Err(e) = self.registry.unregister(&lease.lease_id) {
            warn!(lease_id = %lease.lease_id, error = %e, "failed to remove lease record");
        }
    }
}

/// Log-and-continue handling for one teardown step. Returns true when the
/// step succeeded or the resource was already absent.
fn tolerate(op: &'static str, lease_id: &str, result: Result<(), ControlError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) if e.is_absent() => {
            debug!(lease_id, op, "already absent, nothing to tear down");
            true
        }
        Err(e) => {
            warn!(lease_id, op, error = %e, "teardown step failed");
            false
        }
    }
}
