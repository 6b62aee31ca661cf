//! Crash-recovery sweep over the lease registry.
//!
//! Runs at process start (before any connection is accepted) and again,
//! synchronously, on the termination signal. Each surviving record is torn
//! down against the control plane, tolerating "already absent" answers, and
//! then removed. A record whose teardown definitively fails is abandoned and
//! logged rather than retried, so startup is never blocked indefinitely by
//! an unrecoverable backend.

use super::registry::{LeaseRegistry, RegistryError};
use crate::control::ControlPlane;
use tracing::{debug, info, warn};

/// Outcome counts of one sweep, for logging and assertions.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records whose every teardown step reported "already absent".
    pub already_clean: usize,
    /// Records with at least one live resource that was torn down.
    pub torn_down: usize,
    /// Records abandoned after a teardown step failed outright.
    pub leaked: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.already_clean + self.torn_down + self.leaked
    }
}

/// Reconcile every persisted lease record against the control plane.
///
/// Fails only if the registry itself is unreadable; control-plane failures
/// degrade individual records to `leaked`, never the sweep.
pub async fn sweep(
    registry: &LeaseRegistry,
    control: &dyn ControlPlane,
) -> Result<SweepReport, RegistryError> {
    let entries = registry.scan()?;
    let mut report = SweepReport::default();

    if entries.is_empty() {
        debug!("no stale lease records");
        return Ok(report);
    }

    info!(count = entries.len(), "reconciling stale lease records");

    for lease in entries {
        let key = lease.key();
        let mut any_present = false;
        let mut failed = false;

        let steps: [(&str, Result<(), _>); 3] = [
            ("deactivate", control.deactivate(&key).await),
            ("detach", control.detach(&key).await),
            ("destroy_lease", control.destroy_lease(&key, true).await),
        ];

        for (op, result) in steps {
            match result {
                Ok(()) => any_present = true,
                Err(e) if e.is_absent() => {}
                Err(e) => {
                    failed = true;
                    warn!(lease_id = %lease.lease_id, op, error = %e, "recovery teardown step failed");
                }
            }
        }

        if failed {
            report.leaked += 1;
            warn!(
                lease_id = %lease.lease_id,
                volume_id = %lease.volume_id,
                "teardown failed; abandoning lease as leaked"
            );
        } else if any_present {
            report.torn_down += 1;
            info!(lease_id = %lease.lease_id, "stale lease torn down");
        } else {
            report.already_clean += 1;
            info!(lease_id = %lease.lease_id, "stale lease already clean");
        }

        // the record goes away regardless of teardown outcome
        registry.unregister(&lease.lease_id)?;
    }

    info!(
        already_clean = report.already_clean,
        torn_down = report.torn_down,
        leaked = report.leaked,
        "recovery sweep complete"
    );
    Ok(report)
}
