//! Registry invariants and isolation across concurrent acquires.

use crate::support::MockControlPlane;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

use volnbd::control::ControlPlane;
use volnbd::identity::SessionIdentity;
use volnbd::lease::orchestrator::{AttachError, AttachmentOrchestrator};
use volnbd::lease::registry::LeaseRegistry;
use volnbd::lease::AccessMode;

fn identity(principal: &str) -> SessionIdentity {
    SessionIdentity {
        token: "tok".to_string(),
        principal: principal.to_string(),
    }
}

fn control_with_volumes(ids: &[&str]) -> Arc<MockControlPlane> {
    let control = Arc::new(MockControlPlane::new());
    for id in ids {
        control.add_volume(id, "sr-1", false, PathBuf::from(format!("/dev/mock/{id}")));
    }
    control
}

#[tokio::test]
async fn test_concurrent_acquires_get_distinct_leases_and_devices() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(LeaseRegistry::open(dir.path()).unwrap());
    let control = control_with_volumes(&["vdi-a", "vdi-b", "vdi-c", "vdi-d"]);
    let orch = Arc::new(AttachmentOrchestrator::new(
        Arc::clone(&registry),
        Arc::clone(&control) as Arc<dyn ControlPlane>,
    ));

    let mut handles = Vec::new();
    for volume_id in ["vdi-a", "vdi-b", "vdi-c", "vdi-d"] {
        let orch = Arc::clone(&orch);
        let control = Arc::clone(&control);
        handles.push(tokio::spawn(async move {
            let volume = control.resolve_volume(volume_id).await.unwrap();
            orch.acquire(&identity("root"), Uuid::new_v4(), &volume, AccessMode::ReadWrite)
                .await
                .unwrap()
        }));
    }

    let mut leases = Vec::new();
    for handle in handles {
        leases.push(handle.await.unwrap());
    }

    let lease_ids: HashSet<_> = leases.iter().map(|(l, _)| l.lease_id.clone()).collect();
    let devices: HashSet<_> = leases.iter().map(|(_, d)| d.clone()).collect();
    assert_eq!(lease_ids.len(), 4, "lease ids must be distinct");
    assert_eq!(devices.len(), 4, "device paths must be distinct");

    let entries = registry.scan().unwrap();
    assert_eq!(entries.len(), 4);

    for (lease, _) in leases {
        orch.release(lease).await;
    }
    assert!(registry.scan().unwrap().is_empty());
}

#[tokio::test]
async fn test_attach_failure_leaves_other_connections_untouched() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(LeaseRegistry::open(dir.path()).unwrap());
    let control = control_with_volumes(&["vdi-good", "vdi-bad"]);
    control.set_fail_attach("vdi-bad");
    let orch = AttachmentOrchestrator::new(Arc::clone(&registry), Arc::clone(&control) as Arc<dyn ControlPlane>);

    let good_volume = control.resolve_volume("vdi-good").await.unwrap();
    let (good_lease, good_device) = orch
        .acquire(&identity("root"), Uuid::new_v4(), &good_volume, AccessMode::ReadWrite)
        .await
        .unwrap();

    let bad_volume = control.resolve_volume("vdi-bad").await.unwrap();
    let result = orch
        .acquire(&identity("root"), Uuid::new_v4(), &bad_volume, AccessMode::ReadWrite)
        .await;
    assert!(matches!(result, Err(AttachError::Control { op: "attach", .. })));

    // the healthy lease is exactly as it was
    let entries = registry.scan().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].lease_id, good_lease.lease_id);
    assert_eq!(good_device, PathBuf::from("/dev/mock/vdi-good"));

    orch.release(good_lease).await;
    assert!(registry.scan().unwrap().is_empty());
}

#[tokio::test]
async fn test_same_principal_two_connections_never_collide() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(LeaseRegistry::open(dir.path()).unwrap());
    let control = control_with_volumes(&["vdi-a"]);
    let orch = AttachmentOrchestrator::new(Arc::clone(&registry), Arc::clone(&control) as Arc<dyn ControlPlane>);

    let volume = control.resolve_volume("vdi-a").await.unwrap();
    let (first, _) = orch
        .acquire(&identity("root"), Uuid::new_v4(), &volume, AccessMode::ReadOnly)
        .await
        .unwrap();
    let (second, _) = orch
        .acquire(&identity("root"), Uuid::new_v4(), &volume, AccessMode::ReadOnly)
        .await
        .unwrap();

    assert_ne!(first.lease_id, second.lease_id);
    assert_eq!(registry.scan().unwrap().len(), 2);

    orch.release(first).await;
    assert_eq!(registry.scan().unwrap().len(), 1, "releasing one leaves the other");
    orch.release(second).await;
    assert!(registry.scan().unwrap().is_empty());
}

#[tokio::test]
async fn test_release_counts_one_full_teardown() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(LeaseRegistry::open(dir.path()).unwrap());
    let control = control_with_volumes(&["vdi-a"]);
    let orch = AttachmentOrchestrator::new(Arc::clone(&registry), Arc::clone(&control) as Arc<dyn ControlPlane>);

    let volume = control.resolve_volume("vdi-a").await.unwrap();
    let (lease, _) = orch
        .acquire(&identity("root"), Uuid::new_v4(), &volume, AccessMode::ReadWrite)
        .await
        .unwrap();
    orch.release(lease).await;

    assert_eq!(control.deactivate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(control.detach_calls.load(Ordering::SeqCst), 1);
    assert_eq!(control.destroy_calls.load(Ordering::SeqCst), 1);
}
