//! End-to-end: a real client over TCP, through the full pipeline.

use crate::support::{wait_until_registry_empty, MockControlPlane, MockIdentityService, NbdClient};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use volnbd::lease::registry::LeaseRegistry;
use volnbd::nbd::{GatewayContext, NbdServer};

const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
const NBD_EPERM: u32 = 1;

struct Gateway {
    addr: SocketAddr,
    registry: Arc<LeaseRegistry>,
    control: Arc<MockControlPlane>,
    identity: Arc<MockIdentityService>,
    shutdown: CancellationToken,
    _state_dir: TempDir,
}

/// Spin up a plaintext gateway on an ephemeral port with mock collaborators.
async fn start_gateway() -> Gateway {
    let state_dir = TempDir::new().unwrap();
    let registry = Arc::new(LeaseRegistry::open(state_dir.path()).unwrap());
    let control = Arc::new(MockControlPlane::new());
    let identity = Arc::new(MockIdentityService::accepting(&["abc"]));

    let ctx = Arc::new(GatewayContext::new(
        Arc::clone(&identity) as Arc<dyn volnbd::identity::IdentityService>,
        Arc::clone(&control) as Arc<dyn volnbd::control::ControlPlane>,
        Arc::clone(&registry),
        None,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = NbdServer::new(ctx, addr);

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move { server.accept_loop(listener, token).await });

    Gateway {
        addr,
        registry,
        control,
        identity,
        shutdown,
        _state_dir: state_dir,
    }
}

/// A device image with a recognizable pattern.
fn make_device(dir: &TempDir, name: &str, len: usize) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

#[tokio::test]
async fn test_read_write_round_trip_and_single_release() {
    let device_dir = TempDir::new().unwrap();
    let gateway = start_gateway().await;
    let device = make_device(&device_dir, "vdi-123.img", 256 * 1024);
    gateway.control.add_volume("vdi-123", "sr-1", false, device.clone());

    let mut client = NbdClient::connect(gateway.addr, "/vdi-123?session_id=abc")
        .await
        .unwrap();

    assert_eq!(client.size, 256 * 1024);
    assert_eq!(client.transmission_flags & NBD_FLAG_READ_ONLY, 0);
    assert_eq!(gateway.identity.validate_calls.load(Ordering::SeqCst), 1);

    // the read-write flag of the volume selects the lease mode
    let entries = gateway.registry.scan().unwrap();
    assert_eq!(entries.len(), 1, "exactly one record while attached");
    assert_eq!(entries[0].volume_id, "vdi-123");
    assert_eq!(entries[0].sr_id, "sr-1");
    assert_eq!(entries[0].mode, volnbd::lease::AccessMode::ReadWrite);

    let (errno, data) = client.read(4096, 512).await.unwrap();
    assert_eq!(errno, 0);
    let expected: Vec<u8> = (4096..4096 + 512).map(|i| (i % 251) as u8).collect();
    assert_eq!(data, expected);

    let payload = vec![0xA5u8; 1024];
    assert_eq!(client.write(0, &payload).await.unwrap(), 0);
    assert_eq!(client.flush().await.unwrap(), 0);
    let (errno, data) = client.read(0, 1024).await.unwrap();
    assert_eq!(errno, 0);
    assert_eq!(data, payload);

    client.disconnect().await.unwrap();
    wait_until_registry_empty(&gateway.registry).await;

    // release ran exactly once: one full teardown sequence
    assert_eq!(gateway.control.deactivate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.control.detach_calls.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.control.destroy_calls.load(Ordering::SeqCst), 1);

    gateway.shutdown.cancel();
}

#[tokio::test]
async fn test_read_only_volume_rejects_writes() {
    let device_dir = TempDir::new().unwrap();
    let gateway = start_gateway().await;
    let device = make_device(&device_dir, "vdi-ro.img", 64 * 1024);
    gateway.control.add_volume("vdi-ro", "sr-1", true, device.clone());

    let mut client = NbdClient::connect(gateway.addr, "/vdi-ro?session_id=abc")
        .await
        .unwrap();
    assert_ne!(client.transmission_flags & NBD_FLAG_READ_ONLY, 0);

    let before = std::fs::read(&device).unwrap();
    assert_eq!(client.write(0, &[0xFFu8; 512]).await.unwrap(), NBD_EPERM);
    assert_eq!(std::fs::read(&device).unwrap(), before, "device must be untouched");

    let (errno, _) = client.read(0, 512).await.unwrap();
    assert_eq!(errno, 0, "reads still work on a read-only export");

    client.disconnect().await.unwrap();
    wait_until_registry_empty(&gateway.registry).await;
    gateway.shutdown.cancel();
}

#[tokio::test]
async fn test_unresolvable_volume_creates_no_lease() {
    let gateway = start_gateway().await;

    let result = NbdClient::connect(gateway.addr, "/vdi-999?session_id=abc").await;
    assert!(result.is_err(), "connection must close without export info");

    assert_eq!(gateway.control.resolve_calls.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.control.create_calls.load(Ordering::SeqCst), 0);
    assert_eq!(gateway.control.attach_calls.load(Ordering::SeqCst), 0);
    assert!(gateway.registry.scan().unwrap().is_empty());

    gateway.shutdown.cancel();
}

#[tokio::test]
async fn test_missing_session_is_rejected_before_any_control_call() {
    let gateway = start_gateway().await;

    let result = NbdClient::connect(gateway.addr, "/vdi-123").await;
    assert!(result.is_err());

    assert_eq!(gateway.identity.validate_calls.load(Ordering::SeqCst), 0);
    assert_eq!(gateway.control.total_calls(), 0, "acquire must never run unauthenticated");
    assert!(gateway.registry.scan().unwrap().is_empty());

    gateway.shutdown.cancel();
}

#[tokio::test]
async fn test_invalid_session_is_rejected_before_any_control_call() {
    let gateway = start_gateway().await;

    let result = NbdClient::connect(gateway.addr, "/vdi-123?session_id=expired").await;
    assert!(result.is_err());

    assert_eq!(gateway.identity.validate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.control.total_calls(), 0);
    assert!(gateway.registry.scan().unwrap().is_empty());

    gateway.shutdown.cancel();
}

#[tokio::test]
async fn test_concurrent_clients_are_isolated() {
    let device_dir = TempDir::new().unwrap();
    let gateway = start_gateway().await;
    let device_a = make_device(&device_dir, "vdi-a.img", 64 * 1024);
    let device_b = make_device(&device_dir, "vdi-b.img", 128 * 1024);
    gateway.control.add_volume("vdi-a", "sr-1", false, device_a);
    gateway.control.add_volume("vdi-b", "sr-2", false, device_b);

    let client_a = NbdClient::connect(gateway.addr, "/vdi-a?session_id=abc")
        .await
        .unwrap();
    let client_b = NbdClient::connect(gateway.addr, "/vdi-b?session_id=abc")
        .await
        .unwrap();

    assert_eq!(client_a.size, 64 * 1024);
    assert_eq!(client_b.size, 128 * 1024);

    let entries = gateway.registry.scan().unwrap();
    assert_eq!(entries.len(), 2);
    assert_ne!(entries[0].lease_id, entries[1].lease_id);

    // an attach failure on a third connection disturbs neither
    gateway.control.add_volume("vdi-c", "sr-1", false, std::path::PathBuf::from("/dev/null"));
    gateway.control.set_fail_attach("vdi-c");
    let result = NbdClient::connect(gateway.addr, "/vdi-c?session_id=abc").await;
    assert!(result.is_err());
    assert_eq!(gateway.registry.scan().unwrap().len(), 2, "healthy leases untouched");

    client_a.disconnect().await.unwrap();
    client_b.disconnect().await.unwrap();
    wait_until_registry_empty(&gateway.registry).await;

    gateway.shutdown.cancel();
}

#[tokio::test]
async fn test_abrupt_disconnect_still_releases() {
    let device_dir = TempDir::new().unwrap();
    let gateway = start_gateway().await;
    let device = make_device(&device_dir, "vdi-drop.img", 64 * 1024);
    gateway.control.add_volume("vdi-drop", "sr-1", false, device);

    let client = NbdClient::connect(gateway.addr, "/vdi-drop?session_id=abc")
        .await
        .unwrap();
    assert_eq!(gateway.registry.scan().unwrap().len(), 1);

    // drop the socket without NBD_CMD_DISC; the server sees EOF
    drop(client);
    wait_until_registry_empty(&gateway.registry).await;
    assert_eq!(gateway.control.destroy_calls.load(Ordering::SeqCst), 1);

    gateway.shutdown.cancel();
}
