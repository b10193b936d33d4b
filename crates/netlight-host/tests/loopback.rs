//! Host listener and a real device talking over localhost.
//!
//! The device runs its cooperative loop on a plain thread with a WebSocket
//! [`NetBus`], exactly as the firmware binary does; the host side is the
//! production [`ControlServer`] and [`Uploader`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use netlight_core::{CommandSchema, StreamMode};
use netlight_device::config::DeviceConfig;
use netlight_device::stream::LogDisplay;
use netlight_device::transport::{BusKind, NetBus};
use netlight_device::{Device, Extras};
use netlight_host::config::TransferConfig;
use netlight_host::endpoint::Endpoint;
use netlight_host::server::{endpoints, ControlServer, Registry};
use netlight_host::stream;
use netlight_host::upload::{TransferPeer, UploadPlan, Uploader};

struct DeviceOutcome {
    streaming: bool,
    mode: StreamMode,
}

fn spawn_device(
    root: PathBuf,
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<DeviceOutcome> {
    thread::spawn(move || {
        let mut config = DeviceConfig::default();
        config.storage.root = root;
        config.device.device_id = "NL-LOOP".to_string();
        let mut device = Device::new(config, Box::new(LogDisplay::default())).unwrap();
        let mut ctrl = NetBus::new(BusKind::Ws, "ctrl", device.create_parser());
        ctrl.connect(&addr.ip().to_string(), addr.port(), "/ws/NL-LOOP").unwrap();

        while !stop.load(Ordering::Relaxed) {
            if ctrl.poll(Some(&mut device), Extras::default()) == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        DeviceOutcome {
            streaming: device.app.stream.active,
            mode: device.app.stream.mode,
        }
    })
}

async fn wait_for_device(registry: &Registry) -> Arc<Endpoint> {
    for _ in 0..200 {
        if let Some(endpoint) = endpoints(registry).await.into_iter().next() {
            return endpoint;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("device never connected");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upload_over_websocket_lands_on_device_storage() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let schema = Arc::new(CommandSchema::builtin().unwrap());
    let server = ControlServer::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&schema), 16)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    let running = Arc::new(AtomicBool::new(true));
    let server_task = tokio::spawn(server.run(Arc::clone(&running)));

    let stop = Arc::new(AtomicBool::new(false));
    let device = spawn_device(dir.path().to_path_buf(), addr, Arc::clone(&stop));
    let endpoint = wait_for_device(&registry).await;

    let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let plan = UploadPlan::new(42, "/show/loop.bin", data.clone(), 512);
    let transfer = TransferConfig {
        chunk_timeout_ms: 1000,
        end_timeout_ms: 2000,
        ..TransferConfig::default()
    };
    let uploader = Uploader::new(Arc::clone(&schema), &transfer);

    // Act
    let report = uploader
        .upload(&[Arc::clone(&endpoint) as Arc<dyn TransferPeer>], &plan)
        .await;
    stream::start(&endpoint, &schema, 30, StreamMode::Direct).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    stop.store(true, Ordering::Relaxed);
    let outcome = tokio::task::spawn_blocking(move || device.join().unwrap())
        .await
        .unwrap();
    running.store(false, Ordering::Relaxed);
    server_task.await.unwrap();

    // Assert
    assert_eq!(endpoint.label(), "NL-LOOP");
    assert!(report.all_ok(), "{report:?}");
    assert_eq!(report.targets[0].result, Ok(plan.digest_hex()));
    assert_eq!(endpoint.last_acked_offset(), 3000);
    assert_eq!(std::fs::read(dir.path().join("show/loop.bin")).unwrap(), data);
    assert!(outcome.streaming);
    assert_eq!(outcome.mode, StreamMode::Direct);
}
