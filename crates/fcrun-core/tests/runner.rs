//! End-to-end runs against a scripted hypervisor and a stub control plane.

mod common;

use common::{process_gone, Behavior, Fixture, RecordingNetwork, RESULT_LINE};
use fcrun_core::{CoreError, RunConfig, RunState, EXIT_CODE_INCOMPLETE};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_completed_run_produces_receipt() {
    let fx = Fixture::new();
    let stub = fx.serve(Behavior::completing(RESULT_LINE));
    let config = fx.config().marker_prefix("RESULT:").build().unwrap();

    let receipt = fx.runner().run(config).await.unwrap();

    assert_eq!(receipt.exit_code, 0);
    assert!(receipt.wait_err.is_none());
    assert_eq!(receipt.workspace_files_delta, Some(3));
    assert_eq!(receipt.workspace_bytes_delta, Some(120));
    assert_eq!(receipt.net_rx_bytes, 5);
    assert_eq!(receipt.net_tx_bytes, 7);
    assert_eq!(receipt.block_read_bytes, 4096);
    assert_eq!(receipt.block_write_bytes, 1024);
    assert_eq!(receipt.metrics_lines, 1);
    assert!(receipt.metrics_raw.is_none());
    assert!(receipt.duration_ms >= 0);
    assert_eq!(receipt.kernel, fx.kernel);

    assert_eq!(
        stub.paths(),
        vec![
            "/metrics",
            "/machine-config",
            "/boot-source",
            "/drives/rootfs",
            "/actions",
            "/actions",
        ]
    );
    let requests = stub.requests();
    assert_eq!(requests[4].body["action_type"], "InstanceStart");
    assert_eq!(requests[5].body["action_type"], "FlushMetrics");
    assert_eq!(stub.body("/metrics")["metrics_flush_interval_ms"], 200);

    let machine = stub.body("/machine-config");
    assert_eq!(machine["vcpu_count"], 2);
    assert_eq!(machine["mem_size_mib"], 2048);
    assert_eq!(machine["smt"], false);

    let boot = stub.body("/boot-source");
    assert_eq!(boot["kernel_image_path"], fx.kernel.to_str().unwrap());
    assert_eq!(
        boot["boot_args"],
        "console=ttyS0 reboot=k panic=1 pci=off systemd.unit=fc-task.service"
    );

    let drive = stub.body("/drives/rootfs");
    assert_eq!(drive["is_root_device"], true);
    assert_eq!(drive["is_read_only"], false);
    let drive_path = drive["path_on_host"].as_str().unwrap();
    assert!(drive_path.starts_with(fx.run_root.to_str().unwrap()));
    assert!(drive_path.ends_with("rootfs.ext4"));

    assert!(process_gone(fx.hypervisor_pid()));
    assert!(fx.run_dirs().is_empty());
}

#[tokio::test]
async fn test_flush_written_before_reply_is_not_waited_out() {
    let fx = Fixture::new();
    let _stub = fx.serve(Behavior {
        metrics_before_reply: true,
        ..Behavior::completing(RESULT_LINE)
    });
    let config = fx.config().marker_prefix("RESULT:").build().unwrap();

    let started = std::time::Instant::now();
    let receipt = fx.runner().run(config).await.unwrap();

    assert_eq!(receipt.exit_code, 0);
    assert_eq!(receipt.net_rx_bytes, 5);
    assert_eq!(receipt.metrics_lines, 1);
    // Completion lands ~100 ms after start and the script exits on SIGTERM.
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[tokio::test]
async fn test_guest_that_never_finishes_is_incomplete() {
    let fx = Fixture::new();
    let stub = fx.serve(Behavior::default());
    let config = fx.config().timeout_secs(2).build().unwrap();

    let started = std::time::Instant::now();
    let receipt = fx.runner().run(config).await.unwrap();

    assert_eq!(receipt.exit_code, EXIT_CODE_INCOMPLETE);
    assert_eq!(receipt.wait_err.as_deref(), Some("run deadline exceeded"));
    assert!(receipt.workspace_files_delta.is_none());
    assert!(started.elapsed() < Duration::from_secs(8));
    assert_eq!(stub.paths().last().map(String::as_str), Some("/actions"));
    assert_eq!(stub.paths().len(), 5);

    assert!(process_gone(fx.hypervisor_pid()));
    assert!(fx.run_dirs().is_empty());
}

#[tokio::test]
async fn test_keep_run_dir() {
    let fx = Fixture::new();
    let _stub = fx.serve(Behavior::completing("[    1.234] reboot: Powering off."));
    let config = fx
        .config()
        .keep_run_dir(true)
        .include_raw_metrics(true)
        .build()
        .unwrap();

    let receipt = fx.runner().run(config).await.unwrap();

    assert_eq!(receipt.exit_code, 0);
    assert_eq!(receipt.workspace_files_delta, Some(0));
    assert!(receipt.metrics_raw.unwrap().contains("net_eth0"));

    let dirs = fx.run_dirs();
    assert_eq!(dirs.len(), 1);
    let run_dir = &dirs[0];
    assert!(run_dir
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("run-"));
    assert_eq!(receipt.firecracker_log_path, run_dir.join("firecracker.log"));
    let log = std::fs::read_to_string(run_dir.join("firecracker.log")).unwrap();
    assert!(log.contains("Powering off."));
    assert_eq!(
        std::fs::read(run_dir.join("rootfs.ext4")).unwrap(),
        b"rootfs image"
    );
    assert!(run_dir.join("metrics.log").exists());
}

#[tokio::test]
async fn test_socket_never_ready() {
    let fx = Fixture::new();
    let config = fx.config().build().unwrap();

    let err = fx
        .runner()
        .with_socket_timeout(Duration::from_millis(500))
        .run(config)
        .await
        .unwrap_err();

    assert_eq!(err.state(), Some(RunState::ProcessStarted));
    assert!(err.to_string().contains("waiting for unix socket"));
    assert!(process_gone(fx.hypervisor_pid()));
    assert!(fx.run_dirs().is_empty());
}

#[tokio::test]
async fn test_rejected_api_call_aborts_setup() {
    let fx = Fixture::new();
    let stub = fx.serve(Behavior {
        reject_path: Some("/boot-source".into()),
        ..Behavior::completing(RESULT_LINE)
    });
    let config = fx.config().build().unwrap();

    let err = fx.runner().run(config).await.unwrap_err();

    match &err {
        CoreError::Setup { state, source } => {
            assert_eq!(*state, RunState::SocketReady);
            let message = source.to_string();
            assert!(message.contains("/boot-source"));
            assert!(message.contains("400"));
            assert!(message.contains("invalid request"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(stub.paths(), vec!["/metrics", "/machine-config", "/boot-source"]);
    assert!(process_gone(fx.hypervisor_pid()));
    assert!(fx.run_dirs().is_empty());
}

#[tokio::test]
async fn test_network_and_mmds() {
    let fx = Fixture::new();
    let stub = fx.serve(Behavior::completing("Powering off."));
    let network = Arc::new(RecordingNetwork::default());
    let metadata = json!({"task": {"id": "42", "args": ["--fast"]}});
    let config = fx
        .config()
        .with_tap()
        .with_mmds(metadata.clone())
        .build()
        .unwrap();
    let tap = config.network.tap_name.clone();

    let receipt = fx
        .runner()
        .with_network(network.clone())
        .run(config)
        .await
        .unwrap();
    assert_eq!(receipt.exit_code, 0);

    assert_eq!(
        stub.paths(),
        vec![
            "/metrics",
            "/machine-config",
            "/boot-source",
            "/drives/rootfs",
            "/network-interfaces/eth0",
            "/mmds/config",
            "/mmds",
            "/actions",
            "/actions",
        ]
    );

    let iface = stub.body("/network-interfaces/eth0");
    assert_eq!(iface["iface_id"], "eth0");
    assert_eq!(iface["host_dev_name"], tap.as_str());
    assert_eq!(iface["guest_mac"], "02:FC:00:00:00:01");

    let mmds = stub.body("/mmds/config");
    assert_eq!(mmds["network_interfaces"], json!(["eth0"]));
    assert_eq!(mmds["version"], "V2");
    assert_eq!(stub.body("/mmds"), metadata);

    assert_eq!(
        network.events(),
        vec![format!("create {tap}"), format!("delete {tap}")]
    );
    assert!(fx.run_dirs().is_empty());
}

#[tokio::test]
async fn test_tap_failure_aborts_setup() {
    let fx = Fixture::new();
    let stub = fx.serve(Behavior::completing(RESULT_LINE));
    let network = Arc::new(RecordingNetwork {
        fail_create: true,
        ..RecordingNetwork::default()
    });
    let config = fx.config().with_tap().build().unwrap();
    let tap = config.network.tap_name.clone();

    let err = fx
        .runner()
        .with_network(network.clone())
        .run(config)
        .await
        .unwrap_err();

    assert_eq!(err.state(), Some(RunState::Configured));
    assert!(err.to_string().contains("Operation not permitted"));
    assert_eq!(network.events(), vec![format!("create {tap}")]);
    assert!(!stub.paths().iter().any(|p| p.starts_with("/network-interfaces")));
    assert!(process_gone(fx.hypervisor_pid()));
    assert!(fx.run_dirs().is_empty());
}

#[tokio::test]
async fn test_cancel_ends_wait() {
    let fx = Fixture::new();
    let _stub = fx.serve(Behavior::default());
    let config = fx.config().timeout_secs(60).build().unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(700)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let receipt = fx
        .runner()
        .run_with_cancel(config, cancel)
        .await
        .unwrap();

    assert_eq!(receipt.exit_code, EXIT_CODE_INCOMPLETE);
    assert_eq!(receipt.wait_err.as_deref(), Some("run cancelled"));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(process_gone(fx.hypervisor_pid()));
    assert!(fx.run_dirs().is_empty());
}

#[tokio::test]
async fn test_missing_kernel_creates_nothing() {
    let fx = Fixture::new();
    let config = RunConfig {
        firecracker_bin: fx.firecracker.clone(),
        rootfs: fx.rootfs.clone(),
        ..RunConfig::default()
    };

    let err = fx.runner().run(config).await.unwrap_err();
    assert!(err.is_validation());
    assert!(fx.run_dirs().is_empty());
}

/// Boots a real guest. Needs KVM and:
/// `FCRUN_TEST_FIRECRACKER`, `FCRUN_TEST_KERNEL`, `FCRUN_TEST_ROOTFS`.
#[tokio::test]
#[ignore = "requires Linux + KVM + Firecracker"]
async fn test_real_firecracker() {
    let var = |name: &str| std::env::var(name).unwrap_or_else(|_| panic!("{name} not set"));
    let config = RunConfig::builder()
        .firecracker(var("FCRUN_TEST_FIRECRACKER"))
        .kernel(var("FCRUN_TEST_KERNEL"))
        .rootfs(var("FCRUN_TEST_ROOTFS"))
        .vcpus(1)
        .mem_mib(256)
        .timeout_secs(60)
        .build()
        .unwrap();

    let receipt = fcrun_core::Runner::new().run(config).await.unwrap();
    println!("{}", serde_json::to_string_pretty(&receipt).unwrap());
    assert!(receipt.metrics_lines > 0);
}
