//! Test harness: a shell script standing in for the Firecracker binary and
//! an in-process control plane listening on the socket it was given.

#![allow(dead_code)]

use async_trait::async_trait;
use fcrun_core::{RunConfig, RunConfigBuilder, Runner};
use fcrun_vm::HostNetwork;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use serde_json::Value;
use std::convert::Infallible;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

pub const RESULT_LINE: &str = r#"RESULT: {"workspace_files_delta":3,"workspace_bytes_delta":120}"#;
pub const METRICS_LINE: &str = r#"{"utc_timestamp_ms":1,"net_eth0":{"rx_bytes_count":5,"tx_bytes_count":7},"block_rootfs":{"read_bytes":4096,"write_bytes":1024}}"#;

/// Scratch directory with a fake hypervisor, kernel and rootfs.
pub struct Fixture {
    pub dir: TempDir,
    pub run_root: PathBuf,
    pub firecracker: PathBuf,
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
    pid_file: PathBuf,
    announce: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let run_root = dir.path().join("runs");
        std::fs::create_dir(&run_root).unwrap();

        let kernel = dir.path().join("vmlinux");
        std::fs::write(&kernel, "kernel").unwrap();
        let rootfs = dir.path().join("rootfs.ext4");
        std::fs::write(&rootfs, "rootfs image").unwrap();

        let pid_file = dir.path().join("hypervisor.pid");
        let announce = dir.path().join("socket.path");
        let firecracker = dir.path().join("firecracker");
        let script = format!(
            "#!/bin/sh\necho $$ > {pid}\necho \"$2\" > {announce}.tmp\nmv {announce}.tmp {announce}\nexec sleep 60\n",
            pid = pid_file.display(),
            announce = announce.display(),
        );
        std::fs::write(&firecracker, script).unwrap();
        std::fs::set_permissions(&firecracker, std::fs::Permissions::from_mode(0o755)).unwrap();

        Self {
            dir,
            run_root,
            firecracker,
            kernel,
            rootfs,
            pid_file,
            announce,
        }
    }

    pub fn config(&self) -> RunConfigBuilder {
        RunConfig::builder()
            .firecracker(&self.firecracker)
            .kernel(&self.kernel)
            .rootfs(&self.rootfs)
            .timeout_secs(10)
    }

    pub fn runner(&self) -> Runner {
        Runner::new().with_run_root(&self.run_root)
    }

    /// Serve the control API once the fake hypervisor announces its socket.
    pub fn serve(&self, behavior: Behavior) -> StubControlPlane {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(serve(
            self.announce.clone(),
            Arc::new(behavior),
            Arc::clone(&requests),
        ));
        StubControlPlane { requests, task }
    }

    pub fn hypervisor_pid(&self) -> u32 {
        std::fs::read_to_string(&self.pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    }

    pub fn run_dirs(&self) -> Vec<PathBuf> {
        std::fs::read_dir(&self.run_root)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect()
    }
}

pub fn process_gone(pid: u32) -> bool {
    !Path::new(&format!("/proc/{pid}")).exists()
}

/// How the stub control plane reacts.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Console line written after `InstanceStart`.
    pub completion_line: Option<String>,
    /// Metrics record written after `FlushMetrics`.
    pub metrics_line: Option<String>,
    /// Request path answered with 400.
    pub reject_path: Option<String>,
    /// Write the metrics record before answering `FlushMetrics`, as Firecracker does.
    pub metrics_before_reply: bool,
}

impl Behavior {
    pub fn completing(line: &str) -> Self {
        Self {
            completion_line: Some(line.to_string()),
            metrics_line: Some(METRICS_LINE.to_string()),
            reject_path: None,
            metrics_before_reply: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub path: String,
    pub body: Value,
}

pub struct StubControlPlane {
    requests: Arc<Mutex<Vec<Recorded>>>,
    task: JoinHandle<()>,
}

impl StubControlPlane {
    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.path).collect()
    }

    pub fn body(&self, path: &str) -> Value {
        self.requests()
            .into_iter()
            .find(|r| r.path == path)
            .map(|r| r.body)
            .unwrap_or(Value::Null)
    }
}

impl Drop for StubControlPlane {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct StubState {
    log_path: PathBuf,
    metrics_path: Mutex<Option<PathBuf>>,
    behavior: Arc<Behavior>,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

async fn serve(announce: PathBuf, behavior: Arc<Behavior>, requests: Arc<Mutex<Vec<Recorded>>>) {
    let socket = loop {
        if let Ok(text) = tokio::fs::read_to_string(&announce).await {
            if !text.trim().is_empty() {
                break PathBuf::from(text.trim());
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let Ok(listener) = UnixListener::bind(&socket) else {
        return;
    };
    let state = Arc::new(StubState {
        log_path: socket.with_file_name("firecracker.log"),
        metrics_path: Mutex::new(None),
        behavior,
        requests,
    });

    while let Ok((stream, _)) = listener.accept().await {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(handle(state, req).await) }
            });
            let _ = Http::new().serve_connection(stream, service).await;
        });
    }
}

async fn handle(state: Arc<StubState>, req: Request<Body>) -> Response<Body> {
    let path = req.uri().path().to_string();
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .unwrap_or_default();
    let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    state.requests.lock().unwrap().push(Recorded {
        path: path.clone(),
        body: body.clone(),
    });

    if state.behavior.reject_path.as_deref() == Some(path.as_str()) {
        return Response::builder()
            .status(400)
            .body(Body::from(r#"{"fault_message":"invalid request"}"#))
            .unwrap();
    }

    match (path.as_str(), body["action_type"].as_str()) {
        ("/metrics", _) => {
            if let Some(metrics) = body["metrics_path"].as_str() {
                *state.metrics_path.lock().unwrap() = Some(PathBuf::from(metrics));
            }
        }
        ("/actions", Some("InstanceStart")) => {
            if let Some(line) = &state.behavior.completion_line {
                append_later(state.log_path.clone(), line.clone());
            }
        }
        ("/actions", Some("FlushMetrics")) => {
            let metrics = state.metrics_path.lock().unwrap().clone();
            if let (Some(line), Some(metrics)) = (&state.behavior.metrics_line, metrics) {
                if state.behavior.metrics_before_reply {
                    append(&metrics, line);
                } else {
                    append_later(metrics, line.clone());
                }
            }
        }
        _ => {}
    }

    Response::builder().status(204).body(Body::empty()).unwrap()
}

fn append(path: &Path, line: &str) {
    if let Ok(mut file) = std::fs::OpenOptions::new().append(true).open(path) {
        let _ = writeln!(file, "{line}");
    }
}

fn append_later(path: PathBuf, line: String) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        append(&path, &line);
    });
}

/// Host network that records calls instead of touching the kernel.
#[derive(Default)]
pub struct RecordingNetwork {
    pub fail_create: bool,
    pub events: Mutex<Vec<String>>,
}

impl RecordingNetwork {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostNetwork for RecordingNetwork {
    async fn create_tap(&self, name: &str) -> fcrun_vm::Result<()> {
        self.events.lock().unwrap().push(format!("create {name}"));
        if self.fail_create {
            return Err(fcrun_vm::VmError::Network {
                device: name.to_string(),
                message: "Operation not permitted".into(),
            });
        }
        Ok(())
    }

    async fn delete_tap(&self, name: &str) {
        self.events.lock().unwrap().push(format!("delete {name}"));
    }
}
