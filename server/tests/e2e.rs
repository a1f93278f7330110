//! End-to-end tests: a real `jobworker` binary served over mutual TLS, driven
//! through the generated client.
//!
//! These need root (the server mounts a cgroup2 hierarchy) and the openssl
//! tool (throwaway PKI); they skip themselves otherwise.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use protobuf::job_worker_client::JobWorkerClient;
use protobuf::{
    Command as WireCommand, Limits as WireLimits, OutputRequest, StartRequest, StatusRequest,
    StopRequest,
};
use tempfile::TempDir;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tonic::Code;

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn have_openssl() -> bool {
    Command::new("openssl")
        .arg("version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Every test calls this first; e2e runs are root-only.
fn skip_unless_privileged() -> bool {
    if !is_root() {
        eprintln!("skipping: requires root");
        return true;
    }
    if !have_openssl() {
        eprintln!("skipping: requires the openssl tool");
        return true;
    }
    false
}

struct TestServer {
    child: Child,
    dir: TempDir,
    port: u16,
}

impl TestServer {
    async fn start(port: u16) -> Self {
        let dir = TempDir::new().expect("tempdir");

        let script = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scripts/gen-test-certs.sh");
        let generated = Command::new("bash")
            .arg(&script)
            .arg(dir.path())
            .output()
            .expect("run gen-test-certs.sh");
        assert!(
            generated.status.success(),
            "cert generation failed: {}",
            String::from_utf8_lossy(&generated.stderr)
        );

        let child = Command::new(env!("CARGO_BIN_EXE_jobworker"))
            .arg("--cert")
            .arg(dir.path().join("server.crt"))
            .arg("--key")
            .arg(dir.path().join("server.key"))
            .arg("--ca-cert")
            .arg(dir.path().join("ca.crt"))
            .arg("--port")
            .arg(port.to_string())
            .arg("--output-root")
            .arg(dir.path().join("output"))
            .arg("--cgroup-root")
            .arg(dir.path().join("cgroup2"))
            .arg("serve")
            .env("RUST_LOG", "info")
            .spawn()
            .expect("spawn jobworker");

        let server = Self { child, dir, port };
        server.wait_until_listening().await;
        server
    }

    async fn wait_until_listening(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if tokio::net::TcpStream::connect(("127.0.0.1", self.port))
                .await
                .is_ok()
            {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "server did not start listening on port {}",
                self.port
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn certs(&self) -> &Path {
        self.dir.path()
    }

    fn output_root(&self) -> PathBuf {
        self.dir.path().join("output")
    }

    fn cgroup_base(&self) -> PathBuf {
        self.dir.path().join("cgroup2/jobworker")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        // SIGTERM first: graceful shutdown unmounts the test cgroup2 fs.
        unsafe {
            libc::kill(self.child.id() as i32, libc::SIGTERM);
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if matches!(self.child.try_wait(), Ok(Some(_))) {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

async fn try_connect(
    certs: &Path,
    user: &str,
    port: u16,
) -> Result<JobWorkerClient<Channel>, tonic::transport::Error> {
    let ca = std::fs::read(certs.join("ca.crt")).expect("read ca");
    let cert = std::fs::read(certs.join(format!("{user}.crt"))).expect("read client cert");
    let key = std::fs::read(certs.join(format!("{user}.key"))).expect("read client key");

    let tls = ClientTlsConfig::new()
        .domain_name("localhost")
        .ca_certificate(Certificate::from_pem(ca))
        .identity(Identity::from_pem(cert, key));

    let channel = Channel::from_shared(format!("https://localhost:{port}"))
        .expect("endpoint")
        .tls_config(tls)
        .expect("tls config")
        .connect()
        .await?;
    Ok(JobWorkerClient::new(channel))
}

async fn connect(certs: &Path, user: &str, port: u16) -> JobWorkerClient<Channel> {
    try_connect(certs, user, port).await.expect("connect")
}

fn start_request(name: &str, args: &[&str], limits: WireLimits) -> StartRequest {
    StartRequest {
        command: Some(WireCommand {
            name: name.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }),
        limits: Some(limits),
    }
}

async fn wait_for_status(
    client: &mut JobWorkerClient<Channel>,
    job_id: &str,
    expected: protobuf::Status,
) -> protobuf::StatusDetail {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let detail = client
            .status(StatusRequest {
                job_id: job_id.to_string(),
            })
            .await
            .expect("status")
            .into_inner()
            .status
            .expect("status detail");
        if detail.status == expected as i32 {
            return detail;
        }
        assert!(
            Instant::now() < deadline,
            "job {job_id} never reached {expected:?}; last: {detail:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn collect_output(client: &mut JobWorkerClient<Channel>, job_id: &str) -> Vec<u8> {
    let mut stream = client
        .output(OutputRequest {
            job_id: job_id.to_string(),
        })
        .await
        .expect("output")
        .into_inner();
    let mut received = Vec::new();
    while let Some(resp) = stream.message().await.expect("output frame") {
        received.extend_from_slice(&resp.output);
    }
    received
}

#[tokio::test]
async fn start_reports_the_pending_snapshot_then_exits_zero() {
    if skip_unless_privileged() {
        return;
    }
    let server = TestServer::start(52701).await;
    let mut client = connect(server.certs(), "alice", server.port).await;

    let resp = client
        .start(start_request("ls", &[], WireLimits::default()))
        .await
        .expect("start")
        .into_inner();

    assert!(!resp.job_id.is_empty());
    let status = resp.status.expect("status detail");
    assert_eq!(status.status, protobuf::Status::Pending as i32);
    assert_eq!(status.exit_code, -1);

    let exited = wait_for_status(&mut client, &resp.job_id, protobuf::Status::Exited).await;
    assert_eq!(exited.exit_code, 0);
}

#[tokio::test]
async fn limits_are_echoed_and_written_into_the_cgroup() {
    if skip_unless_privileged() {
        return;
    }
    let server = TestServer::start(52702).await;
    let mut client = connect(server.certs(), "alice", server.port).await;

    let limits = WireLimits {
        memory: 100_000,
        cpus: 1.5,
        disk_write_bps: 10_000,
        disk_read_bps: 10_000,
    };
    let resp = client
        .start(start_request("sleep", &["5"], limits.clone()))
        .await
        .expect("start")
        .into_inner();
    assert_eq!(resp.limits, Some(limits));

    // Exactly one job is running, so its cgroup is the only entry under the
    // base directory.
    let cgroup = std::fs::read_dir(server.cgroup_base())
        .expect("read cgroup base")
        .flatten()
        .map(|entry| entry.path())
        .find(|path| path.is_dir())
        .expect("job cgroup directory");

    let memory_high = std::fs::read_to_string(cgroup.join("memory.high")).expect("memory.high");
    assert_eq!(memory_high.trim(), "100000");
    let cpu_max = std::fs::read_to_string(cgroup.join("cpu.max")).expect("cpu.max");
    assert_eq!(cpu_max.trim(), "150000 100000");

    // io.max only carries lines when the host has physical disks at major 8.
    if Path::new("/dev/sda").exists() {
        let io_max = std::fs::read_to_string(cgroup.join("io.max")).expect("io.max");
        assert!(io_max.contains("rbps=10000"), "io.max: {io_max}");
        assert!(io_max.contains("wbps=10000"), "io.max: {io_max}");
    }

    client
        .stop(StopRequest {
            job_id: resp.job_id,
        })
        .await
        .expect("stop");
}

#[tokio::test]
async fn stop_moves_a_running_job_to_stopped_and_is_not_repeatable() {
    if skip_unless_privileged() {
        return;
    }
    let server = TestServer::start(52703).await;
    let mut client = connect(server.certs(), "alice", server.port).await;

    let resp = client
        .start(start_request("sleep", &["10"], WireLimits::default()))
        .await
        .expect("start")
        .into_inner();

    wait_for_status(&mut client, &resp.job_id, protobuf::Status::Running).await;

    client
        .stop(StopRequest {
            job_id: resp.job_id.clone(),
        })
        .await
        .expect("stop");

    let stopped = wait_for_status(&mut client, &resp.job_id, protobuf::Status::Stopped).await;
    assert_eq!(stopped.exit_code, -1);

    let second = client
        .stop(StopRequest {
            job_id: resp.job_id,
        })
        .await
        .expect_err("second stop must fail");
    assert_eq!(second.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn foreign_jobs_are_reported_as_not_found() {
    if skip_unless_privileged() {
        return;
    }
    let server = TestServer::start(52704).await;
    let mut alice = connect(server.certs(), "alice", server.port).await;
    let mut bob = connect(server.certs(), "bob", server.port).await;

    let resp = alice
        .start(start_request("sleep", &["5"], WireLimits::default()))
        .await
        .expect("start")
        .into_inner();

    let stop = bob
        .stop(StopRequest {
            job_id: resp.job_id.clone(),
        })
        .await
        .expect_err("bob must not stop alice's job");
    assert_eq!(stop.code(), Code::NotFound);

    let status = bob
        .status(StatusRequest {
            job_id: resp.job_id.clone(),
        })
        .await
        .expect_err("bob must not see alice's job");
    assert_eq!(status.code(), Code::NotFound);

    alice
        .stop(StopRequest {
            job_id: resp.job_id,
        })
        .await
        .expect("alice stops her own job");
}

#[tokio::test]
async fn output_replays_the_full_log_after_exit() {
    if skip_unless_privileged() {
        return;
    }
    let server = TestServer::start(52705).await;
    let mut client = connect(server.certs(), "alice", server.port).await;

    let resp = client
        .start(start_request("echo", &["hello jobworker"], WireLimits::default()))
        .await
        .expect("start")
        .into_inner();

    wait_for_status(&mut client, &resp.job_id, protobuf::Status::Exited).await;

    let received = collect_output(&mut client, &resp.job_id).await;
    assert_eq!(String::from_utf8_lossy(&received), "hello jobworker\n");
}

#[tokio::test]
async fn concurrent_followers_receive_identical_byte_sequences() {
    if skip_unless_privileged() {
        return;
    }
    let server = TestServer::start(52706).await;
    let mut client = connect(server.certs(), "alice", server.port).await;

    // A slow producer so followers attach while output is still appearing.
    let resp = client
        .start(start_request(
            "sh",
            &["-c", "for i in $(seq 1 20); do echo line $i; sleep 0.05; done"],
            WireLimits::default(),
        ))
        .await
        .expect("start")
        .into_inner();
    let job_id = resp.job_id.clone();

    let mut followers = Vec::new();
    for delay_ms in [0u64, 200, 500] {
        let certs = server.certs().to_path_buf();
        let port = server.port;
        let job_id = job_id.clone();
        followers.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let mut client = connect(&certs, "alice", port).await;
            collect_output(&mut client, &job_id).await
        }));
    }

    let mut streams = Vec::new();
    for follower in followers {
        streams.push(follower.await.expect("join follower"));
    }

    wait_for_status(&mut client, &job_id, protobuf::Status::Exited).await;
    let log = std::fs::read(server.output_root().join(format!("{job_id}.log"))).expect("log");

    for stream in &streams {
        assert_eq!(stream, &log);
    }
}

#[tokio::test]
async fn clients_signed_by_an_unknown_ca_are_rejected_before_any_rpc() {
    if skip_unless_privileged() {
        return;
    }
    let server = TestServer::start(52707).await;

    // eve trusts the real server but presents a certificate from an
    // unrelated CA; the handshake (or the first use of the connection) fails.
    match try_connect(server.certs(), "eve", server.port).await {
        Err(_) => {}
        Ok(mut client) => {
            let result = client
                .start(start_request("ls", &[], WireLimits::default()))
                .await;
            assert!(result.is_err(), "unauthenticated client completed an RPC");
        }
    }
}

#[tokio::test]
async fn malformed_start_and_stop_arguments_are_rejected() {
    if skip_unless_privileged() {
        return;
    }
    let server = TestServer::start(52708).await;
    let mut client = connect(server.certs(), "alice", server.port).await;

    let missing_command = client
        .start(StartRequest {
            command: None,
            limits: Some(WireLimits::default()),
        })
        .await
        .expect_err("nil command");
    assert_eq!(missing_command.code(), Code::InvalidArgument);

    let empty_name = client
        .start(start_request("", &[], WireLimits::default()))
        .await
        .expect_err("empty command name");
    assert_eq!(empty_name.code(), Code::InvalidArgument);

    let missing_limits = client
        .start(StartRequest {
            command: Some(WireCommand {
                name: "ls".to_string(),
                args: Vec::new(),
            }),
            limits: None,
        })
        .await
        .expect_err("nil limits");
    assert_eq!(missing_limits.code(), Code::InvalidArgument);

    let empty_id = client
        .stop(StopRequest {
            job_id: String::new(),
        })
        .await
        .expect_err("empty job id");
    assert_eq!(empty_id.code(), Code::InvalidArgument);

    let unknown = client
        .stop(StopRequest {
            job_id: uuid::Uuid::new_v4().to_string(),
        })
        .await
        .expect_err("unknown job id");
    assert_eq!(unknown.code(), Code::NotFound);
}
