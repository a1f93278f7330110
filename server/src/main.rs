mod interceptors;
mod services;
mod tls;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use joblib::{CgroupService, Config, JobService};
use protobuf::job_worker_server::JobWorkerServer;
use services::jobworker::JobWorkerService;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// jobworker serves a gRPC API that starts, stops, inspects, and streams
/// arbitrary commands, each confined to its own cgroup.
#[derive(Debug, Parser)]
#[command(name = "jobworker")]
struct Cli {
    /// Path to the server certificate (PEM).
    #[arg(long)]
    cert: Option<PathBuf>,
    /// Path to the server private key (PEM).
    #[arg(long)]
    key: Option<PathBuf>,
    /// Path to the CA certificate clients are verified against (PEM).
    #[arg(long)]
    ca_cert: Option<PathBuf>,
    /// Port to serve the jobworker API on.
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Directory for per-job output logs.
    #[arg(long, default_value = "/var/log/jobworker")]
    output_root: PathBuf,
    /// Mount point for the cgroup2 filesystem.
    #[arg(long, default_value = "/cgroup2")]
    cgroup_root: PathBuf,

    #[command(subcommand)]
    command: Sub,
}

#[derive(Debug, Subcommand)]
enum Sub {
    /// Run the supervisor.
    Serve,
    /// Staging process that places a job into its cgroup before the target
    /// command runs. Internal; spawned by serve.
    Reexec,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Arc::new(Config {
        output_root: cli.output_root.clone(),
        cgroup_mount_root: cli.cgroup_root.clone(),
        ..Config::default()
    });

    match &cli.command {
        // Child side of the launch protocol; exits with the target's code.
        Sub::Reexec => std::process::exit(joblib::reexec::run(&config)),
        Sub::Serve => serve(cli, config).await,
    }
}

async fn serve(cli: Cli, config: Arc<Config>) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (Some(cert), Some(key), Some(ca_cert)) = (&cli.cert, &cli.key, &cli.ca_cert) else {
        return Err("serve requires --cert, --key, and --ca-cert".into());
    };

    let _ = rustls::crypto::ring::default_provider().install_default();

    let cgroups = CgroupService::new(&config);
    cgroups.setup()?;
    let jobs = JobService::new(Arc::clone(&config), cgroups.clone())?;

    let tls_config = tls::server_config(cert, key, ca_cert)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let addr: SocketAddr = format!("0.0.0.0:{}", cli.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "jobworker listening");

    let shutdown = shutdown_token();
    let service = JobWorkerService::new(Arc::clone(&jobs), config.stream_chunk_size);
    let server = JobWorkerServer::with_interceptor(service, interceptors::cert::extract_identity);

    let result = Server::builder()
        .add_service(server)
        .serve_with_incoming_shutdown(tls::incoming(listener, acceptor), {
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .await;

    info!("shutting down");
    jobs.close().await;
    cgroups.cleanup();

    result.map_err(Into::into)
}

/// A token cancelled on SIGTERM or SIGINT. Every subsystem drains from it.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let handler = token.clone();

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
        handler.cancel();
    });

    token
}
