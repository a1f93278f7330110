mod client_cli;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use client_cli::ClientCli;
use uuid::Uuid;

/// Talk to a jobworker server.
#[derive(Debug, Parser)]
#[command(name = "jobctl")]
struct Cli {
    /// The address of the server, host:port.
    #[arg(short = 's', long)]
    server: String,
    /// Client certificate (PEM).
    #[arg(long)]
    cert: PathBuf,
    /// Client private key (PEM).
    #[arg(long)]
    key: PathBuf,
    /// CA certificate the server is verified against (PEM).
    #[arg(long)]
    ca_cert: PathBuf,
    /// Server name expected on the server's certificate.
    #[arg(long, default_value = "localhost")]
    domain: String,
    /// The sub-command to issue.
    #[command(subcommand)]
    sub_command: SubCommand,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Start a command on the server.
    Start {
        /// Program to run.
        name: String,

        /// memory.high ceiling in bytes (0 = unlimited).
        #[arg(long, default_value_t = 0)]
        memory: u64,

        /// cpu.max share in cores, e.g. 1.5 (0 = unlimited).
        #[arg(long, default_value_t = 0.0)]
        cpus: f32,

        /// io.max read bandwidth in bytes per second (0 = unlimited).
        #[arg(long, default_value_t = 0)]
        disk_read_bps: u64,

        /// io.max write bandwidth in bytes per second (0 = unlimited).
        #[arg(long, default_value_t = 0)]
        disk_write_bps: u64,

        /// Arguments passed to the program.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Stop a running job.
    Stop { job_id: Uuid },
    /// Report a job's status and exit code.
    Status { job_id: Uuid },
    /// Stream a job's combined stdout/stderr from the beginning.
    Output { job_id: Uuid },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut client = ClientCli::connect(
        &cli.server,
        &cli.cert,
        &cli.key,
        &cli.ca_cert,
        &cli.domain,
    )
    .await?;

    match cli.sub_command {
        SubCommand::Start {
            name,
            args,
            memory,
            cpus,
            disk_read_bps,
            disk_write_bps,
        } => {
            client
                .start_job(
                    &name,
                    &args,
                    protobuf::Limits {
                        memory,
                        cpus,
                        disk_read_bps,
                        disk_write_bps,
                    },
                )
                .await?
        }
        SubCommand::Stop { job_id } => client.stop_job(job_id).await?,
        SubCommand::Status { job_id } => client.query_status(job_id).await?,
        SubCommand::Output { job_id } => client.stream_output(job_id).await?,
    }

    Ok(())
}
