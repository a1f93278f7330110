use std::io::Write;
use std::path::Path;

use protobuf::job_worker_client::JobWorkerClient;
use protobuf::{
    Command, Limits, OutputRequest, OutputResponse, StartRequest, StatusRequest, StopRequest,
};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tonic::Status;

type JobId = uuid::Uuid;

pub struct ClientCli {
    inner: JobWorkerClient<Channel>,
}

impl ClientCli {
    pub async fn connect(
        server_addr: &str,
        cert: &Path,
        key: &Path,
        ca_cert: &Path,
        domain: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let ca = tokio::fs::read(ca_cert).await?;
        let client_cert = tokio::fs::read(cert).await?;
        let client_key = tokio::fs::read(key).await?;

        let tls = ClientTlsConfig::new()
            .domain_name(domain)
            .ca_certificate(Certificate::from_pem(ca))
            .identity(Identity::from_pem(client_cert, client_key));

        let channel = Channel::from_shared(format!("https://{server_addr}"))?
            .tls_config(tls)?
            .connect()
            .await?;

        Ok(Self {
            inner: JobWorkerClient::new(channel),
        })
    }

    pub async fn start_job(
        &mut self,
        name: &str,
        args: &[String],
        limits: Limits,
    ) -> Result<(), Status> {
        let request = StartRequest {
            command: Some(Command {
                name: name.to_string(),
                args: args.to_vec(),
            }),
            limits: Some(limits),
        };
        let response = self.inner.start(request).await?.into_inner();
        println!("Started job id: {}", response.job_id);
        Ok(())
    }

    pub async fn stop_job(&mut self, job_id: JobId) -> Result<(), Status> {
        self.inner
            .stop(StopRequest {
                job_id: job_id.to_string(),
            })
            .await?;
        println!("Stopped job id: {job_id}");
        Ok(())
    }

    pub async fn query_status(&mut self, job_id: JobId) -> Result<(), Status> {
        let response = self
            .inner
            .status(StatusRequest {
                job_id: job_id.to_string(),
            })
            .await?
            .into_inner();

        let Some(detail) = response.status else {
            println!("Unknown");
            return Ok(());
        };
        match detail.status() {
            protobuf::Status::Pending => println!("Pending"),
            protobuf::Status::Running => println!("Running"),
            protobuf::Status::Stopped => println!("Stopped"),
            protobuf::Status::Exited => println!("Exited with code: {}", detail.exit_code),
            protobuf::Status::Unspecified => println!("Unknown"),
        }
        Ok(())
    }

    /// Streams the job's combined output to stdout until end-of-log.
    pub async fn stream_output(&mut self, job_id: JobId) -> Result<(), Status> {
        let mut stream = self
            .inner
            .output(OutputRequest {
                job_id: job_id.to_string(),
            })
            .await?
            .into_inner();

        let mut stdout = std::io::stdout();
        while let Some(OutputResponse { output }) = stream.message().await? {
            if let Err(err) = stdout.write_all(&output) {
                if err.kind() == std::io::ErrorKind::BrokenPipe {
                    break;
                }
                let _ = writeln!(std::io::stderr(), "{err}");
            }
        }
        Ok(())
    }
}
