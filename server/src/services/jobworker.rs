//! The RPC façade: validation, identity, owner-scoped authorization, status
//! projection, and the bridge from job output channels to response streams.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use joblib::{Command, Error as JobError, Job, JobService, Limits, Status as JobStatus};
use protobuf::job_worker_server::JobWorker;
use protobuf::{
    OutputRequest, OutputResponse, StartRequest, StartResponse, StatusDetail, StatusRequest,
    StatusResponse, StopRequest, StopResponse,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{error, warn};
use uuid::Uuid;

use crate::interceptors::cert::Identity;

/// Output chunks buffered between a job's log reader and the outbound RPC
/// stream. A slower client fills the buffer and blocks the reader, never the
/// job.
const OUTPUT_BUFFER_CHUNKS: usize = 16;

pub struct JobWorkerService {
    jobs: Arc<JobService>,
    chunk_size: usize,
}

impl JobWorkerService {
    pub fn new(jobs: Arc<JobService>, chunk_size: usize) -> Self {
        Self { jobs, chunk_size }
    }

    fn identity<T>(req: &Request<T>) -> Result<String, Status> {
        req.extensions()
            .get::<Identity>()
            .map(|identity| identity.user.clone())
            .ok_or_else(|| Status::unauthenticated("caller identity missing"))
    }

    fn parse_job_id(raw: &str) -> Result<Uuid, Status> {
        if raw.is_empty() {
            return Err(Status::invalid_argument("empty job ID"));
        }
        Uuid::parse_str(raw).map_err(|_| Status::invalid_argument("job ID is not a UUID"))
    }

    /// Loads a job on behalf of `user`. A job owned by someone else is
    /// reported as NotFound, identically to a job that does not exist, so
    /// other owners' ID space stays unobservable.
    fn owned_job(&self, user: &str, raw_id: &str) -> Result<Arc<Job>, Status> {
        let id = Self::parse_job_id(raw_id)?;
        let job = self
            .jobs
            .fetch_job(id)
            .map_err(|_| not_found(id))?;
        if job.owner != user {
            return Err(not_found(id));
        }
        Ok(job)
    }
}

#[tonic::async_trait]
impl JobWorker for JobWorkerService {
    type OutputStream = Pin<Box<dyn Stream<Item = Result<OutputResponse, Status>> + Send>>;

    async fn start(&self, req: Request<StartRequest>) -> Result<Response<StartResponse>, Status> {
        let user = Self::identity(&req)?;
        let StartRequest { command, limits } = req.into_inner();

        let Some(command) = command else {
            return Err(Status::invalid_argument("command empty"));
        };
        if command.name.is_empty() {
            return Err(Status::invalid_argument("command name empty"));
        }
        let Some(limits) = limits else {
            return Err(Status::invalid_argument("limits empty"));
        };

        let job = self
            .jobs
            .new_job(
                user,
                Command {
                    name: command.name.clone(),
                    args: command.args.clone(),
                },
            )
            .map_err(|err| {
                error!(error = %err, "building job");
                Status::internal("build job")
            })?;

        // The caller sees the at-creation snapshot; Status reports progress
        // from there.
        let status = Some(status_detail(&job));

        self.jobs
            .start_job(Arc::clone(&job), to_limits(&limits))
            .await
            .map_err(|err| {
                error!(job = %job.id, error = %err, "starting job");
                Status::internal("start job")
            })?;

        Ok(Response::new(StartResponse {
            job_id: job.id.to_string(),
            command: Some(command),
            status,
            limits: Some(limits),
        }))
    }

    async fn stop(&self, req: Request<StopRequest>) -> Result<Response<StopResponse>, Status> {
        let user = Self::identity(&req)?;
        let raw_id = req.into_inner().job_id;
        let job = self.owned_job(&user, &raw_id)?;

        self.jobs.stop_job(job.id).map_err(|err| match err {
            JobError::NotRunning(_) => Status::failed_precondition("job is not running"),
            JobError::NotFound(id) => not_found(id),
            err => {
                error!(job = %job.id, error = %err, "stopping job");
                Status::internal("stop job")
            }
        })?;

        Ok(Response::new(StopResponse {}))
    }

    async fn status(
        &self,
        req: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let user = Self::identity(&req)?;
        let raw_id = req.into_inner().job_id;
        let job = self.owned_job(&user, &raw_id)?;

        Ok(Response::new(StatusResponse {
            status: Some(status_detail(&job)),
        }))
    }

    async fn output(
        &self,
        req: Request<OutputRequest>,
    ) -> Result<Response<Self::OutputStream>, Status> {
        let user = Self::identity(&req)?;
        let raw_id = req.into_inner().job_id;
        let job = self.owned_job(&user, &raw_id)?;

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER_CHUNKS);
        let token = CancellationToken::new();
        let reader_token = token.clone();
        let chunk_size = self.chunk_size;
        tokio::spawn(async move {
            let job_id = job.id;
            match job.stream_output(reader_token, tx, chunk_size).await {
                Ok(()) | Err(JobError::StreamCancelled) => {}
                Err(err) => warn!(job = %job_id, error = %err, "streaming job output"),
            }
        });

        // Tie the reader's cancellation to the response stream so a client
        // that goes away tears the whole bridge down.
        let guard = token.drop_guard();
        let stream = ReceiverStream::new(rx).map(move |chunk: bytes::Bytes| {
            let _live = &guard;
            Ok(OutputResponse {
                output: chunk.to_vec(),
            })
        });

        Ok(Response::new(Box::pin(stream) as Self::OutputStream))
    }
}

fn not_found(id: Uuid) -> Status {
    Status::not_found(format!("no such job: {id}"))
}

fn status_detail(job: &Job) -> StatusDetail {
    StatusDetail {
        status: to_proto_status(job.status()) as i32,
        exit_code: job.exit_code(),
    }
}

fn to_proto_status(status: JobStatus) -> protobuf::Status {
    match status {
        JobStatus::Pending => protobuf::Status::Pending,
        JobStatus::Running => protobuf::Status::Running,
        JobStatus::Stopped => protobuf::Status::Stopped,
        JobStatus::Exited => protobuf::Status::Exited,
    }
}

/// Wire limits use zero for "not set"; internally that is an absent field.
fn to_limits(limits: &protobuf::Limits) -> Limits {
    Limits {
        memory_bytes: (limits.memory > 0).then_some(limits.memory),
        cpus: (limits.cpus > 0.0).then_some(limits.cpus),
        disk_read_bps: (limits.disk_read_bps > 0).then_some(limits.disk_read_bps),
        disk_write_bps: (limits.disk_write_bps > 0).then_some(limits.disk_write_bps),
    }
}
