//! The job registry and the orchestration of a job's lifecycle against the
//! cgroup service.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cgroup::{CgroupService, Limits};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::job::{Job, JobId, Status};
use crate::output;
use crate::reexec::Command;

/// How long `close` waits for a cancelled job's waiter to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Registry {
    healthy: bool,
    jobs: HashMap<JobId, Arc<Job>>,
}

/// Starts, stops, and tracks jobs. Entries are insert-only until [`close`];
/// finished jobs stay queryable for post-mortem status and output.
///
/// [`close`]: JobService::close
pub struct JobService {
    config: Arc<Config>,
    cgroups: CgroupService,
    registry: RwLock<Registry>,
}

impl JobService {
    /// Creates the service and its output root. The cgroup service is
    /// expected to be set up already.
    pub fn new(config: Arc<Config>, cgroups: CgroupService) -> Result<Arc<Self>> {
        output::create_root(&config)?;
        Ok(Arc::new(Self {
            config,
            cgroups,
            registry: RwLock::new(Registry {
                healthy: true,
                jobs: HashMap::new(),
            }),
        }))
    }

    /// Builds a Pending job owned by `owner`. The job is not registered or
    /// started yet.
    pub fn new_job(&self, owner: impl Into<String>, command: Command) -> Result<Arc<Job>> {
        Job::new(Arc::clone(&self.config), owner, command)
    }

    /// Registers and launches a job: leaf cgroup, re-exec child, process
    /// placement, continue signal, waiter. A failure after registration
    /// cancels the job; the registry entry stays behind for the waiter.
    pub async fn start_job(&self, job: Arc<Job>, limits: Limits) -> Result<()> {
        {
            let mut registry = self.registry.write().unwrap();
            if !registry.healthy {
                return Err(Error::ServiceClosing);
            }
            if registry.jobs.contains_key(&job.id) {
                return Err(Error::AlreadyStarted(job.id));
            }
            registry.jobs.insert(job.id, Arc::clone(&job));
        }

        if let Err(err) = self.launch(&job, limits) {
            warn!(job = %job.id, error = %err, "start failed; cancelling job");
            job.stop();
            job.cleanup();
            return Err(err);
        }
        Ok(())
    }

    fn launch(&self, job: &Arc<Job>, limits: Limits) -> Result<()> {
        let cgroup = self.cgroups.create_cgroup(limits)?;
        let cgroup_id = cgroup.id;

        if let Err(err) = job.start() {
            self.remove_cgroup_logged(cgroup_id);
            return Err(err);
        }

        // The waiter owns the child from here: it reaps it, records the final
        // state, and removes the cgroup, even if placement below fails and
        // the job is cancelled.
        {
            let cgroups = self.cgroups.clone();
            let job = Arc::clone(job);
            tokio::spawn(supervise(job, cgroups, cgroup_id));
        }

        let pid = job.pid().ok_or_else(|| {
            Error::io(
                "place job",
                std::io::Error::new(std::io::ErrorKind::Other, "job has no pid"),
            )
        })?;
        self.cgroups.place(&cgroup, pid)?;

        // Only now may the target run: it is inside its cgroup.
        job.signal_continue();
        job.set_running();
        Ok(())
    }

    /// Cancels a running job. The waiter drives the state to Stopped.
    pub fn stop_job(&self, id: JobId) -> Result<()> {
        let job = self.fetch_job(id)?;
        if job.status() != Status::Running {
            return Err(Error::NotRunning(id));
        }
        info!(job = %id, "stopping job");
        job.stop();
        Ok(())
    }

    pub fn fetch_job(&self, id: JobId) -> Result<Arc<Job>> {
        self.registry
            .read()
            .unwrap()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    /// Flips the service unhealthy, cancels every job, waits for the waiters
    /// to drain, and removes the output root. Cgroup teardown belongs to the
    /// caller's [`CgroupService::cleanup`], run after this.
    pub async fn close(&self) {
        let jobs: Vec<Arc<Job>> = {
            let mut registry = self.registry.write().unwrap();
            if !registry.healthy {
                return;
            }
            registry.healthy = false;
            registry.jobs.values().cloned().collect()
        };

        info!(jobs = jobs.len(), "closing job service");
        for job in &jobs {
            job.stop();
        }
        for job in &jobs {
            if tokio::time::timeout(SHUTDOWN_GRACE, job.finished())
                .await
                .is_err()
            {
                warn!(job = %job.id, "job did not finish within the shutdown grace period");
            }
        }

        output::remove_root(&self.config);
    }

    fn remove_cgroup_logged(&self, id: Uuid) {
        if let Err(err) = self.cgroups.remove_cgroup(id) {
            error!(cgroup = %id, error = %err, "removing job cgroup");
        }
    }
}

/// The waiter: blocks until the re-exec child goes away (on its own or via
/// cancellation), records the outcome, releases the job's resources, and
/// removes its cgroup.
async fn supervise(job: Arc<Job>, cgroups: CgroupService, cgroup_id: Uuid) {
    let Some(mut child) = job.take_child() else {
        job.cleanup();
        return;
    };
    let cancelled = job.cancel_token();

    tokio::select! {
        _ = cancelled.cancelled() => {
            job.kill_group();
            match child.wait().await {
                Ok(exit) => job.record_exit(exit),
                Err(err) => error!(job = %job.id, error = %err, "waiting for killed child"),
            }
        }
        exit = child.wait() => {
            match exit {
                Ok(exit) => job.record_exit(exit),
                Err(err) => error!(job = %job.id, error = %err, "waiting for child"),
            }
        }
    }

    job.cleanup();
    if let Err(err) = cgroups.remove_cgroup(cgroup_id) {
        error!(cgroup = %cgroup_id, error = %err, "removing job cgroup");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_service() -> (tempfile::TempDir, Arc<JobService>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(Config::under(dir.path()));
        let cgroups = CgroupService::new(&config);
        let service = JobService::new(config, cgroups).expect("service");
        (dir, service)
    }

    fn command(name: &str) -> Command {
        Command {
            name: name.to_string(),
            args: Vec::new(),
        }
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (_dir, service) = test_service();
        let id = Uuid::new_v4();

        assert!(matches!(service.fetch_job(id), Err(Error::NotFound(found)) if found == id));
        assert!(matches!(service.stop_job(id), Err(Error::NotFound(found)) if found == id));
    }

    #[tokio::test]
    async fn stop_of_a_pending_job_is_a_precondition_failure() {
        let (_dir, service) = test_service();
        let job = service.new_job("alice", command("ls")).expect("new job");

        // Register without launching, as a start that failed early would.
        service
            .registry
            .write()
            .unwrap()
            .jobs
            .insert(job.id, Arc::clone(&job));

        assert!(matches!(
            service.stop_job(job.id),
            Err(Error::NotRunning(id)) if id == job.id
        ));
    }

    #[tokio::test]
    async fn close_rejects_later_starts_and_removes_the_output_root() {
        let (_dir, service) = test_service();
        let output_root = service.config.output_root.clone();
        assert!(output_root.is_dir());

        let job = service.new_job("alice", command("ls")).expect("new job");

        service.close().await;
        assert!(!output_root.exists());

        assert!(matches!(
            service.start_job(job, Limits::default()).await,
            Err(Error::ServiceClosing)
        ));
    }

    #[tokio::test]
    async fn close_twice_is_idempotent() {
        let (_dir, service) = test_service();
        service.close().await;
        service.close().await;
    }
}
