use std::time::Instant;

use tracing::info;

use crate::archive::{ArchiveClient, JobState};
use crate::config::RetrySettings;
use crate::domain::RequestSpec;
use crate::error::HarvestError;
use crate::retry::{RemoteFailure, RetryPolicy};
use crate::staging::{StagedArtifact, StagingArea};

pub struct Fetcher<A: ArchiveClient> {
    client: A,
    staging: StagingArea,
    submit_policy: RetryPolicy,
    poll_policy: RetryPolicy,
    download_policy: RetryPolicy,
}

impl<A: ArchiveClient> Fetcher<A> {
    pub fn new(client: A, staging: StagingArea, retry: RetrySettings) -> Self {
        Self {
            client,
            staging,
            submit_policy: retry.submit,
            poll_policy: retry.poll,
            download_policy: retry.download,
        }
    }

    pub fn client(&self) -> &A {
        &self.client
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Submits `spec`, waits for the job and downloads its result into a fresh
    /// staged artifact.
    ///
    /// The artifact is acquired before submission, so every failure path below
    /// drops (and deletes) it.
    pub fn fetch(&self, spec: &RequestSpec) -> Result<StagedArtifact, HarvestError> {
        spec.validate()?;
        let year = spec.year.as_single().unwrap_or("multi");
        let label = format!("{}-{}-{year}", spec.sensor, spec.variable);
        let artifact = self.staging.acquire(&label, spec.format.extension())?;

        let start = Instant::now();
        let job = self
            .submit_policy
            .run(&format!("submit {label}"), |_| {
                self.client.submit(&spec.dataset, spec)
            })?;
        self.poll_policy
            .run(&format!("wait {label} job {}", job.id), |_| {
                match self.client.status(&job)? {
                    JobState::Ready => Ok(()),
                    JobState::Pending(status) => Err(RemoteFailure::Transient(format!(
                        "job {} {status}",
                        job.id
                    ))),
                }
            })?;
        let bytes = self
            .download_policy
            .run(&format!("download {label} job {}", job.id), |_| {
                self.client.download(&job, artifact.path())
            })?;

        info!(
            sensor = %spec.sensor,
            year,
            job = %job.id,
            bytes,
            latency_ms = start.elapsed().as_millis() as u64,
            "archive result staged"
        );
        Ok(artifact)
    }
}
