use std::fs::File;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::domain::RequestSpec;
use crate::error::HarvestError;
use crate::retry::{RemoteFailure, classify_message};

/// Server-side extraction job created by [`ArchiveClient::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub dataset: String,
    pub id: String,
}

/// Progress of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Queued or running; carries the archive's status word.
    Pending(String),
    Ready,
}

/// Remote climate-data archive with a submit / poll / download job model.
pub trait ArchiveClient: Send + Sync {
    fn submit(&self, dataset: &str, request: &RequestSpec) -> Result<JobHandle, RemoteFailure>;

    /// One status check. A failed or dismissed job is a terminal error.
    fn status(&self, job: &JobHandle) -> Result<JobState, RemoteFailure>;

    /// Writes the result of a completed job to `destination`.
    fn download(&self, job: &JobHandle, destination: &Path) -> Result<u64, RemoteFailure>;
}

#[derive(Clone)]
pub struct CdsHttpClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    #[serde(rename = "jobID")]
    job_id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct JobResults {
    asset: Asset,
}

#[derive(Debug, Deserialize)]
struct Asset {
    value: AssetValue,
}

#[derive(Debug, Deserialize)]
struct AssetValue {
    href: String,
}

impl CdsHttpClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("cds-harvest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::ArchiveHttp(err.to_string()))?,
        );
        let mut token = HeaderValue::from_str(api_key.trim()).map_err(|_| {
            HarvestError::MissingCredentials("archive API key is not valid header text".to_string())
        })?;
        token.set_sensitive(true);
        headers.insert("PRIVATE-TOKEN", token);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| HarvestError::ArchiveHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn process_url(&self, dataset: &str) -> String {
        format!("{}/retrieve/v1/processes/{dataset}/execute", self.base_url)
    }

    fn job_url(&self, job: &JobHandle) -> String {
        format!("{}/retrieve/v1/jobs/{}", self.base_url, job.id)
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, RemoteFailure> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response
            .text()
            .unwrap_or_else(|_| "archive request failed".to_string());
        let message = error_message(&body);
        match classify_message(&message) {
            RemoteFailure::Transient(reason) => Err(RemoteFailure::Transient(reason)),
            RemoteFailure::Terminal(_) => {
                Err(RemoteFailure::Terminal(HarvestError::ArchiveStatus { status, message }))
            }
        }
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, RemoteFailure> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| HarvestError::ArchiveHttp(err.to_string()))?;
        let response = Self::handle_status(response)?;
        let value = response
            .json()
            .map_err(|err| HarvestError::ArchiveHttp(err.to_string()))?;
        Ok(value)
    }
}

impl ArchiveClient for CdsHttpClient {
    fn submit(&self, dataset: &str, request: &RequestSpec) -> Result<JobHandle, RemoteFailure> {
        let url = self.process_url(dataset);
        let body = json!({ "inputs": request.to_inputs() });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|err| HarvestError::ArchiveHttp(err.to_string()))?;
        let response = Self::handle_status(response)?;
        let status: JobStatus = response
            .json()
            .map_err(|err| HarvestError::ArchiveHttp(err.to_string()))?;
        debug!(dataset, job = %status.job_id, status = %status.status, "archive job submitted");
        Ok(JobHandle {
            dataset: dataset.to_string(),
            id: status.job_id,
        })
    }

    fn status(&self, job: &JobHandle) -> Result<JobState, RemoteFailure> {
        let status: JobStatus = self.get_json(&self.job_url(job))?;
        match job_state(&status.status) {
            Some(state) => Ok(state),
            None => {
                let detail = self
                    .client
                    .get(format!("{}/results", self.job_url(job)))
                    .send()
                    .and_then(|response| response.text())
                    .map(|body| error_message(&body))
                    .unwrap_or_default();
                Err(RemoteFailure::Terminal(HarvestError::ArchiveRejected(
                    format!("job {} {}: {detail}", job.id, status.status),
                )))
            }
        }
    }

    fn download(&self, job: &JobHandle, destination: &Path) -> Result<u64, RemoteFailure> {
        let results: JobResults = self.get_json(&format!("{}/results", self.job_url(job)))?;
        let response = self
            .client
            .get(&results.asset.value.href)
            .send()
            .map_err(|err| HarvestError::ArchiveHttp(err.to_string()))?;
        let mut response = Self::handle_status(response)?;
        let mut file =
            File::create(destination).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let written = std::io::copy(&mut response, &mut file)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        debug!(job = %job.id, bytes = written, "archive result downloaded");
        Ok(written)
    }
}

/// `None` for statuses that end the job without a result.
fn job_state(status: &str) -> Option<JobState> {
    match status {
        "successful" => Some(JobState::Ready),
        "accepted" | "running" => Some(JobState::Pending(status.to_string())),
        _ => None,
    }
}

/// Pulls a human readable message out of an archive error body.
fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.trim().to_string();
    };
    let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);
    match (field("title"), field("detail")) {
        (Some(title), Some(detail)) => format!("{title}: {detail}"),
        (Some(title), None) => title,
        (None, Some(detail)) => detail,
        (None, None) => body.trim().to_string(),
    }
}
