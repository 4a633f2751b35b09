use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use camino::Utf8PathBuf;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use assert_matches::assert_matches;

use cds_harvest::archive::{ArchiveClient, JobHandle, JobState};
use cds_harvest::config::{ConfigLoader, ResolvedCatalog, RetrySettings};
use cds_harvest::domain::{Combination, RequestSpec};
use cds_harvest::error::HarvestError;
use cds_harvest::extract::Extractor;
use cds_harvest::fetcher::Fetcher;
use cds_harvest::object_store::ObjectStoreClient;
use cds_harvest::pipeline::{CombinationStatus, Pipeline, ProgressEvent, ProgressSink, Stage};
use cds_harvest::retry::{RemoteFailure, RetryPolicy};
use cds_harvest::staging::StagingArea;
use cds_harvest::uploader::Uploader;

#[derive(Default)]
struct MockArchive {
    payload: Vec<u8>,
    transient_first_submit: bool,
    reject_sensor: Option<String>,
    pending_polls: usize,
    transient_downloads: usize,
    submits: Mutex<usize>,
    polls: Mutex<usize>,
    downloads: Mutex<Vec<PathBuf>>,
}

impl ArchiveClient for MockArchive {
    fn submit(&self, dataset: &str, request: &RequestSpec) -> Result<JobHandle, RemoteFailure> {
        let attempt = {
            let mut guard = self.submits.lock().unwrap();
            *guard += 1;
            *guard
        };
        if self.reject_sensor.as_deref() == Some(request.sensor.as_str()) {
            return Err(RemoteFailure::Terminal(HarvestError::ArchiveRejected(
                "product not available".to_string(),
            )));
        }
        if self.transient_first_submit && attempt == 1 {
            return Err(RemoteFailure::Transient("request queued".to_string()));
        }
        Ok(JobHandle {
            dataset: dataset.to_string(),
            id: format!("job-{}", request.sensor),
        })
    }

    fn status(&self, _job: &JobHandle) -> Result<JobState, RemoteFailure> {
        let mut polls = self.polls.lock().unwrap();
        *polls += 1;
        if *polls <= self.pending_polls {
            return Ok(JobState::Pending("running".to_string()));
        }
        Ok(JobState::Ready)
    }

    fn download(&self, _job: &JobHandle, destination: &Path) -> Result<u64, RemoteFailure> {
        let attempt = {
            let mut downloads = self.downloads.lock().unwrap();
            downloads.push(destination.to_path_buf());
            downloads.len()
        };
        if attempt <= self.transient_downloads {
            return Err(RemoteFailure::Transient("result still processing".to_string()));
        }
        std::fs::write(destination, &self.payload)
            .map_err(|err| RemoteFailure::Terminal(HarvestError::Filesystem(err.to_string())))?;
        Ok(self.payload.len() as u64)
    }
}

#[derive(Default)]
struct MockStore {
    uploads: Mutex<Vec<(String, u64)>>,
}

impl ObjectStoreClient for MockStore {
    fn upload(&self, local_path: &Path, _bucket: &str, key: &str) -> Result<(), HarvestError> {
        let size = std::fs::metadata(local_path)
            .map_err(|err| HarvestError::ObjectStore(err.to_string()))?
            .len();
        self.uploads.lock().unwrap().push((key.to_string(), size));
        Ok(())
    }
}

struct NullSink;

impl ProgressSink for NullSink {
    fn event(&self, _event: ProgressEvent) {}
}

fn immediate_retry() -> RetrySettings {
    RetrySettings {
        submit: RetryPolicy::immediate(3),
        poll: RetryPolicy::immediate(10),
        download: RetryPolicy::immediate(5),
    }
}

fn combination(sensor_name: &str, variable: &str, year: &str) -> Combination {
    Combination {
        sensor_name: sensor_name.to_string(),
        variable: variable.to_string(),
        year: year.to_string(),
    }
}

fn pipeline(temp: &tempfile::TempDir, archive: MockArchive) -> Pipeline<MockArchive, MockStore> {
    pipeline_for(ConfigLoader::builtin().unwrap(), temp, archive)
}

fn staging_area(temp: &tempfile::TempDir) -> StagingArea {
    StagingArea::new(Utf8PathBuf::from_path_buf(temp.path().join("staging")).unwrap())
}

fn pipeline_for(
    catalog: ResolvedCatalog,
    temp: &tempfile::TempDir,
    archive: MockArchive,
) -> Pipeline<MockArchive, MockStore> {
    let fetcher = Fetcher::new(archive, staging_area(temp), immediate_retry());
    let uploader = Uploader::new(MockStore::default(), "bucket", catalog.min_artifact_bytes);
    Pipeline::new(catalog, fetcher, uploader)
}

fn zip_payload(member: &str, size: usize) -> Vec<u8> {
    let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    writer
        .start_file(member, SimpleFileOptions::default())
        .unwrap();
    writer.write_all(&vec![42u8; size]).unwrap();
    writer.finish().unwrap().into_inner()
}

fn staging_is_empty(temp: &tempfile::TempDir) -> bool {
    std::fs::read_dir(temp.path().join("staging"))
        .map(|entries| entries.count() == 0)
        .unwrap_or(true)
}

#[test]
fn end_to_end_retries_then_uploads_and_cleans_up() {
    let temp = tempfile::tempdir().unwrap();
    let archive = MockArchive {
        payload: vec![1u8; 5000],
        transient_first_submit: true,
        ..MockArchive::default()
    };
    let pipeline = pipeline(&temp, archive);

    let report = pipeline.run(
        &[combination("IASI_Metop-A_NLIS", "co2", "2021")],
        1,
        &NullSink,
    );

    assert_eq!(report.uploaded, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(*pipeline.fetcher().client().submits.lock().unwrap(), 2);
    let uploads = pipeline.uploader().store().uploads.lock().unwrap();
    assert_eq!(
        *uploads,
        vec![("climate-data/iasi_metop_a_nlis/2021/data.zip".to_string(), 5000)]
    );
    let downloads = pipeline.fetcher().client().downloads.lock().unwrap();
    assert_eq!(downloads.len(), 1);
    assert!(!downloads[0].exists());
    assert!(staging_is_empty(&temp));
}

#[test]
fn end_to_end_with_extraction_still_cleans_up() {
    let temp = tempfile::tempdir().unwrap();
    let archive = MockArchive {
        payload: zip_payload("co2_iasi.nc", 5000),
        transient_first_submit: true,
        ..MockArchive::default()
    };
    let out = Utf8PathBuf::from_path_buf(temp.path().join("extracted")).unwrap();
    let pipeline = pipeline(&temp, archive).with_extractor(Extractor::new(out));

    let report = pipeline.run(
        &[combination("IASI_Metop-A_NLIS", "co2", "2021")],
        1,
        &NullSink,
    );

    let item = &report.items[0];
    assert_eq!(item.status, CombinationStatus::Uploaded);
    assert_eq!(item.key.as_deref(), Some("climate-data/iasi_metop_a_nlis/2021/data.zip"));
    assert_eq!(item.extract_error, None);
    assert_eq!(item.extracted.len(), 1);
    assert_eq!(
        item.extracted[0].path.file_name(),
        Some("iasi_metop_a_nlis_2021-01-01_2021-12-31.nc")
    );
    let downloads = pipeline.fetcher().client().downloads.lock().unwrap();
    assert!(!downloads[0].exists());
    assert!(staging_is_empty(&temp));
}

#[test]
fn extraction_failure_keeps_the_upload() {
    let temp = tempfile::tempdir().unwrap();
    let archive = MockArchive {
        payload: vec![3u8; 4096],
        ..MockArchive::default()
    };
    let out = Utf8PathBuf::from_path_buf(temp.path().join("extracted")).unwrap();
    let pipeline = pipeline(&temp, archive).with_extractor(Extractor::new(out));

    let report = pipeline.run(&[combination("MERGED_EMMA", "xco2", "2019")], 1, &NullSink);

    assert_eq!(report.uploaded, 1);
    assert_eq!(report.extract_failures, 1);
    assert!(report.items[0].extract_error.is_some());
    assert!(staging_is_empty(&temp));
}

#[test]
fn failing_combination_does_not_abort_batch() {
    let temp = tempfile::tempdir().unwrap();
    let archive = MockArchive {
        payload: vec![9u8; 2048],
        reject_sensor: Some("iasi_metop_b_nlis".to_string()),
        ..MockArchive::default()
    };
    let pipeline = pipeline(&temp, archive);
    let combinations = [
        combination("IASI_Metop-A_NLIS", "co2", "2021"),
        combination("IASI_Metop-B_NLIS", "co2", "2021"),
        combination("IASI_Metop-C_NLIS", "co2", "2021"),
    ];

    let report = pipeline.run(&combinations, 1, &NullSink);

    assert_eq!(report.failed, 1);
    assert_eq!(report.uploaded, 2);
    let failed: Vec<_> = report.failures().collect();
    assert_eq!(failed[0].sensor, "IASI_Metop-B_NLIS");
    assert_eq!(failed[0].failed_stage, Some(Stage::Fetch));
    assert_eq!(*pipeline.fetcher().client().submits.lock().unwrap(), 3);
    assert_eq!(pipeline.fetcher().client().downloads.lock().unwrap().len(), 2);

    let uploads = pipeline.uploader().store().uploads.lock().unwrap();
    let keys: Vec<&str> = uploads.iter().map(|(key, _)| key.as_str()).collect();
    assert_eq!(
        keys,
        vec![
            "climate-data/iasi_metop_a_nlis/2021/data.zip",
            "climate-data/iasi_metop_c_nlis/2021/data.zip",
        ]
    );
    assert!(staging_is_empty(&temp));
}

#[test]
fn worker_pool_keeps_enumeration_order() {
    let temp = tempfile::tempdir().unwrap();
    let archive = MockArchive {
        payload: vec![5u8; 2048],
        reject_sensor: Some("tanso_fts_ocfp".to_string()),
        ..MockArchive::default()
    };
    let pipeline = pipeline(&temp, archive);
    let combinations = [
        combination("MERGED_EMMA", "xco2", "2017"),
        combination("TANSO-FTS_OCFP", "xco2", "2017"),
        combination("MERGED_EMMA", "xco2", "2018"),
        combination("MERGED_OBS4MIPS", "xco2", "2003"),
    ];

    let report = pipeline.run(&combinations, 3, &NullSink);

    let order: Vec<(&str, &str)> = report
        .items
        .iter()
        .map(|item| (item.sensor.as_str(), item.year.as_str()))
        .collect();
    assert_eq!(
        order,
        vec![
            ("MERGED_EMMA", "2017"),
            ("TANSO-FTS_OCFP", "2017"),
            ("MERGED_EMMA", "2018"),
            ("MERGED_OBS4MIPS", "2003"),
        ]
    );
    assert_eq!(report.uploaded, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.items[1].status, CombinationStatus::Failed);
    assert_eq!(pipeline.uploader().store().uploads.lock().unwrap().len(), 3);
    assert!(staging_is_empty(&temp));
}

#[test]
fn small_artifact_is_skipped_without_upload() {
    let temp = tempfile::tempdir().unwrap();
    let archive = MockArchive {
        payload: vec![0u8; 512],
        ..MockArchive::default()
    };
    let pipeline = pipeline(&temp, archive);

    let report = pipeline.run(&[combination("TANSO2-FTS_SRFP", "xco2", "2019")], 1, &NullSink);

    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.items[0].bytes, Some(512));
    assert!(pipeline.uploader().store().uploads.lock().unwrap().is_empty());
    assert!(staging_is_empty(&temp));
}

#[test]
fn unknown_sensor_fails_at_build_stage() {
    let temp = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&temp, MockArchive::default());

    let report = pipeline.run(&[combination("OCO-2", "xco2", "2019")], 1, &NullSink);

    assert_eq!(report.failed, 1);
    assert_eq!(report.items[0].failed_stage, Some(Stage::Build));
    assert_eq!(*pipeline.fetcher().client().submits.lock().unwrap(), 0);
}

#[test]
fn waits_for_job_longer_than_submit_budget() {
    let temp = tempfile::tempdir().unwrap();
    let archive = MockArchive {
        payload: vec![1u8; 5000],
        pending_polls: 7,
        ..MockArchive::default()
    };
    let pipeline = pipeline(&temp, archive);

    let report = pipeline.run(&[combination("MERGED_EMMA", "xco2", "2020")], 1, &NullSink);

    assert_eq!(report.uploaded, 1);
    let client = pipeline.fetcher().client();
    assert_eq!(*client.polls.lock().unwrap(), 8);
    assert_eq!(*client.submits.lock().unwrap(), 1);
    assert_eq!(client.downloads.lock().unwrap().len(), 1);
}

#[test]
fn job_that_never_finishes_fails_the_fetch_stage() {
    let temp = tempfile::tempdir().unwrap();
    let archive = MockArchive {
        payload: vec![1u8; 5000],
        pending_polls: usize::MAX,
        ..MockArchive::default()
    };
    let pipeline = pipeline(&temp, archive);

    let report = pipeline.run(&[combination("MERGED_EMMA", "xco2", "2020")], 1, &NullSink);

    assert_eq!(report.failed, 1);
    assert_eq!(report.items[0].failed_stage, Some(Stage::Fetch));
    assert_eq!(*pipeline.fetcher().client().polls.lock().unwrap(), 10);
    assert!(pipeline.fetcher().client().downloads.lock().unwrap().is_empty());
    assert!(staging_is_empty(&temp));
}

#[test]
fn fetcher_retries_transient_downloads() {
    let temp = tempfile::tempdir().unwrap();
    let archive = MockArchive {
        payload: vec![2u8; 3000],
        transient_downloads: 2,
        ..MockArchive::default()
    };
    let fetcher = Fetcher::new(archive, staging_area(&temp), immediate_retry());
    let catalog = ConfigLoader::builtin().unwrap();
    let request = catalog
        .sensor("tanso_fts_ocfp")
        .unwrap()
        .request_for("xco2", "2018");

    let artifact = fetcher.fetch(&request).unwrap();

    assert_eq!(artifact.size().unwrap(), 3000);
    let downloads = fetcher.client().downloads.lock().unwrap();
    assert_eq!(downloads.len(), 3);
    assert!(downloads.iter().all(|path| path == artifact.path()));
}

#[test]
fn exhausted_download_retries_remove_staged_file() {
    let temp = tempfile::tempdir().unwrap();
    let archive = MockArchive {
        payload: vec![2u8; 3000],
        transient_downloads: usize::MAX,
        ..MockArchive::default()
    };
    let fetcher = Fetcher::new(archive, staging_area(&temp), immediate_retry());
    let catalog = ConfigLoader::builtin().unwrap();
    let request = catalog
        .sensor("tanso_fts_ocfp")
        .unwrap()
        .request_for("xco2", "2018");

    assert_matches!(
        fetcher.fetch(&request),
        Err(HarvestError::RetryExhausted { attempts: 5, operation, .. })
            if operation.starts_with("download")
    );
    let downloads = fetcher.client().downloads.lock().unwrap();
    assert_eq!(downloads.len(), 5);
    assert!(!downloads[0].exists());
    assert!(staging_is_empty(&temp));
}

#[test]
fn download_exhaustion_is_reported_at_fetch_stage() {
    let temp = tempfile::tempdir().unwrap();
    let archive = MockArchive {
        payload: vec![2u8; 3000],
        transient_downloads: usize::MAX,
        ..MockArchive::default()
    };
    let pipeline = pipeline(&temp, archive);

    let report = pipeline.run(&[combination("TANSO-FTS_OCFP", "xco2", "2018")], 1, &NullSink);

    assert_eq!(report.failed, 1);
    assert_eq!(report.items[0].failed_stage, Some(Stage::Fetch));
    assert!(report.items[0].error.as_deref().unwrap_or("").contains("5 attempts"));
    assert!(pipeline.uploader().store().uploads.lock().unwrap().is_empty());
    assert!(staging_is_empty(&temp));
}

#[test]
fn variables_of_one_sensor_extract_to_distinct_files() {
    let temp = tempfile::tempdir().unwrap();
    let catalog =
        ConfigLoader::resolve_str(include_str!("../catalog/crop_productivity.json")).unwrap();
    let archive = MockArchive {
        payload: zip_payload("c3s-agroproductivity.nc", 4000),
        ..MockArchive::default()
    };
    let out = Utf8PathBuf::from_path_buf(temp.path().join("extracted")).unwrap();
    let pipeline =
        pipeline_for(catalog, &temp, archive).with_extractor(Extractor::new(out.clone()));
    let combinations = [
        combination("maize", "total_above_ground_production", "2021"),
        combination("maize", "crop_development_stage", "2021"),
    ];

    let report = pipeline.run(&combinations, 2, &NullSink);

    assert_eq!(report.uploaded, 2);
    let names: Vec<&str> = report
        .items
        .iter()
        .flat_map(|item| item.extracted.iter())
        .filter_map(|member| member.path.file_name())
        .collect();
    assert_eq!(
        names,
        vec![
            "maize-total_above_ground_production_2021-01-10_2021-12-31.nc",
            "maize-crop_development_stage_2021-01-10_2021-12-31.nc",
        ]
    );
    assert_eq!(std::fs::read_dir(out.as_std_path()).unwrap().count(), 2);
}
