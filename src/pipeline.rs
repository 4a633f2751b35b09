use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info};

use crate::archive::ArchiveClient;
use crate::config::{ResolvedCatalog, category_for};
use crate::domain::{Combination, DateRange, RequestSpec};
use crate::error::HarvestError;
use crate::extract::{ExtractedMember, Extractor};
use crate::fetcher::Fetcher;
use crate::keys::StorageKey;
use crate::object_store::ObjectStoreClient;
use crate::uploader::{UploadOutcome, Uploader};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Build,
    Fetch,
    Upload,
    Extract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CombinationStatus {
    Uploaded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CombinationReport {
    pub sensor: String,
    pub variable: String,
    pub year: String,
    pub status: CombinationStatus,
    pub key: Option<String>,
    pub bytes: Option<u64>,
    pub failed_stage: Option<Stage>,
    pub error: Option<String>,
    pub extract_error: Option<String>,
    pub extracted: Vec<ExtractedMember>,
    pub elapsed_ms: u64,
}

impl CombinationReport {
    fn new(combination: &Combination) -> Self {
        Self {
            sensor: combination.sensor_name.clone(),
            variable: combination.variable.clone(),
            year: combination.year.clone(),
            status: CombinationStatus::Failed,
            key: None,
            bytes: None,
            failed_stage: None,
            error: None,
            extract_error: None,
            extracted: Vec::new(),
            elapsed_ms: 0,
        }
    }

    fn fail(mut self, stage: Stage, err: &HarvestError) -> Self {
        error!(
            sensor = %self.sensor,
            variable = %self.variable,
            year = %self.year,
            stage = ?stage,
            error = %err,
            "combination failed"
        );
        self.status = CombinationStatus::Failed;
        self.failed_stage = Some(stage);
        self.error = Some(err.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub items: Vec<CombinationReport>,
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub extract_failures: usize,
}

impl BatchReport {
    pub fn from_items(items: Vec<CombinationReport>) -> Self {
        let count = |status| items.iter().filter(|item| item.status == status).count();
        let uploaded = count(CombinationStatus::Uploaded);
        let skipped = count(CombinationStatus::Skipped);
        let failed = count(CombinationStatus::Failed);
        let extract_failures = items
            .iter()
            .filter(|item| item.extract_error.is_some())
            .count();
        Self {
            items,
            uploaded,
            skipped,
            failed,
            extract_failures,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &CombinationReport> {
        self.items
            .iter()
            .filter(|item| item.status == CombinationStatus::Failed)
    }
}

/// Request and destination key for one combination, without any I/O.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedCombination {
    pub combination: Combination,
    pub key: StorageKey,
    /// Leading token of extracted member names; unique per sensor and variable.
    pub member_stem: String,
    pub request: RequestSpec,
}

pub fn plan_combination(
    catalog: &ResolvedCatalog,
    combination: &Combination,
) -> Result<PlannedCombination, HarvestError> {
    let sensor = catalog.sensor(&combination.sensor_name)?;
    let request = sensor.request_for(&combination.variable, &combination.year);
    request.validate()?;
    let category = category_for(sensor, &combination.variable, &catalog.keys);
    let key = catalog
        .keys
        .derive_default(category, &request.sensor, &combination.year)?;
    let member_stem = if sensor.variables.len() > 1 {
        format!("{}-{}", request.sensor, combination.variable)
    } else {
        request.sensor.clone()
    };
    Ok(PlannedCombination {
        combination: combination.clone(),
        key,
        member_stem,
        request,
    })
}

pub fn plan(
    catalog: &ResolvedCatalog,
    combinations: &[Combination],
) -> Result<Vec<PlannedCombination>, HarvestError> {
    combinations
        .iter()
        .map(|combination| plan_combination(catalog, combination))
        .collect()
}

/// Drives fetch, upload, optional extraction and cleanup for every combination.
pub struct Pipeline<A: ArchiveClient, S: ObjectStoreClient> {
    catalog: ResolvedCatalog,
    fetcher: Fetcher<A>,
    uploader: Uploader<S>,
    extractor: Option<Extractor>,
}

impl<A: ArchiveClient, S: ObjectStoreClient> Pipeline<A, S> {
    pub fn new(catalog: ResolvedCatalog, fetcher: Fetcher<A>, uploader: Uploader<S>) -> Self {
        Self {
            catalog,
            fetcher,
            uploader,
            extractor: None,
        }
    }

    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn catalog(&self) -> &ResolvedCatalog {
        &self.catalog
    }

    pub fn fetcher(&self) -> &Fetcher<A> {
        &self.fetcher
    }

    pub fn uploader(&self) -> &Uploader<S> {
        &self.uploader
    }

    /// Processes every combination; per-combination failures land in the report.
    pub fn run(
        &self,
        combinations: &[Combination],
        workers: usize,
        sink: &dyn ProgressSink,
    ) -> BatchReport {
        let start = Instant::now();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Resolve; {} combinations, {} workers",
                combinations.len(),
                workers.max(1)
            ),
            elapsed: None,
        });

        let items = if workers <= 1 || combinations.len() <= 1 {
            combinations
                .iter()
                .map(|combination| self.process(combination, sink))
                .collect()
        } else {
            self.run_pool(combinations, workers, sink)
        };

        let report = BatchReport::from_items(items);
        info!(
            uploaded = report.uploaded,
            skipped = report.skipped,
            failed = report.failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "batch finished"
        );
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; uploaded={} skipped={} failed={}",
                report.uploaded, report.skipped, report.failed
            ),
            elapsed: Some(start.elapsed()),
        });
        report
    }

    fn run_pool(
        &self,
        combinations: &[Combination],
        workers: usize,
        sink: &dyn ProgressSink,
    ) -> Vec<CombinationReport> {
        let next = AtomicUsize::new(0);
        let slots = Mutex::new(vec![None; combinations.len()]);

        thread::scope(|scope| {
            for _ in 0..workers.min(combinations.len()) {
                scope.spawn(|| {
                    loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(combination) = combinations.get(index) else {
                            break;
                        };
                        let report = self.process(combination, sink);
                        if let Ok(mut slots) = slots.lock() {
                            slots[index] = Some(report);
                        }
                    }
                });
            }
        });

        slots
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .into_iter()
            .zip(combinations)
            .map(|(slot, combination)| {
                slot.unwrap_or_else(|| {
                    CombinationReport::new(combination).fail(
                        Stage::Build,
                        &HarvestError::Filesystem("worker did not report".to_string()),
                    )
                })
            })
            .collect()
    }

    /// One isolated unit of work. The staged artifact is dropped, and its file
    /// deleted, on every return path.
    pub fn process(&self, combination: &Combination, sink: &dyn ProgressSink) -> CombinationReport {
        let start = Instant::now();
        let mut report = self.process_inner(combination, sink);
        report.elapsed_ms = start.elapsed().as_millis() as u64;
        report
    }

    fn process_inner(
        &self,
        combination: &Combination,
        sink: &dyn ProgressSink,
    ) -> CombinationReport {
        let mut report = CombinationReport::new(combination);
        sink.event(ProgressEvent {
            message: format!("phase=Fetch; {combination}"),
            elapsed: None,
        });

        let planned = match plan_combination(&self.catalog, combination) {
            Ok(planned) => planned,
            Err(err) => return report.fail(Stage::Build, &err),
        };
        report.key = Some(planned.key.to_string());

        let artifact = match self.fetcher.fetch(&planned.request) {
            Ok(artifact) => artifact,
            Err(err) => return report.fail(Stage::Fetch, &err),
        };

        sink.event(ProgressEvent {
            message: format!("phase=Store; {}", planned.key),
            elapsed: None,
        });
        let outcome = match self.uploader.upload(&artifact, &planned.key) {
            Ok(outcome) => outcome,
            Err(err) => return report.fail(Stage::Upload, &err),
        };

        match outcome {
            UploadOutcome::Uploaded { bytes } => {
                report.status = CombinationStatus::Uploaded;
                report.bytes = Some(bytes);
            }
            UploadOutcome::Skipped { bytes } => {
                report.status = CombinationStatus::Skipped;
                report.bytes = Some(bytes);
                return report;
            }
        }

        if let Some(extractor) = &self.extractor {
            let extracted = DateRange::for_year(
                &combination.year,
                &planned.request.months,
                planned.request.days.as_ref(),
            )
            .and_then(|range| {
                extractor.extract(&artifact, &planned.member_stem, &combination.year, &range)
            });
            match extracted {
                Ok(members) => report.extracted = members,
                Err(err) => {
                    error!(
                        sensor = %report.sensor,
                        year = %report.year,
                        stage = ?Stage::Extract,
                        error = %err,
                        "extraction failed; upload kept"
                    );
                    report.extract_error = Some(err.to_string());
                }
            }
        }

        debug!(combination = %combination, "combination complete");
        report
    }
}
