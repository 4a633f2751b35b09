use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{info, warn};
use zip::ZipArchive;

use crate::domain::DateRange;
use crate::error::HarvestError;
use crate::staging::StagedArtifact;

pub const NETCDF_SUFFIX: &str = ".nc";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedMember {
    /// Member name inside the archive.
    pub source: String,
    pub path: Utf8PathBuf,
    pub bytes: u64,
}

/// Pulls scientific-data members out of a staged zip and renames them by date range.
#[derive(Debug, Clone)]
pub struct Extractor {
    output_dir: Utf8PathBuf,
    suffix: String,
}

impl Extractor {
    pub fn new(output_dir: Utf8PathBuf) -> Self {
        Self {
            output_dir,
            suffix: NETCDF_SUFFIX.to_string(),
        }
    }

    pub fn with_suffix(mut self, suffix: &str) -> Self {
        self.suffix = suffix.to_string();
        self
    }

    pub fn output_dir(&self) -> &Utf8Path {
        &self.output_dir
    }

    pub fn extract(
        &self,
        artifact: &StagedArtifact,
        stem: &str,
        year: &str,
        range: &DateRange,
    ) -> Result<Vec<ExtractedMember>, HarvestError> {
        let malformed = |message: String| HarvestError::MalformedArchive {
            path: artifact.path().display().to_string(),
            message,
        };
        let file = fs::File::open(artifact.path()).map_err(|err| malformed(err.to_string()))?;
        let mut archive = ZipArchive::new(file).map_err(|err| malformed(err.to_string()))?;

        let mut members = Vec::new();
        for i in 0..archive.len() {
            let entry = archive
                .by_index_raw(i)
                .map_err(|err| malformed(err.to_string()))?;
            if !entry.is_dir() && entry.name().ends_with(&self.suffix) {
                members.push(i);
            }
        }

        if members.is_empty() {
            warn!(stem, year, suffix = %self.suffix, "no matching members in archive");
            return Ok(Vec::new());
        }

        fs::create_dir_all(self.output_dir.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;

        let total = members.len();
        let mut extracted = Vec::with_capacity(total);
        for (position, index) in members.into_iter().enumerate() {
            let mut entry = archive
                .by_index(index)
                .map_err(|err| malformed(err.to_string()))?;
            let source = entry.name().to_string();
            let file_name = member_file_name(stem, range, position + 1, total, &self.suffix);
            let target = self.output_dir.join(&file_name);

            let mut temp = tempfile::Builder::new()
                .prefix("cds-harvest-member")
                .tempfile_in(self.output_dir.as_std_path())
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            let bytes = io::copy(&mut entry, &mut temp).map_err(|err| malformed(err.to_string()))?;
            temp.persist(target.as_std_path())
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;

            info!(stem, year, member = %source, path = %target, bytes, "extracted");
            extracted.push(ExtractedMember {
                source,
                path: target,
                bytes,
            });
        }
        Ok(extracted)
    }
}

/// `<stem>_<start>_<end>[_part<N>]<suffix>`. The stem is the sensor, plus the
/// variable for multi-variable sensors; the part tag only appears for
/// multi-member archives.
pub fn member_file_name(
    stem: &str,
    range: &DateRange,
    part: usize,
    total: usize,
    suffix: &str,
) -> String {
    if total > 1 {
        format!("{stem}_{}_{}_part{part}{suffix}", range.start, range.end)
    } else {
        format!("{stem}_{}_{}{suffix}", range.start, range.end)
    }
}
