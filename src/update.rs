//! Download, validate, and atomically install dataset replacements.
//!
//! Each job advances strictly forward through
//! requested → downloaded → format-validated → (extracted) →
//! dataset-validated → installed; any failure aborts the job and leaves
//! the installed dataset untouched. Staged payloads live in unnamed temp
//! files inside the data directory so the final step is a rename on one
//! filesystem, and are removed on every exit path by their drop guard.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use futures::future::join_all;
use tar::Archive;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::dataset::{DatasetKind, DatasetOpener};
use crate::error::{Error, Result};
use crate::fetch::{Fetch, FetchOutcome};
use crate::manager::DatasetManager;
use crate::validate;

/// MaxMind's authenticated download endpoint for GeoLite2 editions.
pub const MAXMIND_DOWNLOAD_URL: &str = "https://download.maxmind.com/app/geoip_download";

/// Bodies below this size are rejected as error pages, not datasets.
pub const DEFAULT_MIN_DATASET_SIZE: usize = 2 * 1024 * 1024;

/// File suffix of the dataset member expected inside archives.
const DATASET_SUFFIX: &str = ".mmdb";

/// Where a dataset kind's replacement bytes come from.
#[derive(Debug, Clone)]
pub enum DatasetSource {
    /// A MaxMind edition, downloaded as a tar.gz with the configured
    /// license key.
    Edition { edition_id: String },
    /// A direct URL to either a raw dataset or a tar.gz archive.
    DirectUrl { url: String },
}

/// Static per-kind update descriptor, constructed once at startup.
#[derive(Debug, Clone)]
pub struct UpdateJob {
    pub kind: DatasetKind,
    pub source: DatasetSource,
}

impl UpdateJob {
    pub fn new(kind: DatasetKind, source: DatasetSource) -> Self {
        Self { kind, source }
    }

    fn url(&self, license_key: Option<&str>) -> Result<String> {
        match &self.source {
            DatasetSource::Edition { edition_id } => {
                let key = license_key.ok_or(Error::MissingLicenseKey)?;
                Ok(format!(
                    "{MAXMIND_DOWNLOAD_URL}?edition_id={edition_id}&license_key={key}&suffix=tar.gz"
                ))
            }
            DatasetSource::DirectUrl { url } => Ok(url.clone()),
        }
    }

    fn is_archive(&self) -> bool {
        match &self.source {
            DatasetSource::Edition { .. } => true,
            DatasetSource::DirectUrl { url } => url.ends_with(".tar.gz"),
        }
    }
}

/// Terminal state of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A new dataset version was installed and swapped in.
    Installed,
    /// The origin still serves the version identified by our change
    /// token. Reported as success, not an error.
    UpToDate,
}

/// Pipeline stages, used to report where a failed job aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Requested,
    Downloaded,
    FormatValidated,
    Extracted,
    DatasetValidated,
    Installed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Requested => "requested",
            Stage::Downloaded => "downloaded",
            Stage::FormatValidated => "format-validated",
            Stage::Extracted => "extracted",
            Stage::DatasetValidated => "dataset-validated",
            Stage::Installed => "installed",
        };
        f.write_str(name)
    }
}

/// A validated payload staged next to the canonical path. The backing
/// temp file is deleted on drop unless it gets installed.
struct StagedArtifact {
    tmp: NamedTempFile,
}

impl StagedArtifact {
    fn from_raw(data_dir: &Utf8Path, body: &[u8]) -> Result<Self> {
        let mut tmp = NamedTempFile::new_in(data_dir)?;
        tmp.as_file_mut().write_all(body)?;
        Ok(Self { tmp })
    }

    fn from_archive(data_dir: &Utf8Path, archive: &[u8]) -> Result<Self> {
        let mut tmp = NamedTempFile::new_in(data_dir)?;
        extract_member(archive, DATASET_SUFFIX, tmp.as_file_mut())?;
        Ok(Self { tmp })
    }

    fn path(&self) -> Result<&Utf8Path> {
        Utf8Path::from_path(self.tmp.path()).ok_or_else(|| {
            Error::FormatInvalid {
                reason: "staging path is not valid UTF-8".to_string(),
            }
        })
    }

    /// Atomic rename over the canonical path; both live in the data
    /// directory so no cross-filesystem copy can expose partial writes.
    fn install(self, canonical: &Utf8Path) -> Result<()> {
        self.tmp
            .persist(canonical)
            .map(|_| ())
            .map_err(|err| Error::Io(err.error))
    }
}

/// Extract the first regular archive member whose path ends in `suffix`.
fn extract_member<W: io::Write>(archive: &[u8], suffix: &str, dest: &mut W) -> Result<()> {
    let mut tar = Archive::new(GzDecoder::new(archive));
    for entry in tar.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let matched = {
            let path = entry.path()?;
            path.to_str().is_some_and(|p| p.ends_with(suffix))
        };
        if matched {
            io::copy(&mut entry, dest)?;
            return Ok(());
        }
    }
    Err(Error::MemberNotFound {
        suffix: suffix.to_string(),
    })
}

fn read_change_token(path: &Utf8Path) -> Option<String> {
    let token = fs::read_to_string(path).ok()?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn write_change_token(path: &Utf8Path, token: &str) -> Result<()> {
    fs::write(path, token)?;
    Ok(())
}

/// Runs update jobs and hands validated files to the manager's swap.
///
/// Jobs for different dataset kinds are independent: they run
/// concurrently and one job's failure never blocks or rolls back
/// another's success. All failures stay inside the job; lookups keep
/// serving the last-known-good generation.
pub struct UpdatePipeline<O: DatasetOpener, F: Fetch> {
    manager: Arc<DatasetManager<O>>,
    fetcher: F,
    jobs: Vec<UpdateJob>,
    data_dir: Utf8PathBuf,
    license_key: Option<String>,
    min_size: usize,
}

impl<O: DatasetOpener, F: Fetch> UpdatePipeline<O, F> {
    pub fn new(
        manager: Arc<DatasetManager<O>>,
        fetcher: F,
        jobs: Vec<UpdateJob>,
        data_dir: Utf8PathBuf,
        license_key: Option<String>,
    ) -> Self {
        Self {
            manager,
            fetcher,
            jobs,
            data_dir,
            license_key,
            min_size: DEFAULT_MIN_DATASET_SIZE,
        }
    }

    /// Lower the minimum-size guard; only sensible with synthetic
    /// datasets.
    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn jobs(&self) -> &[UpdateJob] {
        &self.jobs
    }

    /// Whether any canonical dataset file is missing from disk.
    pub fn any_dataset_missing(&self) -> bool {
        self.jobs
            .iter()
            .any(|job| !self.canonical_path(job.kind).exists())
    }

    /// Run every job concurrently, logging outcomes. Individual failures
    /// are contained per job.
    pub async fn run_all(&self) {
        join_all(self.jobs.iter().map(|job| self.run_job(job))).await;
    }

    /// Drive one job through the full state machine.
    pub async fn run_job(&self, job: &UpdateJob) -> Result<UpdateOutcome> {
        let mut stage = Stage::Requested;
        match self.execute(job, &mut stage).await {
            Ok(UpdateOutcome::Installed) => {
                info!(dataset = %job.kind, "dataset updated");
                Ok(UpdateOutcome::Installed)
            }
            Ok(UpdateOutcome::UpToDate) => {
                debug!(dataset = %job.kind, "dataset is up to date");
                Ok(UpdateOutcome::UpToDate)
            }
            Err(err) => {
                warn!(
                    dataset = %job.kind,
                    %stage,
                    error = %err,
                    "dataset update failed; keeping current data"
                );
                Err(err)
            }
        }
    }

    async fn execute(&self, job: &UpdateJob, stage: &mut Stage) -> Result<UpdateOutcome> {
        let canonical = self.canonical_path(job.kind);
        let token_path = self.token_path(job.kind);
        let url = job.url(self.license_key.as_deref())?;

        *stage = Stage::Requested;
        let previous_token = read_change_token(&token_path);
        let (body, new_token) = match self.fetcher.fetch(&url, previous_token.as_deref()).await? {
            FetchOutcome::NotModified => return Ok(UpdateOutcome::UpToDate),
            FetchOutcome::Fetched { body, change_token } => (body, change_token),
        };

        *stage = Stage::Downloaded;
        validate::check_min_size(&body, self.min_size)?;

        *stage = Stage::FormatValidated;
        validate::check_not_markup(&body)?;
        let staged = if job.is_archive() {
            validate::check_gzip_magic(&body)?;
            *stage = Stage::Extracted;
            StagedArtifact::from_archive(&self.data_dir, &body)?
        } else {
            if !validate::mmdb_header_plausible(&body) {
                warn!(dataset = %job.kind, "dataset header check inconclusive");
            }
            StagedArtifact::from_raw(&self.data_dir, &body)?
        };

        *stage = Stage::DatasetValidated;
        let staged_path = staged.path()?.to_owned();
        self.manager
            .probe(&staged_path)
            .map_err(|err| Error::DatasetInvalid {
                path: staged_path,
                source: Box::new(err),
            })?;

        *stage = Stage::Installed;
        staged.install(&canonical)?;
        if let Some(token) = &new_token {
            if let Err(err) = write_change_token(&token_path, token) {
                warn!(dataset = %job.kind, error = %err, "failed to persist change token");
            }
        }
        self.manager.swap()?;

        Ok(UpdateOutcome::Installed)
    }

    fn canonical_path(&self, kind: DatasetKind) -> Utf8PathBuf {
        self.data_dir.join(kind.file_name())
    }

    fn token_path(&self, kind: DatasetKind) -> Utf8PathBuf {
        self.data_dir.join(format!("{}.etag", kind.file_name()))
    }
}
