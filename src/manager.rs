//! Holder of the live dataset generation.
//!
//! Readers take a short shared lock only to clone the current
//! [`DatasetSet`] pointer; the queries themselves run outside any lock.
//! The update pipeline opens replacement handles entirely before taking
//! the exclusive lock, so the critical section is a single pointer store.
//! A superseded generation is closed by the last reader that still holds
//! it dropping its reference, never while a lookup may be reading it.

use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};

use camino::Utf8Path;
use tracing::{debug, info, warn};

use crate::dataset::{DatasetKind, DatasetOpener, DatasetPaths, DatasetReader, DatasetSet};
use crate::error::{Error, Result};
use crate::merge::{self, Jurisdiction, RemapEntry};
use crate::record::{MergedRecord, Resolution};

pub struct DatasetManager<O: DatasetOpener> {
    opener: O,
    paths: DatasetPaths,
    jurisdiction: Jurisdiction,
    remap: Vec<RemapEntry>,
    current: RwLock<Arc<DatasetSet<O::Reader>>>,
}

impl<O: DatasetOpener> DatasetManager<O> {
    /// Create a manager with no datasets open yet. [`open`](Self::open)
    /// establishes the first generation once files exist on disk.
    pub fn new(opener: O, paths: DatasetPaths) -> Self {
        Self {
            opener,
            paths,
            jurisdiction: Jurisdiction::default(),
            remap: merge::default_remap(),
            current: RwLock::new(Arc::new(DatasetSet::empty())),
        }
    }

    pub fn with_jurisdiction(mut self, jurisdiction: Jurisdiction) -> Self {
        self.jurisdiction = jurisdiction;
        self
    }

    pub fn with_remap(mut self, remap: Vec<RemapEntry>) -> Self {
        self.remap = remap;
        self
    }

    pub fn paths(&self) -> &DatasetPaths {
        &self.paths
    }

    /// Open all three datasets from the canonical paths.
    ///
    /// A mandatory dataset that fails to open is logged and treated as
    /// absent; only both mandatory kinds failing together is fatal. The
    /// regional override is always optional.
    pub fn open(&self) -> Result<()> {
        let general = self.open_lenient(DatasetKind::General);
        let asn = self.open_lenient(DatasetKind::Asn);
        if general.is_none() && asn.is_none() {
            return Err(Error::NoDatasetsAvailable);
        }
        let regional = self.open_lenient(DatasetKind::RegionalOverride);

        let generation = self.publish(general, asn, regional);
        info!(generation, "datasets opened");
        Ok(())
    }

    /// Atomically replace the live generation with handles freshly opened
    /// from the canonical paths.
    ///
    /// Both mandatory datasets must open; any failure returns before
    /// shared state is touched, leaving the live generation exactly as it
    /// was. The regional override degrades to absent as usual.
    pub fn swap(&self) -> Result<()> {
        let general = self.opener.open(&self.paths.general)?;
        let asn = self.opener.open(&self.paths.asn)?;
        let regional = self.open_lenient(DatasetKind::RegionalOverride);

        let generation = self.publish(Some(general), Some(asn), regional);
        info!(generation, "datasets swapped");
        Ok(())
    }

    /// Query all three datasets of the current generation for one IP.
    ///
    /// Safe for unbounded concurrent callers and never blocks on I/O
    /// beyond the dataset reads themselves. Fails only when both
    /// mandatory datasets are absent.
    pub fn resolve(&self, ip: IpAddr) -> Result<Resolution> {
        let set = self.snapshot();
        if !set.has_mandatory() {
            return Err(Error::NoDatasetsAvailable);
        }

        let general = set
            .general
            .as_ref()
            .and_then(|reader| match reader.query_general(ip) {
                Ok(record) => record,
                Err(err) => {
                    warn!(%ip, error = %err, "general dataset lookup failed");
                    None
                }
            })
            .filter(|r| r.is_match());

        // The override is only relevant to its own jurisdiction; skip it
        // for traffic the general dataset already places elsewhere.
        let consult_override = general
            .as_ref()
            .map_or(true, |g| {
                g.country_code.as_deref() == Some(self.jurisdiction.country_code.as_str())
            });
        let regional = if consult_override {
            set.regional
                .as_ref()
                .and_then(|reader| match reader.query_regional(ip) {
                    Ok(record) => record,
                    Err(err) => {
                        debug!(%ip, error = %err, "regional override lookup failed");
                        None
                    }
                })
                .filter(|r| r.is_match())
        } else {
            None
        };

        let asn = set
            .asn
            .as_ref()
            .and_then(|reader| match reader.query_asn(ip) {
                Ok(record) => record,
                Err(err) => {
                    warn!(%ip, error = %err, "asn dataset lookup failed");
                    None
                }
            })
            .filter(|r| r.is_match());

        Ok(Resolution {
            general,
            asn,
            regional,
        })
    }

    /// Resolve and merge in one step: what the enrichment API layer calls.
    pub fn lookup(&self, ip: IpAddr) -> Result<MergedRecord> {
        let resolution = self.resolve(ip)?;
        Ok(merge::merge(&resolution, &self.jurisdiction, &self.remap))
    }

    /// Verify that `path` opens as a dataset, using the same capability
    /// serving uses, then close it immediately.
    pub fn probe(&self, path: &Utf8Path) -> Result<()> {
        self.opener.open(path).map(|_| ())
    }

    /// Generation counter of the currently published set.
    pub fn generation(&self) -> u64 {
        self.snapshot().generation()
    }

    /// Drop the current generation. Only used at process shutdown;
    /// in-flight lookups finish against the handles they already hold.
    pub fn close(&self) {
        self.publish(None, None, None);
        info!("datasets closed");
    }

    fn snapshot(&self) -> Arc<DatasetSet<O::Reader>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn open_lenient(&self, kind: DatasetKind) -> Option<O::Reader> {
        let path = self.paths.for_kind(kind);
        match self.opener.open(path) {
            Ok(reader) => Some(reader),
            Err(err) => {
                warn!(dataset = %kind, %path, error = %err, "dataset unavailable");
                None
            }
        }
    }

    /// The only writer section: store the new generation and let the old
    /// one drain as outstanding readers drop their clones.
    fn publish(
        &self,
        general: Option<O::Reader>,
        asn: Option<O::Reader>,
        regional: Option<O::Reader>,
    ) -> u64 {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let generation = guard.generation() + 1;
        *guard = Arc::new(DatasetSet::new(general, asn, regional, generation));
        generation
    }
}
