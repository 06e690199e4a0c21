//! Dataset kinds, canonical paths, and the open/query/close capability
//! contract.
//!
//! The lifecycle machinery never touches `maxminddb` directly: it works
//! against the [`DatasetOpener`]/[`DatasetReader`] traits, with
//! [`MmdbOpener`] as the production implementation. Tests substitute fake
//! openers to exercise swap and pipeline behavior without binary fixtures.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use camino::{Utf8Path, Utf8PathBuf};
use maxminddb::{geoip2, MaxMindDBError, Mmap, Reader};

use crate::error::{Error, Result};
use crate::record::{AsnRecord, GeneralRecord, RegionalRecord};

/// The three dataset roles the resolver knows about. Each kind maps to
/// exactly one file in the data directory at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    General,
    Asn,
    RegionalOverride,
}

impl DatasetKind {
    /// Canonical file name for this kind inside the data directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            DatasetKind::General => "GeoLite2-City.mmdb",
            DatasetKind::Asn => "GeoLite2-ASN.mmdb",
            DatasetKind::RegionalOverride => "GeoCN.mmdb",
        }
    }

    pub const ALL: [DatasetKind; 3] = [
        DatasetKind::General,
        DatasetKind::Asn,
        DatasetKind::RegionalOverride,
    ];
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatasetKind::General => "general",
            DatasetKind::Asn => "asn",
            DatasetKind::RegionalOverride => "regional-override",
        };
        f.write_str(name)
    }
}

/// Canonical on-disk locations of the three datasets.
#[derive(Debug, Clone)]
pub struct DatasetPaths {
    pub general: Utf8PathBuf,
    pub asn: Utf8PathBuf,
    pub regional: Utf8PathBuf,
}

impl DatasetPaths {
    pub fn new(data_dir: &Utf8Path) -> Self {
        Self {
            general: data_dir.join(DatasetKind::General.file_name()),
            asn: data_dir.join(DatasetKind::Asn.file_name()),
            regional: data_dir.join(DatasetKind::RegionalOverride.file_name()),
        }
    }

    pub fn for_kind(&self, kind: DatasetKind) -> &Utf8Path {
        match kind {
            DatasetKind::General => &self.general,
            DatasetKind::Asn => &self.asn,
            DatasetKind::RegionalOverride => &self.regional,
        }
    }
}

/// Query side of an opened dataset. Implementations must be safe for
/// unbounded concurrent callers; lookups are expected to complete in
/// microseconds and are never cancelled externally.
///
/// Address-not-found is `Ok(None)`, never an error.
pub trait DatasetReader: Send + Sync + 'static {
    fn query_general(&self, ip: IpAddr) -> Result<Option<GeneralRecord>>;
    fn query_asn(&self, ip: IpAddr) -> Result<Option<AsnRecord>>;
    fn query_regional(&self, ip: IpAddr) -> Result<Option<RegionalRecord>>;
}

/// Open capability for datasets. The same opener is used at serving time
/// and by the update pipeline's final validation stage, so "it opened" has
/// the same meaning in both places.
pub trait DatasetOpener: Send + Sync + 'static {
    type Reader: DatasetReader;

    fn open(&self, path: &Utf8Path) -> Result<Self::Reader>;
}

/// Production opener backed by memory-mapped MMDB files.
#[derive(Debug, Clone, Copy, Default)]
pub struct MmdbOpener;

/// One opened MMDB file. Closing is dropping: the underlying map is
/// unmapped when the last clone of the owning generation goes away.
pub struct MmdbReader {
    reader: Reader<Mmap>,
}

impl DatasetOpener for MmdbOpener {
    type Reader = MmdbReader;

    fn open(&self, path: &Utf8Path) -> Result<MmdbReader> {
        let reader = Reader::open_mmap(path.as_std_path()).map_err(|source| Error::DatasetOpen {
            path: path.to_owned(),
            source,
        })?;
        Ok(MmdbReader { reader })
    }
}

impl DatasetReader for MmdbReader {
    fn query_general(&self, ip: IpAddr) -> Result<Option<GeneralRecord>> {
        match self.reader.lookup::<geoip2::City>(ip) {
            Ok(city) => Ok(Some(general_from_city(city))),
            Err(MaxMindDBError::AddressNotFoundError(_)) => Ok(None),
            Err(source) => Err(Error::LookupFailed { ip, source }),
        }
    }

    fn query_asn(&self, ip: IpAddr) -> Result<Option<AsnRecord>> {
        match self.reader.lookup::<geoip2::Asn>(ip) {
            Ok(asn) => Ok(Some(AsnRecord {
                number: asn.autonomous_system_number.unwrap_or(0),
                organization: asn
                    .autonomous_system_organization
                    .unwrap_or_default()
                    .to_string(),
            })),
            Err(MaxMindDBError::AddressNotFoundError(_)) => Ok(None),
            Err(source) => Err(Error::LookupFailed { ip, source }),
        }
    }

    fn query_regional(&self, ip: IpAddr) -> Result<Option<RegionalRecord>> {
        match self.reader.lookup::<RegionalRecord>(ip) {
            Ok(record) => Ok(Some(record)),
            Err(MaxMindDBError::AddressNotFoundError(_)) => Ok(None),
            Err(source) => Err(Error::LookupFailed { ip, source }),
        }
    }
}

fn owned_names(names: Option<BTreeMap<&str, &str>>) -> BTreeMap<String, String> {
    names
        .map(|m| {
            m.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn general_from_city(record: geoip2::City<'_>) -> GeneralRecord {
    let mut out = GeneralRecord::default();

    if let Some(country) = record.country {
        out.country_code = country.iso_code.map(str::to_string);
        out.country_names = owned_names(country.names);
    }
    if let Some(city) = record.city {
        out.city_names = owned_names(city.names);
    }
    // Only the first subdivision is kept; additional levels are rare in the
    // general dataset and the merge only consumes one.
    if let Some(subdivision) = record.subdivisions.and_then(|s| s.into_iter().next()) {
        out.subdivision_code = subdivision.iso_code.map(str::to_string);
        out.subdivision_names = owned_names(subdivision.names);
    }
    if let Some(location) = record.location {
        out.latitude = location.latitude;
        out.longitude = location.longitude;
        out.time_zone = location.time_zone.map(str::to_string);
    }
    if let Some(postal) = record.postal {
        out.postal_code = postal.code.map(str::to_string);
    }
    if let Some(continent) = record.continent {
        out.continent_code = continent.code.map(str::to_string);
    }

    out
}

/// One immutable generation of opened datasets: the unit of atomic
/// replacement. A resolution either sees this generation in full or the
/// next one in full, never a mix.
pub struct DatasetSet<R> {
    pub(crate) general: Option<R>,
    pub(crate) asn: Option<R>,
    pub(crate) regional: Option<R>,
    generation: u64,
}

impl<R> DatasetSet<R> {
    pub(crate) fn new(
        general: Option<R>,
        asn: Option<R>,
        regional: Option<R>,
        generation: u64,
    ) -> Self {
        Self {
            general,
            asn,
            regional,
            generation,
        }
    }

    pub(crate) fn empty() -> Self {
        Self::new(None, None, None, 0)
    }

    /// Serving requires at least one of the mandatory datasets.
    pub fn has_mandatory(&self) -> bool {
        self.general.is_some() || self.asn.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
