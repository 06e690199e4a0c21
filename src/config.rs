//! Runtime configuration and the static update-source table.

use std::time::Duration;

use camino::Utf8PathBuf;

use crate::dataset::DatasetKind;
use crate::update::{DatasetSource, UpdateJob};

/// Default directory for dataset files and change-token sidecars.
pub const DEFAULT_DATA_DIR: &str = "data";

/// Default hours between update checks.
pub const DEFAULT_UPDATE_INTERVAL_HOURS: u64 = 24;

/// Default overall timeout for one dataset download.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Release URL for the regional override dataset.
pub const REGIONAL_DATASET_URL: &str =
    "https://github.com/ljxi/GeoCN/releases/download/Latest/GeoCN.mmdb";

#[derive(Debug, Clone)]
pub struct Config {
    /// Where dataset files and their change-token sidecars live.
    pub data_dir: Utf8PathBuf,
    /// Wall-clock interval between scheduled update passes.
    pub update_interval: Duration,
    /// Overall timeout for a single download.
    pub http_timeout: Duration,
    /// License key for MaxMind edition downloads. Without it, edition
    /// jobs fail each cycle (logged) while direct-URL jobs keep working.
    pub license_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: Utf8PathBuf::from(DEFAULT_DATA_DIR),
            update_interval: Duration::from_secs(DEFAULT_UPDATE_INTERVAL_HOURS * 60 * 60),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            license_key: None,
        }
    }
}

/// The standard job table: one job per dataset kind.
pub fn default_jobs() -> Vec<UpdateJob> {
    vec![
        UpdateJob::new(
            DatasetKind::General,
            DatasetSource::Edition {
                edition_id: "GeoLite2-City".to_string(),
            },
        ),
        UpdateJob::new(
            DatasetKind::Asn,
            DatasetSource::Edition {
                edition_id: "GeoLite2-ASN".to_string(),
            },
        ),
        UpdateJob::new(
            DatasetKind::RegionalOverride,
            DatasetSource::DirectUrl {
                url: REGIONAL_DATASET_URL.to_string(),
            },
        ),
    ]
}
