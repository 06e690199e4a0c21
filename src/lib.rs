//! The ipgeod library: dataset lifecycle management and multi-source IP
//! enrichment.
//!
//! The crate keeps a set of on-disk geo-datasets open for low-latency
//! concurrent lookups, atomically replaces them with freshly downloaded
//! versions on a schedule, and merges the general, ASN, and
//! regional-override answers for an IP into one [`MergedRecord`].
//!
//! # Examples
//!
//! Opening the standard datasets and resolving an address:
//!
//! ```rust,no_run
//! use camino::Utf8Path;
//! use ipgeod::dataset::{DatasetPaths, MmdbOpener};
//! use ipgeod::DatasetManager;
//!
//! # fn main() -> ipgeod::Result<()> {
//! let paths = DatasetPaths::new(Utf8Path::new("data"));
//! let manager = DatasetManager::new(MmdbOpener, paths);
//! manager.open()?;
//!
//! let record = manager.lookup("1.2.4.8".parse().unwrap())?;
//! println!("{} {}", record.country_code, record.city);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dataset;
pub mod error;
pub mod fetch;
pub mod manager;
pub mod merge;
pub mod record;
pub mod scheduler;
pub mod update;
pub mod validate;

pub use crate::error::{Error, Result};
pub use crate::manager::DatasetManager;
pub use crate::record::{MergedRecord, Resolution};
