//! Structured record types for dataset query results.
//!
//! Each dataset kind yields its own raw record shape with explicitly named
//! optional fields; [`MergedRecord`] is the fully resolved output produced
//! by the merge step. All fields are owned so records can outlive the
//! dataset generation they were read from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Raw result of querying the general (city-level) dataset for one IP.
///
/// Localized names are keyed by locale code (`en`, `zh-CN`, ...). A record
/// without a country code is treated as "no match" rather than an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneralRecord {
    pub country_code: Option<String>,
    pub country_names: BTreeMap<String, String>,
    pub city_names: BTreeMap<String, String>,
    pub subdivision_code: Option<String>,
    pub subdivision_names: BTreeMap<String, String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub time_zone: Option<String>,
    pub postal_code: Option<String>,
    pub continent_code: Option<String>,
}

impl GeneralRecord {
    /// Whether this record actually matched the queried IP. A record with
    /// no country code carries nothing usable for precedence decisions.
    pub fn is_match(&self) -> bool {
        self.country_code.as_deref().is_some_and(|c| !c.is_empty())
    }
}

/// Raw result of querying the ASN dataset for one IP.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsnRecord {
    pub number: u32,
    pub organization: String,
}

impl AsnRecord {
    /// AS number 0 means the dataset had no routing data for the IP.
    pub fn is_match(&self) -> bool {
        self.number > 0
    }
}

/// Raw result of querying the regional override dataset for one IP.
///
/// Field names mirror the override dataset's record schema so the record
/// deserializes straight out of the database.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RegionalRecord {
    pub province: String,
    #[serde(rename = "provinceCode")]
    pub province_code: u32,
    pub city: String,
    #[serde(rename = "cityCode")]
    pub city_code: u32,
    pub districts: String,
    #[serde(rename = "districtsCode")]
    pub districts_code: u32,
    pub isp: String,
    pub net: String,
}

impl RegionalRecord {
    /// The override dataset always carries at least a province for IPs it
    /// covers; an empty province means no match.
    pub fn is_match(&self) -> bool {
        !self.province.is_empty()
    }
}

/// The raw triple returned by one resolution pass, all drawn from a single
/// dataset generation.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub general: Option<GeneralRecord>,
    pub asn: Option<AsnRecord>,
    pub regional: Option<RegionalRecord>,
}

/// Fully resolved enrichment record after precedence merging.
///
/// `country_code` is the code that drove the precedence decisions. Absent
/// fields are empty strings (or `None` for coordinates) rather than being
/// omitted; the API layer decides how to shape them on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergedRecord {
    pub country_code: String,
    pub country_name: String,
    pub city: String,
    pub region: String,
    pub region_code: String,
    pub districts: String,
    pub isp: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub time_zone: String,
    pub postal_code: String,
    pub continent_code: String,
    pub as_number: Option<u32>,
    pub as_organization: String,
}
