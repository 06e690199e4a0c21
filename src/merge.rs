//! Pure merge of raw records from the three datasets into one record.
//!
//! Precedence: the regional override refines or replaces the general
//! dataset's answer for its own jurisdiction only, field by field, and
//! never blanks a populated field. ASN fields are independent of the
//! geographic merge. The merge is side-effect free; the same inputs always
//! produce the same output.

use std::collections::BTreeMap;

use crate::record::{GeneralRecord, MergedRecord, RegionalRecord, Resolution};

const ENGLISH_LOCALE: &str = "en";

/// The jurisdiction the regional override dataset covers, plus the
/// constants needed to synthesize records for it.
#[derive(Debug, Clone)]
pub struct Jurisdiction {
    pub country_code: String,
    /// Locale preferred for names when the resolved country is this
    /// jurisdiction.
    pub native_locale: String,
    pub country_names: BTreeMap<String, String>,
    /// Timezone assumed when neither dataset supplies one.
    pub default_time_zone: String,
}

impl Jurisdiction {
    /// The override dataset shipped by default covers mainland China.
    pub fn china() -> Self {
        let mut country_names = BTreeMap::new();
        country_names.insert(ENGLISH_LOCALE.to_string(), "China".to_string());
        country_names.insert("zh-CN".to_string(), "中国".to_string());
        Self {
            country_code: "CN".to_string(),
            native_locale: "zh-CN".to_string(),
            country_names,
            default_time_zone: "Asia/Shanghai".to_string(),
        }
    }

    fn display_name(&self) -> String {
        localized(&self.country_names, Some(&self.native_locale))
            .unwrap_or_default()
            .to_string()
    }
}

impl Default for Jurisdiction {
    fn default() -> Self {
        Self::china()
    }
}

/// One sub-jurisdiction fold: records resolved to `country_code` are
/// re-tagged with the parent jurisdiction's code, with `display_name`
/// substituted as both city and region.
#[derive(Debug, Clone)]
pub struct RemapEntry {
    pub country_code: String,
    pub display_name: String,
}

/// Default remap table for the China jurisdiction.
pub fn default_remap() -> Vec<RemapEntry> {
    vec![
        RemapEntry {
            country_code: "HK".to_string(),
            display_name: "香港".to_string(),
        },
        RemapEntry {
            country_code: "TW".to_string(),
            display_name: "台湾".to_string(),
        },
    ]
}

/// Merge raw records from one resolution pass into a single record.
pub fn merge(
    resolution: &Resolution,
    jurisdiction: &Jurisdiction,
    remap: &[RemapEntry],
) -> MergedRecord {
    // All-empty records carry nothing for precedence purposes.
    let general = resolution.general.as_ref().filter(|g| g.is_match());
    let regional = resolution.regional.as_ref().filter(|r| r.is_match());

    let mut merged = match (general, regional) {
        (None, Some(regional)) => synthesize(regional, jurisdiction),
        (Some(general), Some(regional))
            if general.country_code.as_deref() == Some(jurisdiction.country_code.as_str()) =>
        {
            let mut base = from_general(general, jurisdiction);
            overlay(&mut base, regional, jurisdiction);
            base
        }
        (Some(general), _) => from_general(general, jurisdiction),
        (None, None) => MergedRecord::default(),
    };

    apply_remap(&mut merged, jurisdiction, remap);

    // ASN fields merge independently of the geographic precedence.
    if let Some(asn) = resolution.asn.as_ref().filter(|a| a.is_match()) {
        merged.as_number = Some(asn.number);
        merged.as_organization = asn.organization.clone();
    }

    // Jurisdiction IPs frequently resolve with a province but no city;
    // fall back to the region name rather than serving an empty city.
    if merged.country_code == jurisdiction.country_code
        && merged.city.is_empty()
        && !merged.region.is_empty()
    {
        merged.city = merged.region.clone();
    }

    merged
}

/// Pick a name from a locale map: the preferred locale first, then
/// English, then whatever locale is available.
fn localized<'a>(names: &'a BTreeMap<String, String>, preferred: Option<&str>) -> Option<&'a str> {
    if let Some(locale) = preferred {
        if let Some(name) = names.get(locale).filter(|n| !n.is_empty()) {
            return Some(name.as_str());
        }
    }
    if let Some(name) = names.get(ENGLISH_LOCALE).filter(|n| !n.is_empty()) {
        return Some(name.as_str());
    }
    names.values().find(|n| !n.is_empty()).map(String::as_str)
}

fn from_general(general: &GeneralRecord, jurisdiction: &Jurisdiction) -> MergedRecord {
    let country_code = general.country_code.clone().unwrap_or_default();
    let preferred = (country_code == jurisdiction.country_code)
        .then_some(jurisdiction.native_locale.as_str());

    MergedRecord {
        country_name: localized(&general.country_names, preferred)
            .unwrap_or_default()
            .to_string(),
        city: localized(&general.city_names, preferred)
            .unwrap_or_default()
            .to_string(),
        region: localized(&general.subdivision_names, preferred)
            .unwrap_or_default()
            .to_string(),
        region_code: general.subdivision_code.clone().unwrap_or_default(),
        latitude: general.latitude,
        longitude: general.longitude,
        time_zone: general.time_zone.clone().unwrap_or_default(),
        postal_code: general.postal_code.clone().unwrap_or_default(),
        continent_code: general.continent_code.clone().unwrap_or_default(),
        country_code,
        ..Default::default()
    }
}

/// Baseline record when only the override matched: the country is fixed to
/// the jurisdiction and the timezone defaults to its canonical zone.
fn synthesize(regional: &RegionalRecord, jurisdiction: &Jurisdiction) -> MergedRecord {
    MergedRecord {
        country_code: jurisdiction.country_code.clone(),
        country_name: jurisdiction.display_name(),
        city: regional.city.clone(),
        region: regional.province.clone(),
        districts: regional.districts.clone(),
        isp: regional.isp.clone(),
        time_zone: jurisdiction.default_time_zone.clone(),
        ..Default::default()
    }
}

/// Overlay override fields onto a general-dataset base, field by field.
/// Only fields the override actually supplies are written; a populated
/// base field is never blanked by an empty override field.
fn overlay(base: &mut MergedRecord, regional: &RegionalRecord, jurisdiction: &Jurisdiction) {
    if !regional.city.is_empty() {
        base.city = regional.city.clone();
    }
    if !regional.province.is_empty() {
        base.region = regional.province.clone();
    }
    if !regional.districts.is_empty() {
        base.districts = regional.districts.clone();
    }
    if !regional.isp.is_empty() {
        base.isp = regional.isp.clone();
    }
    if base.time_zone.is_empty() {
        base.time_zone = jurisdiction.default_time_zone.clone();
    }
}

fn apply_remap(merged: &mut MergedRecord, jurisdiction: &Jurisdiction, remap: &[RemapEntry]) {
    let Some(entry) = remap.iter().find(|e| e.country_code == merged.country_code) else {
        return;
    };
    merged.country_code = jurisdiction.country_code.clone();
    merged.country_name = jurisdiction.display_name();
    merged.city = entry.display_name.clone();
    merged.region = entry.display_name.clone();
    merged.region_code = String::new();
}
