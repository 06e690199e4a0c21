//! Lifecycle tests for the dataset manager, update pipeline, and
//! scheduler, driven through fake dataset and fetch capabilities so no
//! binary fixtures or network access are needed.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio_util::sync::CancellationToken;

use ipgeod::dataset::{DatasetKind, DatasetOpener, DatasetPaths, DatasetReader};
use ipgeod::error::{Error, Result};
use ipgeod::fetch::{Fetch, FetchOutcome};
use ipgeod::record::{AsnRecord, GeneralRecord, RegionalRecord};
use ipgeod::scheduler::Scheduler;
use ipgeod::update::{DatasetSource, UpdateJob, UpdatePipeline, UpdateOutcome};
use ipgeod::DatasetManager;

/// Opens tiny `key=value` text fixtures in place of binary datasets. A
/// file whose whole content is `corrupt` refuses to open, mimicking an
/// unreadable dataset.
#[derive(Clone, Default)]
struct TextOpener {
    regional_queries: Arc<AtomicUsize>,
}

struct TextReader {
    fields: BTreeMap<String, String>,
    regional_queries: Arc<AtomicUsize>,
}

impl DatasetOpener for TextOpener {
    type Reader = TextReader;

    fn open(&self, path: &Utf8Path) -> Result<TextReader> {
        let content = std::fs::read_to_string(path)?;
        if content.trim() == "corrupt" {
            return Err(Error::DatasetOpen {
                path: path.to_owned(),
                source: maxminddb::MaxMindDBError::InvalidDatabaseError(
                    "corrupt fixture".to_string(),
                ),
            });
        }
        let fields = content
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        Ok(TextReader {
            fields,
            regional_queries: self.regional_queries.clone(),
        })
    }
}

impl TextReader {
    fn get(&self, key: &str) -> Option<String> {
        self.fields.get(key).filter(|v| !v.is_empty()).cloned()
    }
}

impl DatasetReader for TextReader {
    fn query_general(&self, _ip: IpAddr) -> Result<Option<GeneralRecord>> {
        Ok(self.get("country").map(|code| GeneralRecord {
            country_code: Some(code),
            city_names: self
                .get("city")
                .map(|c| BTreeMap::from([("en".to_string(), c)]))
                .unwrap_or_default(),
            subdivision_names: self
                .get("region")
                .map(|r| BTreeMap::from([("en".to_string(), r)]))
                .unwrap_or_default(),
            ..Default::default()
        }))
    }

    fn query_asn(&self, _ip: IpAddr) -> Result<Option<AsnRecord>> {
        Ok(self.get("asn").map(|number| AsnRecord {
            number: number.parse().unwrap_or(0),
            organization: self.get("org").unwrap_or_default(),
        }))
    }

    fn query_regional(&self, _ip: IpAddr) -> Result<Option<RegionalRecord>> {
        self.regional_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.get("province").map(|province| RegionalRecord {
            province,
            city: self.get("rcity").unwrap_or_default(),
            isp: self.get("isp").unwrap_or_default(),
            ..Default::default()
        }))
    }
}

/// Serves one scripted body, answering conditionally once the caller
/// advertises the scripted change token.
#[derive(Clone)]
struct ScriptedFetcher {
    body: Arc<Vec<u8>>,
    token: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedFetcher {
    fn new(body: Vec<u8>, token: Option<&str>) -> Self {
        Self {
            body: Arc::new(body),
            token: token.map(str::to_string),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Fetch for ScriptedFetcher {
    async fn fetch(&self, _url: &str, change_token: Option<&str>) -> Result<FetchOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if change_token.is_some() && change_token == self.token.as_deref() {
            return Ok(FetchOutcome::NotModified);
        }
        Ok(FetchOutcome::Fetched {
            body: self.body.as_ref().clone(),
            change_token: self.token.clone(),
        })
    }
}

fn fixture(lines: &[(&str, &str)]) -> String {
    lines
        .iter()
        .map(|(k, v)| format!("{k}={v}\n"))
        .collect::<String>()
}

fn write_dataset(dir: &Utf8Path, kind: DatasetKind, lines: &[(&str, &str)]) {
    std::fs::write(dir.join(kind.file_name()), fixture(lines)).unwrap();
}

fn test_dir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, path)
}

fn ip() -> IpAddr {
    "203.0.113.7".parse().unwrap()
}

fn targz(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn regional_job() -> UpdateJob {
    UpdateJob::new(
        DatasetKind::RegionalOverride,
        DatasetSource::DirectUrl {
            url: "https://datasets.example/GeoCN.mmdb".to_string(),
        },
    )
}

// --- DatasetManager ---

#[test]
fn open_degrades_when_one_mandatory_dataset_is_missing() {
    let (_guard, dir) = test_dir();
    write_dataset(&dir, DatasetKind::General, &[("country", "US"), ("city", "Ashburn")]);

    let manager = DatasetManager::new(TextOpener::default(), DatasetPaths::new(&dir));
    manager.open().unwrap();

    let resolution = manager.resolve(ip()).unwrap();
    assert_eq!(
        resolution.general.unwrap().country_code.as_deref(),
        Some("US")
    );
    assert!(resolution.asn.is_none());
}

#[test]
fn open_fails_when_both_mandatory_datasets_are_missing() {
    let (_guard, dir) = test_dir();
    write_dataset(&dir, DatasetKind::RegionalOverride, &[("province", "上海")]);

    let manager = DatasetManager::new(TextOpener::default(), DatasetPaths::new(&dir));
    assert!(matches!(manager.open(), Err(Error::NoDatasetsAvailable)));
    assert!(matches!(
        manager.resolve(ip()),
        Err(Error::NoDatasetsAvailable)
    ));
}

#[test]
fn swap_is_all_or_nothing() {
    let (_guard, dir) = test_dir();
    write_dataset(&dir, DatasetKind::General, &[("country", "US"), ("city", "Ashburn")]);
    write_dataset(&dir, DatasetKind::Asn, &[("asn", "15169"), ("org", "Google")]);

    let manager = DatasetManager::new(TextOpener::default(), DatasetPaths::new(&dir));
    manager.open().unwrap();
    let generation = manager.generation();

    // Corrupt replacement: the swap must fail without touching the live set.
    std::fs::write(dir.join(DatasetKind::General.file_name()), "corrupt").unwrap();
    assert!(matches!(manager.swap(), Err(Error::DatasetOpen { .. })));

    assert_eq!(manager.generation(), generation);
    let resolution = manager.resolve(ip()).unwrap();
    assert_eq!(
        resolution.general.unwrap().city_names.get("en").unwrap(),
        "Ashburn"
    );
}

#[test]
fn swap_publishes_a_complete_new_generation() {
    let (_guard, dir) = test_dir();
    write_dataset(&dir, DatasetKind::General, &[("country", "US"), ("city", "alpha")]);
    write_dataset(&dir, DatasetKind::Asn, &[("asn", "64512"), ("org", "alpha")]);

    let manager = DatasetManager::new(TextOpener::default(), DatasetPaths::new(&dir));
    manager.open().unwrap();
    let before = manager.generation();

    write_dataset(&dir, DatasetKind::General, &[("country", "US"), ("city", "beta")]);
    write_dataset(&dir, DatasetKind::Asn, &[("asn", "64512"), ("org", "beta")]);
    manager.swap().unwrap();

    assert_eq!(manager.generation(), before + 1);
    let resolution = manager.resolve(ip()).unwrap();
    assert_eq!(
        resolution.general.unwrap().city_names.get("en").unwrap(),
        "beta"
    );
    assert_eq!(resolution.asn.unwrap().organization, "beta");
}

#[test]
fn concurrent_resolves_never_observe_a_torn_generation() {
    let (_guard, dir) = test_dir();
    write_dataset(&dir, DatasetKind::General, &[("country", "US"), ("city", "gen0")]);
    write_dataset(&dir, DatasetKind::Asn, &[("asn", "64512"), ("org", "gen0")]);

    let manager = Arc::new(DatasetManager::new(
        TextOpener::default(),
        DatasetPaths::new(&dir),
    ));
    manager.open().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut lookups = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    let resolution = manager.resolve(ip()).unwrap();
                    let city = resolution
                        .general
                        .unwrap()
                        .city_names
                        .get("en")
                        .cloned()
                        .unwrap();
                    let org = resolution.asn.unwrap().organization;
                    // Both answers must come from the same generation.
                    assert_eq!(city, org);
                    lookups += 1;
                }
                lookups
            })
        })
        .collect();

    for generation in 1..200 {
        let label = format!("gen{generation}");
        write_dataset(&dir, DatasetKind::General, &[("country", "US"), ("city", &label)]);
        write_dataset(&dir, DatasetKind::Asn, &[("asn", "64512"), ("org", &label)]);
        manager.swap().unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    let total: usize = readers.into_iter().map(|r| r.join().unwrap()).sum();
    assert!(total > 0, "reader threads never completed a lookup");
}

#[test]
fn regional_override_consulted_only_for_jurisdiction_traffic() {
    let (_guard, dir) = test_dir();
    let opener = TextOpener::default();
    let queries = opener.regional_queries.clone();

    write_dataset(&dir, DatasetKind::General, &[("country", "US"), ("city", "Ashburn")]);
    write_dataset(&dir, DatasetKind::Asn, &[("asn", "15169"), ("org", "Google")]);
    write_dataset(&dir, DatasetKind::RegionalOverride, &[("province", "上海")]);

    let manager = DatasetManager::new(opener, DatasetPaths::new(&dir));
    manager.open().unwrap();

    // Non-jurisdiction traffic must not touch the override dataset.
    let resolution = manager.resolve(ip()).unwrap();
    assert!(resolution.regional.is_none());
    assert_eq!(queries.load(Ordering::SeqCst), 0);

    // Jurisdiction traffic does.
    write_dataset(&dir, DatasetKind::General, &[("country", "CN")]);
    manager.swap().unwrap();
    let resolution = manager.resolve(ip()).unwrap();
    assert_eq!(resolution.regional.unwrap().province, "上海");
    assert_eq!(queries.load(Ordering::SeqCst), 1);
}

#[test]
fn regional_override_consulted_when_general_has_no_answer() {
    let (_guard, dir) = test_dir();
    let opener = TextOpener::default();
    let queries = opener.regional_queries.clone();

    // General dataset opens but has no record for the IP.
    write_dataset(&dir, DatasetKind::General, &[("comment", "no country key")]);
    write_dataset(&dir, DatasetKind::Asn, &[("asn", "4134"), ("org", "Chinanet")]);
    write_dataset(
        &dir,
        DatasetKind::RegionalOverride,
        &[("province", "广东"), ("rcity", "深圳")],
    );

    let manager = DatasetManager::new(opener, DatasetPaths::new(&dir));
    manager.open().unwrap();

    let merged = manager.lookup(ip()).unwrap();
    assert_eq!(queries.load(Ordering::SeqCst), 1);
    assert_eq!(merged.country_code, "CN");
    assert_eq!(merged.city, "深圳");
    assert_eq!(merged.region, "广东");
    assert_eq!(merged.time_zone, "Asia/Shanghai");
    assert_eq!(merged.as_number, Some(4134));
}

#[test]
fn close_drops_the_current_generation() {
    let (_guard, dir) = test_dir();
    write_dataset(&dir, DatasetKind::General, &[("country", "US")]);

    let manager = DatasetManager::new(TextOpener::default(), DatasetPaths::new(&dir));
    manager.open().unwrap();
    assert!(manager.resolve(ip()).is_ok());

    manager.close();
    assert!(matches!(
        manager.resolve(ip()),
        Err(Error::NoDatasetsAvailable)
    ));
}

// --- UpdatePipeline ---

fn seed_mandatory(dir: &Utf8Path) {
    write_dataset(dir, DatasetKind::General, &[("country", "CN")]);
    write_dataset(dir, DatasetKind::Asn, &[("asn", "4134"), ("org", "Chinanet")]);
}

fn pipeline_with(
    dir: &Utf8PathBuf,
    fetcher: ScriptedFetcher,
    jobs: Vec<UpdateJob>,
) -> (Arc<DatasetManager<TextOpener>>, Arc<UpdatePipeline<TextOpener, ScriptedFetcher>>) {
    let manager = Arc::new(DatasetManager::new(
        TextOpener::default(),
        DatasetPaths::new(dir),
    ));
    let pipeline = Arc::new(
        UpdatePipeline::new(
            manager.clone(),
            fetcher,
            jobs,
            dir.clone(),
            Some("test-license-key".to_string()),
        )
        .with_min_size(8),
    );
    (manager, pipeline)
}

#[tokio::test]
async fn pipeline_installs_validates_and_swaps() {
    let (_guard, dir) = test_dir();
    seed_mandatory(&dir);

    let body = fixture(&[("province", "上海"), ("rcity", "上海")]).into_bytes();
    let fetcher = ScriptedFetcher::new(body.clone(), Some("\"v1\""));
    let (manager, pipeline) = pipeline_with(&dir, fetcher, vec![regional_job()]);
    manager.open().unwrap();

    let outcome = pipeline.run_job(&pipeline.jobs()[0]).await.unwrap();
    assert_eq!(outcome, UpdateOutcome::Installed);

    let canonical = dir.join(DatasetKind::RegionalOverride.file_name());
    assert_eq!(std::fs::read(&canonical).unwrap(), body);
    let sidecar = dir.join(format!("{}.etag", DatasetKind::RegionalOverride.file_name()));
    assert_eq!(std::fs::read_to_string(&sidecar).unwrap(), "\"v1\"");

    let merged = manager.lookup(ip()).unwrap();
    assert_eq!(merged.city, "上海");
}

#[tokio::test]
async fn unchanged_upstream_short_circuits_with_zero_writes() {
    let (_guard, dir) = test_dir();
    seed_mandatory(&dir);

    let body = fixture(&[("province", "上海")]).into_bytes();
    let fetcher = ScriptedFetcher::new(body.clone(), Some("\"v1\""));
    let calls = fetcher.calls.clone();
    let (manager, pipeline) = pipeline_with(&dir, fetcher, vec![regional_job()]);
    manager.open().unwrap();

    assert_eq!(
        pipeline.run_job(&pipeline.jobs()[0]).await.unwrap(),
        UpdateOutcome::Installed
    );
    let generation = manager.generation();
    let canonical = dir.join(DatasetKind::RegionalOverride.file_name());
    let installed = std::fs::read(&canonical).unwrap();

    // Second pass advertises the stored token; the origin answers 304.
    assert_eq!(
        pipeline.run_job(&pipeline.jobs()[0]).await.unwrap(),
        UpdateOutcome::UpToDate
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(std::fs::read(&canonical).unwrap(), installed);
    assert_eq!(manager.generation(), generation);
}

#[tokio::test]
async fn suspiciously_small_bodies_leave_canonical_file_unchanged() {
    let (_guard, dir) = test_dir();
    seed_mandatory(&dir);
    let previous = fixture(&[("province", "旧数据")]);
    std::fs::write(dir.join(DatasetKind::RegionalOverride.file_name()), &previous).unwrap();

    let fetcher = ScriptedFetcher::new(b"tiny".to_vec(), None);
    let (manager, pipeline) = pipeline_with(&dir, fetcher, vec![regional_job()]);
    manager.open().unwrap();
    let generation = manager.generation();

    let err = pipeline.run_job(&pipeline.jobs()[0]).await.unwrap_err();
    assert!(matches!(err, Error::SuspiciouslySmall { len: 4, .. }));
    assert_eq!(
        std::fs::read_to_string(dir.join(DatasetKind::RegionalOverride.file_name())).unwrap(),
        previous
    );
    assert_eq!(manager.generation(), generation);
}

#[tokio::test]
async fn markup_bodies_are_rejected() {
    let (_guard, dir) = test_dir();
    seed_mandatory(&dir);

    let mut body = b"<!DOCTYPE html><html><body>502 Bad Gateway</body></html>".to_vec();
    body.resize(256, b' ');
    let fetcher = ScriptedFetcher::new(body, None);
    let (manager, pipeline) = pipeline_with(&dir, fetcher, vec![regional_job()]);
    manager.open().unwrap();

    let err = pipeline.run_job(&pipeline.jobs()[0]).await.unwrap_err();
    assert!(matches!(err, Error::FormatInvalid { .. }));
    assert!(!dir.join(DatasetKind::RegionalOverride.file_name()).exists());
}

#[tokio::test]
async fn archive_member_is_extracted_and_installed() {
    let (_guard, dir) = test_dir();
    seed_mandatory(&dir);

    let dataset = fixture(&[("country", "CN"), ("city", "北京")]);
    let body = targz(&[
        ("GeoLite2-City_20260801/LICENSE.txt", b"legal".as_slice()),
        (
            "GeoLite2-City_20260801/GeoLite2-City.mmdb",
            dataset.as_bytes(),
        ),
    ]);
    let fetcher = ScriptedFetcher::new(body, Some("\"city-v2\""));
    let job = UpdateJob::new(
        DatasetKind::General,
        DatasetSource::Edition {
            edition_id: "GeoLite2-City".to_string(),
        },
    );
    let (manager, pipeline) = pipeline_with(&dir, fetcher, vec![job]);
    manager.open().unwrap();

    let outcome = pipeline.run_job(&pipeline.jobs()[0]).await.unwrap();
    assert_eq!(outcome, UpdateOutcome::Installed);
    assert_eq!(
        std::fs::read_to_string(dir.join(DatasetKind::General.file_name())).unwrap(),
        dataset
    );

    let merged = manager.lookup(ip()).unwrap();
    assert_eq!(merged.city, "北京");
}

#[tokio::test]
async fn archive_without_dataset_member_is_rejected() {
    let (_guard, dir) = test_dir();
    seed_mandatory(&dir);
    let previous = std::fs::read(dir.join(DatasetKind::General.file_name())).unwrap();

    let body = targz(&[("release-notes.txt", b"nothing useful".as_slice())]);
    let fetcher = ScriptedFetcher::new(body, None);
    let job = UpdateJob::new(
        DatasetKind::General,
        DatasetSource::Edition {
            edition_id: "GeoLite2-City".to_string(),
        },
    );
    let (manager, pipeline) = pipeline_with(&dir, fetcher, vec![job]);
    manager.open().unwrap();

    let err = pipeline.run_job(&pipeline.jobs()[0]).await.unwrap_err();
    assert!(matches!(err, Error::MemberNotFound { .. }));
    assert_eq!(
        std::fs::read(dir.join(DatasetKind::General.file_name())).unwrap(),
        previous
    );
}

#[tokio::test]
async fn unopenable_staged_dataset_is_rejected_before_install() {
    let (_guard, dir) = test_dir();
    seed_mandatory(&dir);
    let previous = fixture(&[("province", "旧数据")]);
    std::fs::write(dir.join(DatasetKind::RegionalOverride.file_name()), &previous).unwrap();

    // "corrupt\n" passes the size and markup checks but the opener
    // refuses it, which is the authoritative validation.
    let fetcher = ScriptedFetcher::new(b"corrupt\n".to_vec(), None);
    let (manager, pipeline) = pipeline_with(&dir, fetcher, vec![regional_job()]);
    manager.open().unwrap();

    let err = pipeline.run_job(&pipeline.jobs()[0]).await.unwrap_err();
    assert!(matches!(err, Error::DatasetInvalid { .. }));
    assert_eq!(
        std::fs::read_to_string(dir.join(DatasetKind::RegionalOverride.file_name())).unwrap(),
        previous
    );
}

// --- Scheduler ---

#[tokio::test]
async fn bootstrap_runs_only_when_datasets_are_missing() {
    let (_guard, dir) = test_dir();
    seed_mandatory(&dir);

    let body = fixture(&[("province", "上海")]).into_bytes();
    let fetcher = ScriptedFetcher::new(body, None);
    let calls = fetcher.calls.clone();
    let (manager, pipeline) = pipeline_with(&dir, fetcher, vec![regional_job()]);
    manager.open().unwrap();
    let scheduler = Scheduler::new(pipeline, Duration::from_secs(3600));

    assert!(scheduler.bootstrap().await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(dir.join(DatasetKind::RegionalOverride.file_name()).exists());

    // Everything present now: the second bootstrap is a no-op.
    assert!(!scheduler.bootstrap().await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn scheduler_fires_on_interval_and_stops_on_cancel() {
    let (_guard, dir) = test_dir();
    seed_mandatory(&dir);
    write_dataset(&dir, DatasetKind::RegionalOverride, &[("province", "上海")]);

    let body = fixture(&[("province", "上海")]).into_bytes();
    let fetcher = ScriptedFetcher::new(body, None);
    let calls = fetcher.calls.clone();
    let (manager, pipeline) = pipeline_with(&dir, fetcher, vec![regional_job()]);
    manager.open().unwrap();

    let interval = Duration::from_secs(3600);
    let scheduler = Scheduler::new(pipeline, interval);
    let cancel = CancellationToken::new();
    let worker = tokio::spawn(scheduler.run(cancel.clone()));

    // Nothing fires before the first full interval elapses.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(interval).await;
    assert!(calls.load(Ordering::SeqCst) >= 1);

    cancel.cancel();
    worker.await.unwrap();
}
