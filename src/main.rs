use std::fs;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ipgeod::config::{self, Config};
use ipgeod::dataset::{DatasetPaths, MmdbOpener};
use ipgeod::fetch::HttpFetcher;
use ipgeod::scheduler::Scheduler;
use ipgeod::update::UpdatePipeline;
use ipgeod::DatasetManager;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Directory where dataset files and change-token sidecars are stored
    #[clap(
        short = 'd',
        long,
        value_name = "DIR",
        default_value = config::DEFAULT_DATA_DIR,
        value_hint = clap::ValueHint::DirPath
    )]
    data_dir: Utf8PathBuf,

    /// Hours between scheduled update checks
    #[clap(long, value_name = "HOURS", default_value_t = config::DEFAULT_UPDATE_INTERVAL_HOURS)]
    update_interval: u64,

    /// Overall timeout for a single dataset download, in seconds
    #[clap(long, value_name = "SECS", default_value_t = config::DEFAULT_HTTP_TIMEOUT_SECS)]
    http_timeout: u64,

    /// MaxMind license key used for GeoLite2 edition downloads
    #[clap(long, value_name = "KEY", env = "MAXMIND_LICENSE_KEY", hide_env_values = true)]
    license_key: Option<String>,

    /// Resolve a single IP address, print the merged record as JSON, and
    /// exit instead of running the update daemon
    #[clap(long, value_name = "IP")]
    lookup: Option<IpAddr>,
}

impl Args {
    fn into_config(self) -> (Config, Option<IpAddr>) {
        let config = Config {
            data_dir: self.data_dir,
            update_interval: Duration::from_secs(self.update_interval * 60 * 60),
            http_timeout: Duration::from_secs(self.http_timeout),
            license_key: self.license_key,
        };
        (config, self.lookup)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (config, lookup) = Args::parse().into_config();

    fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data directory {}", config.data_dir))?;

    let paths = DatasetPaths::new(&config.data_dir);
    let manager = Arc::new(DatasetManager::new(MmdbOpener, paths));

    let fetcher = HttpFetcher::new(config.http_timeout)?;
    let pipeline = Arc::new(UpdatePipeline::new(
        manager.clone(),
        fetcher,
        config::default_jobs(),
        config.data_dir.clone(),
        config.license_key.clone(),
    ));
    let scheduler = Scheduler::new(pipeline, config.update_interval);

    // First-run bootstrap is synchronous: nothing is served until the
    // missing datasets have either downloaded or conclusively failed.
    scheduler.bootstrap().await;
    manager
        .open()
        .context("could not open any mandatory geo dataset")?;

    if let Some(ip) = lookup {
        let record = manager.lookup(ip)?;
        println!("{}", serde_json::to_string_pretty(&record)?);
        manager.close();
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let updater = tokio::spawn(scheduler.run(cancel.clone()));

    info!("ipgeod running; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutting down");
    cancel.cancel();
    if let Err(err) = updater.await {
        warn!(error = %err, "update scheduler task did not stop cleanly");
    }
    manager.close();

    Ok(())
}
