mod archive;
mod config;
mod db;
mod downloader;
mod portal;
mod sanitize;
mod scrape;
mod util;

#[cfg(test)]
mod test_support;

use std::{sync::Arc, time::Instant};

use clap::Parser;
use color_eyre::{Section, eyre::WrapErr};
use tracing_subscriber::{EnvFilter, fmt::time::ChronoLocal};

use archive::Archiver;
use config::Config;
use db::{DATABASE_FILE_NAME, RecordStore, StoreError};
use portal::{PortalError, Session};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    let config = Config::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ninova_archiver={}", config.log_level())));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .init();

    let config = Arc::new(config.resolve()?);
    let started = Instant::now();
    tracing::info!(dir = ?config.archive_root(), force = config.force, "Starting archive run");

    let store = match RecordStore::open(config.archive_root(), config.force) {
        Ok(store) => Arc::new(store),
        Err(e @ StoreError::Corrupt(_)) => {
            return Err(e).suggestion(format!(
                "Delete '{DATABASE_FILE_NAME}' in the archive directory to force a full re-download"
            ));
        }
        Err(e) => return Err(e).wrap_err("Failed to open the record store"),
    };

    let session = Session::new(config.portal.base_url.clone(), &config.fetch)?;
    tracing::debug!(portal = %session.base_url(), "Logging in");
    match session.login(&config.portal.username, &config.portal.password).await {
        Ok(()) => {}
        Err(e @ PortalError::InvalidCredentials) => {
            return Err(e).suggestion("Check the user name and password, then try again");
        }
        Err(e) => return Err(e).wrap_err("Failed to log in to the portal"),
    }

    let available = portal::enumerate_courses(&session).await?;
    if config.list_courses {
        for (index, course) in available.iter().enumerate() {
            println!("{index:>3}  {course}");
        }
        return Ok(());
    }

    let courses = portal::select_courses(&available, &config.courses);
    if courses.is_empty() {
        tracing::warn!("No course selected, nothing to archive");
        return Ok(());
    }
    tracing::info!(count = courses.len(), "Courses selected");

    let archiver = Archiver::new(config.clone(), session, store.clone());
    let summary = match archiver.run(&courses).await {
        Ok(summary) => summary,
        Err(e) => {
            return Err(e).wrap_err("Archive run aborted").suggestion(format!(
                "Nothing was recorded for this run. If the error persists, delete '{DATABASE_FILE_NAME}' to force a full re-download"
            ));
        }
    };

    let report = store.flush().wrap_err("Failed to record the downloaded files")?;

    tracing::info!(%summary, "Archive run finished");
    tracing::info!(
        recorded = report.recorded,
        missing = report.missing,
        elapsed = ?started.elapsed(),
        "Done"
    );
    Ok(())
}
