//! Config module for ninova-archiver

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use bytesize::ByteSize;
use clap::Parser;
use thiserror::Error;
use url::Url;

const LAST_DIR_FILE: &str = "last_dir";
const APP_DIR: &str = "ninova-archiver";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no target directory given, pass --directory or set NINOVA_DIR")]
    MissingDirectory,
    #[error("'{0}' is not an existing directory")]
    InvalidDirectory(PathBuf),
}

#[derive(Parser, Debug, Clone)]
pub struct PortalConfig {
    /// Root URL of the course portal
    #[clap(long, env = "NINOVA_BASE_URL", default_value = "https://ninova.itu.edu.tr")]
    pub base_url: Url,

    /// Portal user name (without the mail domain)
    #[clap(short, long, env = "NINOVA_USERNAME")]
    pub username: String,

    #[clap(short, long, env = "NINOVA_PASSWORD", hide_env_values = true)]
    pub password: String,
}

#[derive(Parser, Debug, Clone)]
pub struct FetchConfig {
    /// How many times a file or page request is attempted before giving up
    #[clap(long, env = "NINOVA_RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,

    /// Fixed wait between two attempts
    #[clap(long, env = "NINOVA_RETRY_DELAY_SECS", default_value_t = 5)]
    pub retry_delay_secs: u64,

    /// Files declared larger than this are downloaded in their own worker
    #[clap(long, env = "NINOVA_LARGE_FILE_THRESHOLD", default_value = "5MiB")]
    pub large_file_threshold: ByteSize,

    #[clap(long, env = "NINOVA_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    #[clap(long, env = "NINOVA_READ_TIMEOUT_SECS", default_value_t = 60)]
    pub read_timeout_secs: u64,

    /// Upper bound of worker units running at the same time
    #[clap(long, env = "NINOVA_MAX_CONCURRENCY", default_value_t = 16)]
    pub max_concurrency: usize,
}

impl FetchConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Parser, Debug, Clone)]
#[clap(name = "ninova-archiver", version, about)]
pub struct Config {
    /// Archive root; defaults to the directory used by the previous run
    #[clap(short, long, env = "NINOVA_DIR")]
    pub directory: Option<PathBuf>,

    /// Ignore the record store and re-derive everything from scratch
    #[clap(long, env = "NINOVA_FORCE")]
    pub force: bool,

    #[clap(long, env = "NINOVA_DEBUG")]
    pub debug: bool,

    #[clap(long, env = "NINOVA_VERBOSE")]
    pub verbose: bool,

    /// Courses to archive, by index or course code (all when empty)
    #[clap(long, env = "NINOVA_COURSES", value_delimiter = ',')]
    pub courses: Vec<String>,

    /// Print the enrolled courses and exit
    #[clap(long)]
    pub list_courses: bool,

    /// Where unrecognised pages are dumped for inspection
    #[clap(long, env = "NINOVA_DEBUG_DIR", default_value = "debug_output")]
    pub debug_dir: PathBuf,

    #[clap(flatten)]
    pub portal: PortalConfig,

    #[clap(flatten)]
    pub fetch: FetchConfig,
}

impl Config {
    /// Pin the archive root, falling back to the remembered directory.
    pub fn resolve(mut self) -> Result<Self, ConfigError> {
        let directory = self
            .directory
            .take()
            .or_else(remembered_directory)
            .ok_or(ConfigError::MissingDirectory)?;

        if !directory.is_dir() {
            return Err(ConfigError::InvalidDirectory(directory));
        }

        if let Err(e) = remember_directory(&directory) {
            tracing::warn!(error = %e, "Failed to remember the selected directory");
        }

        self.directory = Some(directory);
        Ok(self)
    }

    pub fn archive_root(&self) -> &Path {
        self.directory.as_deref().unwrap_or(Path::new("."))
    }

    /// Filter directive used when `RUST_LOG` is not set
    pub fn log_level(&self) -> &'static str {
        if self.debug {
            "trace"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

fn last_dir_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(LAST_DIR_FILE))
}

fn remembered_directory() -> Option<PathBuf> {
    let path = last_dir_path()?;
    let contents = std::fs::read_to_string(path).ok()?;
    let trimmed = contents.trim();
    (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
}

fn remember_directory(directory: &Path) -> std::io::Result<()> {
    let Some(path) = last_dir_path() else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, directory.to_string_lossy().as_bytes())
}

#[cfg(test)]
impl Config {
    /// Configuration pointed at a mock portal with instant retries
    pub fn for_tests(root: &Path, base_url: &str) -> Self {
        let root = root.to_string_lossy().into_owned();
        let mut config = Config::parse_from([
            "ninova-archiver",
            "--directory",
            root.as_str(),
            "--base-url",
            base_url,
            "--username",
            "student",
            "--password",
            "secret",
            "--retry-delay-secs",
            "0",
        ]);
        config.debug_dir = config.archive_root().join("debug_output");
        config
    }
}
