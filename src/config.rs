use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 250;
pub const DEFAULT_SETTLE_BUDGET_MS: u64 = 3000;
pub const DEFAULT_POLL_INTERVAL_US: u64 = 100;
pub const DEFAULT_MATCH_THRESHOLD: u8 = 95;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, serde_yaml::Error),
}

/// Everything the monitor knows about the spawner service it watches.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpawnerConfig {
    /// Command names a spawner instance runs under.
    pub names: Vec<String>,
    /// Pre-warmed helper pool names, part of the spawner family but
    /// never spawner instances themselves.
    pub helper_names: Vec<String>,
    /// Security context of a spawner instance.
    pub context: String,
    /// Context marker of a pre-warmed application spawner.
    pub app_spawner_marker: String,
    /// Command name a child carries until its relaunch completes.
    pub sentinel: String,
    /// Spawner executable paths, one per process-architecture
    /// personality. Only existing ones are watched.
    pub executables: Vec<PathBuf>,
    /// Spawner instances to find before periodic scanning stops.
    pub expected_count: usize,
}

impl SpawnerConfig {
    #[inline]
    pub fn is_spawner_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    #[inline]
    pub fn is_spawner_family(&self, name: &str) -> bool {
        self.is_spawner_name(name) || self.helper_names.iter().any(|n| n == name)
    }

    pub fn existing_executables(&self) -> Vec<PathBuf> {
        self.executables
            .iter()
            .filter(|p| p.exists())
            .cloned()
            .collect()
    }
}

fn default_expected_count() -> usize {
    // one spawner per supported personality
    if cfg!(target_pointer_width = "64") {
        2
    } else {
        1
    }
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            names: vec!["zygote".into(), "zygote32".into(), "zygote64".into()],
            helper_names: vec!["usap32".into(), "usap64".into()],
            context: "u:r:zygote:s0".into(),
            app_spawner_marker: "u:r:app_zygote:s0".into(),
            sentinel: "<pre-initialized>".into(),
            executables: vec![
                "/system/bin/app_process32".into(),
                "/system/bin/app_process64".into(),
                "/system/bin/app_process".into(),
            ],
            expected_count: default_expected_count(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchConfig {
    /// Directory holding the package metadata file.
    pub packages_dir: PathBuf,
    /// Metadata file name whose close-write triggers a uid-map refresh.
    pub packages_file: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            packages_dir: "/data/system".into(),
            packages_file: "packages.xml".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollConfig {
    pub scan_interval_ms: u64,
    /// Time budget for waiting on a child to settle (relaunch or
    /// pre-initialization completing).
    pub settle_budget_ms: u64,
    pub poll_interval_us: u64,
}

impl PollConfig {
    #[inline]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    #[inline]
    pub fn settle_budget(&self) -> Duration {
        Duration::from_millis(self.settle_budget_ms)
    }

    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: DEFAULT_SCAN_INTERVAL_MS,
            settle_budget_ms: DEFAULT_SETTLE_BUDGET_MS,
            poll_interval_us: DEFAULT_POLL_INTERVAL_US,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HideConfig {
    /// Match confidence threshold handed to the hide-target matcher.
    pub threshold: u8,
    /// Command names the built-in static backend treats as targets.
    pub targets: Vec<String>,
}

impl Default for HideConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            targets: vec![],
        }
    }
}

/// Monitor configuration to be used in userland
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub spawner: SpawnerConfig,
    pub watch: WatchConfig,
    pub poll: PollConfig,
    pub hide: HideConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let s = fs::read_to_string(path).map_err(|e| Error::Read(path.to_path_buf(), e))?;
        serde_yaml::from_str(&s).map_err(|e| Error::Parse(path.to_path_buf(), e))
    }
}
