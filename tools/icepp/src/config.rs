//! icepp settings
//!
//! Loaded through `ice_common::config::load_config`: defaults, then an
//! optional settings file, then `ICEPP_` environment variables. Command line
//! flags are applied last by the caller.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ice_common::LogConfig;
use ice_model::time::parse_month;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix, `ICEPP_LOG__LEVEL=debug` sets `log.level`
pub const ENV_PREFIX: &str = "ICEPP_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IceppConfig {
    /// User tag keys expected in the data set, in column order
    pub user_tag_keys: Vec<String>,
    /// Month to process, `yyyy-MM`
    pub month: Option<String>,
    /// Allocation worker threads, 0 runs on the main thread
    pub threads: usize,
    /// Directory holding allocation and Kubernetes reports
    pub report_dir: PathBuf,
    /// Directory receiving processed output
    pub output_dir: PathBuf,
    /// Directory receiving archived generated allocation reports
    pub archive_dir: Option<PathBuf>,
    pub log: LogConfig,
}

impl Default for IceppConfig {
    fn default() -> Self {
        Self {
            user_tag_keys: Vec::new(),
            month: None,
            threads: 0,
            report_dir: PathBuf::from("reports"),
            output_dir: PathBuf::from("out"),
            archive_dir: None,
            log: LogConfig::default(),
        }
    }
}

impl IceppConfig {
    pub fn load(file: Option<&Path>) -> Result<Self> {
        ice_common::config::load_config(file, ENV_PREFIX).context("Unable to load icepp settings")
    }

    /// Start of the month to process
    pub fn period(&self) -> Result<DateTime<Utc>> {
        let month = self
            .month
            .as_deref()
            .context("No month given, use --month or set month in the settings file")?;
        parse_month(month).with_context(|| format!("Invalid month \"{}\"", month))
    }

    /// Resolve an output file name against the output directory
    pub fn output_path(&self, name: &Path) -> PathBuf {
        if name.is_absolute() {
            name.to_path_buf()
        } else {
            self.output_dir.join(name)
        }
    }
}
