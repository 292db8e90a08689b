//! Configuration loading and validation.
//!
//! Settings come from a TOML file found at `--config`, then
//! `$XDG_CONFIG_HOME/interlend/config.toml`, then
//! `~/.config/interlend/config.toml`. A missing file is not an error: the
//! defaults describe a working single-instance setup with no remote sources.
//! Out-of-range values fail fast at startup; a sync engine that silently
//! "fixed" a zero page size would loop forever instead.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

/// Environment variable holding extra skip-list entries, comma separated.
pub const SKIP_JOBS_ENV: &str = "INTERLEND_SKIP_JOBS";

/// Top-level configuration file contents.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Core sync engine knobs.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Request throttling.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Job cadences and shutdown behavior.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Availability recheck tuning.
    #[serde(default)]
    pub recheck: RecheckConfig,

    /// Host systems to sync from.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Records per fetched page. Page length against this value is how the
    /// engine detects exhaustion, so it must be positive.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Attempts per request before a transient failure becomes fatal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl EngineConfig {
    /// Request timeout as a duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConcurrencyConfig {
    /// Concurrent requests per source.
    #[serde(default = "default_per_source")]
    pub per_source: usize,

    /// Instance-wide request cap. Zero derives it from the host's
    /// parallelism.
    #[serde(default)]
    pub instance_wide: usize,

    /// Pause between request windows against the same source, milliseconds.
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    /// Items per write batch.
    #[serde(default = "default_write_batch")]
    pub write_batch: usize,

    /// Concurrent writes within a batch.
    #[serde(default = "default_write_concurrency")]
    pub write_concurrency: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            per_source: default_per_source(),
            instance_wide: 0,
            pacing_ms: default_pacing_ms(),
            write_batch: default_write_batch(),
            write_concurrency: default_write_concurrency(),
        }
    }
}

impl ConcurrencyConfig {
    /// Pacing delay as a duration.
    #[must_use]
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Seconds between harvest triggers.
    #[serde(default = "default_harvest_period_secs")]
    pub harvest_period_secs: u64,

    /// Seconds before the first harvest trigger.
    #[serde(default = "default_harvest_initial_delay_secs")]
    pub harvest_initial_delay_secs: u64,

    /// Seconds between availability recheck triggers.
    #[serde(default = "default_recheck_period_secs")]
    pub recheck_period_secs: u64,

    /// Seconds before the first recheck trigger.
    #[serde(default = "default_recheck_initial_delay_secs")]
    pub recheck_initial_delay_secs: u64,

    /// How long shutdown waits for in-flight runs to reach a chunk boundary.
    #[serde(default = "default_shutdown_wait_secs")]
    pub shutdown_wait_secs: u64,

    /// Run lease lifetime in seconds. Must comfortably exceed the longest
    /// expected run, or another instance will take over mid-run.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Job names to skip without removing them from the schedule.
    #[serde(default)]
    pub skip_jobs: Vec<String>,

    /// Local hours during which off-peak jobs are held back.
    #[serde(default)]
    pub office_hours: Option<OfficeHoursConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            harvest_period_secs: default_harvest_period_secs(),
            harvest_initial_delay_secs: default_harvest_initial_delay_secs(),
            recheck_period_secs: default_recheck_period_secs(),
            recheck_initial_delay_secs: default_recheck_initial_delay_secs(),
            shutdown_wait_secs: default_shutdown_wait_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            skip_jobs: Vec::new(),
            office_hours: None,
        }
    }
}

impl SchedulerConfig {
    /// Skip list from the file plus the environment override, as a set.
    #[must_use]
    pub fn skip_set(&self) -> HashSet<String> {
        let mut set: HashSet<String> = self.skip_jobs.iter().cloned().collect();
        if let Ok(extra) = std::env::var(SKIP_JOBS_ENV) {
            set.extend(
                extra
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
        }
        set
    }
}

/// Office hours as `[start_hour, end_hour)` local time. A start past the end
/// wraps around midnight.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OfficeHoursConfig {
    pub start_hour: u8,
    pub end_hour: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecheckConfig {
    /// How old a snapshot may get before the sweep refreshes it, in hours.
    #[serde(default = "default_grace_period_hours")]
    pub grace_period_hours: u64,
}

impl Default for RecheckConfig {
    fn default() -> Self {
        Self {
            grace_period_hours: default_grace_period_hours(),
        }
    }
}

impl RecheckConfig {
    /// Grace period as a duration.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_hours * 3600)
    }
}

/// Which adapter implementation serves a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Sierra,
    Polaris,
    Synthetic,
}

impl SourceKind {
    /// Configuration-file form of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sierra => "sierra",
            Self::Polaris => "polaris",
            Self::Synthetic => "synthetic",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One host system entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub kind: SourceKind,

    /// Short unique name, used in logs, job names, and stored records.
    pub system_id: String,

    /// Owning context id the source's checkpoints are keyed under.
    pub owner_id: Uuid,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// API base URL, required for remote kinds.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Client key for Sierra token auth.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Client secret. Sierra pairs it with `api_key`, Polaris signs with it.
    #[serde(default)]
    pub api_secret: Option<String>,

    /// Access id for Polaris signed requests.
    #[serde(default)]
    pub access_id: Option<String>,

    /// Catalogue size for the synthetic kind.
    #[serde(default)]
    pub total_records: Option<u64>,
}

impl FileConfig {
    /// Loads configuration from `path`, or from the default location when
    /// `path` is `None`. A missing file yields the built-in defaults.
    ///
    /// # Errors
    ///
    /// Fails when the file exists but cannot be read or parsed, or when the
    /// parsed configuration does not validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let resolved = match path {
            Some(explicit) => Some(explicit.to_path_buf()),
            None => Self::default_path(),
        };

        let config = match resolved {
            Some(file) if file.exists() => {
                info!(path = %file.display(), "loading configuration");
                let raw = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("failed to parse {}", file.display()))?
            }
            Some(file) => {
                debug!(path = %file.display(), "no configuration file, using defaults");
                Self::default()
            }
            None => {
                debug!("no home directory, using default configuration");
                Self::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// `$XDG_CONFIG_HOME/interlend/config.toml`, falling back to
    /// `~/.config/interlend/config.toml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .filter(|p| !p.as_os_str().is_empty())
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
        Some(base.join("interlend").join("config.toml"))
    }

    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.engine.page_size == 0 {
            bail!("engine.page_size must be positive");
        }
        if self.engine.request_timeout_secs == 0 {
            bail!("engine.request_timeout_secs must be positive");
        }
        if self.engine.max_attempts == 0 {
            bail!("engine.max_attempts must be positive");
        }
        if self.scheduler.harvest_period_secs == 0 {
            bail!("scheduler.harvest_period_secs must be positive");
        }
        if self.scheduler.recheck_period_secs == 0 {
            bail!("scheduler.recheck_period_secs must be positive");
        }
        if self.scheduler.lock_ttl_secs == 0 {
            bail!("scheduler.lock_ttl_secs must be positive");
        }
        if let Some(hours) = &self.scheduler.office_hours {
            if hours.start_hour > 23 {
                bail!("scheduler.office_hours.start_hour must be 0-23");
            }
            if hours.end_hour > 24 {
                bail!("scheduler.office_hours.end_hour must be 0-24");
            }
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.system_id.trim().is_empty() {
                bail!("sources entries must have a non-empty system_id");
            }
            if !seen.insert(source.system_id.as_str()) {
                bail!("duplicate source system_id {:?}", source.system_id);
            }
        }

        Ok(())
    }

    /// Resolved instance-wide request cap.
    #[must_use]
    pub fn instance_cap(&self) -> usize {
        if self.concurrency.instance_wide == 0 {
            crate::dispatch::ThrottledDispatcher::auto_instance_cap()
        } else {
            self.concurrency.instance_wide
        }
    }
}

// ==================== Defaults ====================

fn default_page_size() -> u32 {
    100
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_per_source() -> usize {
    2
}

fn default_pacing_ms() -> u64 {
    1_000
}

fn default_write_batch() -> usize {
    15
}

fn default_write_concurrency() -> usize {
    3
}

fn default_harvest_period_secs() -> u64 {
    120
}

fn default_harvest_initial_delay_secs() -> u64 {
    10
}

fn default_recheck_period_secs() -> u64 {
    3_600
}

fn default_recheck_initial_delay_secs() -> u64 {
    60
}

fn default_shutdown_wait_secs() -> u64 {
    30
}

fn default_lock_ttl_secs() -> u64 {
    600
}

fn default_grace_period_hours() -> u64 {
    24
}

fn default_true() -> bool {
    true
}
