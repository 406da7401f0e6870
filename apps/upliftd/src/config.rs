//! Daemon configuration.
//!
//! Configuration is stored as TOML:
//! - `$UPLIFTD_CONFIG` when set
//! - Linux: `~/.config/uplift/upliftd.toml`
//! - Windows: `%APPDATA%/uplift/upliftd.toml`
//!
//! Every field has a default, so partial files load.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uplift_dedup::DetectorOptions;
use uplift_manager::{ManagerConfig, RetryPolicy};
use uplift_protocol::DuplicateAction;
use uplift_transfer::{
    DEFAULT_MULTIPART_THRESHOLD, DEFAULT_PART_SIZE, HttpStoreConfig, SigningMode, TransferOptions,
};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "UPLIFTD_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub transfer: TransferSection,
    #[serde(default)]
    pub manager: ManagerSection,
    #[serde(default)]
    pub throttle: ThrottleSection,
    #[serde(default)]
    pub control: ControlSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub paths: PathsSection,
}

/// How requests to the store are authorized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signing {
    #[default]
    Query,
    Header,
}

impl From<Signing> for SigningMode {
    fn from(signing: Signing) -> Self {
        match signing {
            Signing::Query => SigningMode::Query,
            Signing::Header => SigningMode::Header,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub endpoint: String,
    pub region: String,
    /// Address buckets as `/bucket/key`.
    pub path_style: bool,
    pub signing: Signing,
    /// Send a SHA-256 checksum with every part.
    pub part_checksums: bool,
    pub request_timeout_secs: u64,
    pub presign_expiry_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            endpoint: "https://s3.us-east-1.amazonaws.com".into(),
            region: "us-east-1".into(),
            path_style: false,
            signing: Signing::Query,
            part_checksums: false,
            request_timeout_secs: 120,
            presign_expiry_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    /// Values above 64 MiB are clamped.
    pub multipart_threshold: u64,
    pub part_size: u64,
    /// Parts in flight per job.
    pub part_concurrency: usize,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
            part_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSection {
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub duplicate_action: DuplicateAction,
    /// HEAD the destination key while preparing.
    pub check_remote: bool,
    pub retain_finished: usize,
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            duplicate_action: DuplicateAction::default(),
            check_remote: true,
            retain_finished: 200,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleSection {
    /// Process-wide cap (0 = unlimited).
    pub bytes_per_sec: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSection {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 47800,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsSection {
    /// Bucket for `upload` requests that name none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    pub key_prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    /// Directory for resume records and history. Defaults to a `state`
    /// directory next to the config file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<(Self, PathBuf)> {
        let path = config_path();
        let config = Self::load_from(&path)?;
        Ok((config, path))
    }

    /// Loads `path`, writing the defaults there first if it is missing.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;

        // Restrict permissions on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// State directory, resolved against the config file location.
    pub fn state_dir(&self, config_file: &Path) -> PathBuf {
        match &self.paths.state_dir {
            Some(dir) => dir.clone(),
            None => config_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default()
                .join("state"),
        }
    }

    pub fn store_config(&self) -> HttpStoreConfig {
        HttpStoreConfig {
            endpoint: self.store.endpoint.clone(),
            region: self.store.region.clone(),
            path_style: self.store.path_style,
            signing: self.store.signing.into(),
            presign_expiry: Duration::from_secs(self.store.presign_expiry_secs),
            request_timeout: Duration::from_secs(self.store.request_timeout_secs),
        }
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions::default()
            .with_multipart_threshold(self.transfer.multipart_threshold)
            .with_part_size(self.transfer.part_size)
            .with_part_concurrency(self.transfer.part_concurrency)
            .with_request_timeout(Duration::from_secs(self.store.request_timeout_secs))
            .with_part_checksums(self.store.part_checksums)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        let m = &self.manager;
        ManagerConfig::default()
            .with_max_concurrent(m.max_concurrent)
            .with_retry(RetryPolicy {
                max_attempts: m.max_attempts.max(1),
                base_delay: Duration::from_millis(m.base_delay_ms),
                max_delay: Duration::from_millis(m.max_delay_ms),
            })
            .with_duplicate_action(m.duplicate_action)
            .with_retain_finished(m.retain_finished)
    }

    pub fn detector_options(&self) -> DetectorOptions {
        DetectorOptions::default().with_check_remote(self.manager.check_remote)
    }
}

/// Returns the configuration file path.
fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    config_base_dir().join("uplift").join("upliftd.toml")
}

fn config_base_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata)
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config")
    }
}
