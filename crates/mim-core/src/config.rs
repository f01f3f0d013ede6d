//! Global configuration loaded from `~/.config/mim/config.toml`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Hard cap the outbound platform places on one album message.
pub const PLATFORM_ALBUM_CAP: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Outbound recipient handle albums are delivered to.
    pub target: String,
    /// Reject inbound archives larger than this many bytes (0 = no limit).
    pub max_archive_size: u64,
    /// Pause archive expansion when free disk drops below this many bytes.
    pub free_space_floor: u64,
    /// Maximum items per outbound album; clamped to the platform cap.
    pub album_size_cap: usize,
    /// Seconds between advisory in-flight snapshots.
    pub snapshot_interval: u64,
    pub stage_concurrency: StageConcurrency,
    pub fetch: FetchConfig,
    pub retry: RetryConfig,
    pub transcode: TranscodeConfig,
    pub conversion: ConversionConfig,
    pub admission: AdmissionConfig,
    pub progress: ProgressConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConcurrency {
    pub download: usize,
    pub upload: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// HTTP streaming chunk size in bytes.
    pub chunk_size: usize,
    /// Seconds with no bytes received before a stream is declared stalled.
    pub inactivity_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Generic retry budget per task.
    pub max_attempts: u32,
    /// Base for the exponential backoff schedule, in seconds.
    pub base_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Toggles inline normalization; incompatible media defers when off.
    pub enabled: bool,
    /// Bound on encoder runtime, in seconds.
    pub timeout: u64,
    /// Incompatible videos longer than this defer instead of converting inline.
    pub inline_max_duration_secs: f64,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Deferred conversion retry cap.
    pub max_retries: u32,
    /// Seconds between ledger writes while a conversion runs.
    pub state_save_interval: u64,
    /// Completed ledger entries older than this many seconds are swept.
    pub completed_ttl: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// When set, the download stage admits work only while on wifi.
    pub wifi_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Minimum whole-percent step between progress events.
    pub min_percent_step: u8,
    /// Minimum seconds between progress events.
    pub min_interval_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            target: String::from("me"),
            max_archive_size: 4 * 1024 * 1024 * 1024,
            free_space_floor: 512 * 1024 * 1024,
            album_size_cap: PLATFORM_ALBUM_CAP,
            snapshot_interval: 60,
            stage_concurrency: StageConcurrency::default(),
            fetch: FetchConfig::default(),
            retry: RetryConfig::default(),
            transcode: TranscodeConfig::default(),
            conversion: ConversionConfig::default(),
            admission: AdmissionConfig::default(),
            progress: ProgressConfig::default(),
        }
    }
}

impl Default for StageConcurrency {
    fn default() -> Self {
        Self { download: 1, upload: 1 }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            inactivity_timeout: 90,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_seconds: 5,
        }
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: 1800,
            inline_max_duration_secs: 300.0,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
        }
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            state_save_interval: 10,
            completed_ttl: 24 * 3600,
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { wifi_only: false }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_percent_step: 5,
            min_interval_secs: 3,
        }
    }
}

impl IngestConfig {
    /// Clamp knobs the platform bounds. Returns self for chaining.
    pub fn clamped(mut self) -> Self {
        if self.album_size_cap > PLATFORM_ALBUM_CAP {
            tracing::warn!(
                requested = self.album_size_cap,
                cap = PLATFORM_ALBUM_CAP,
                "album_size_cap exceeds the platform cap; clamping"
            );
            self.album_size_cap = PLATFORM_ALBUM_CAP;
        }
        if self.album_size_cap == 0 {
            self.album_size_cap = 1;
        }
        if self.stage_concurrency.download == 0 {
            self.stage_concurrency.download = 1;
        }
        if self.stage_concurrency.upload == 0 {
            self.stage_concurrency.upload = 1;
        }
        self
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("mim")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<IngestConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = IngestConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: IngestConfig = toml::from_str(&data)?;
    Ok(cfg.clamped())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = IngestConfig::default();
        assert_eq!(cfg.album_size_cap, 10);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.fetch.chunk_size, 256 * 1024);
        assert_eq!(cfg.conversion.state_save_interval, 10);
        assert!(!cfg.admission.wifi_only);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = IngestConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: IngestConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.album_size_cap, cfg.album_size_cap);
        assert_eq!(parsed.fetch.inactivity_timeout, cfg.fetch.inactivity_timeout);
        assert_eq!(parsed.transcode.timeout, cfg.transcode.timeout);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml = r#"
            album_size_cap = 6

            [fetch]
            chunk_size = 65536
        "#;
        let cfg: IngestConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.album_size_cap, 6);
        assert_eq!(cfg.fetch.chunk_size, 65536);
        // Untouched sections keep defaults.
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.snapshot_interval, 60);
    }

    #[test]
    fn album_cap_clamps_to_platform() {
        let toml = "album_size_cap = 50";
        let cfg: IngestConfig = toml::from_str(toml).unwrap();
        let cfg = cfg.clamped();
        assert_eq!(cfg.album_size_cap, PLATFORM_ALBUM_CAP);
    }
}
