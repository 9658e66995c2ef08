//! Harness Configuration
//!
//! Settings for every stage of an emulator lifecycle:
//! - Android SDK location
//! - Emulator launch options
//! - Boot wait and console timing
//! - Port ranges and output capture

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{HarnessError, Result};

/// Android SDK configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AndroidConfig {
    /// Path to Android SDK
    pub sdk_path: Option<PathBuf>,
}

/// Emulator launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// AVD to boot
    pub avd_name: Option<String>,
    /// GPU mode (auto, host, swiftshader_indirect, ...)
    pub gpu: Option<String>,
    /// Run without a window
    pub no_window: bool,
    /// Disable audio
    pub no_audio: bool,
    /// Skip the boot animation
    pub no_boot_anim: bool,
    /// Memory size in MB
    pub memory_mb: Option<u32>,
    /// Wipe user data on launch
    pub wipe_data: bool,
    /// Ask the emulator to report its console port back on the callback port
    pub report_console: bool,
    /// How long to wait for the console report
    pub report_timeout_secs: u64,
    /// Additional arguments
    pub extra_args: Vec<String>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            avd_name: None,
            gpu: Some("swiftshader_indirect".to_string()),
            no_window: true,
            no_audio: true,
            no_boot_anim: true,
            memory_mb: None,
            wipe_data: false,
            report_console: true,
            report_timeout_secs: 60,
            extra_args: Vec::new(),
        }
    }
}

/// Boot wait configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// Warm boot timeout in seconds
    pub timeout_secs: u64,
    /// Multiplier applied to the timeout on the very first boot of an instance
    pub cold_boot_factor: u32,
    /// Upper bound for a single boot probe
    pub probe_timeout_secs: u64,
    /// API level of the system image, used to pick the boot signal
    pub api_level: Option<u32>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            cold_boot_factor: 4,
            probe_timeout_secs: 10,
            api_level: None,
        }
    }
}

impl BootConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Console protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Hard ceiling for one console session, in milliseconds
    pub watchdog_ms: u64,
    /// Delay between the user command and `quit`, in milliseconds
    pub quit_grace_ms: u64,
    /// Read the auth token from here instead of the path the console names
    pub auth_token_path: Option<PathBuf>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            watchdog_ms: 10_000,
            quit_grace_ms: 100,
            auth_token_path: None,
        }
    }
}

impl ConsoleConfig {
    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    pub fn quit_grace(&self) -> Duration {
        Duration::from_millis(self.quit_grace_ms)
    }
}

/// Half-open TCP port range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port < self.end
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Port allocation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// First port of the bridge daemon's auto-attach window
    pub bridge_window_base: u16,
    /// Number of device slots (two ports each) in the auto-attach window
    pub bridge_window_slots: u16,
    /// Range for the command/bridge port pair
    pub command_range: PortRange,
    /// Range for the bridge server and callback ports
    pub aux_range: PortRange,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            bridge_window_base: 5554,
            bridge_window_slots: 16,
            command_range: PortRange::new(5586, 5800),
            aux_range: PortRange::new(5800, 6000),
        }
    }
}

impl PortConfig {
    /// The ports the bridge daemon scans on its own
    pub fn bridge_window(&self) -> PortRange {
        let end = self
            .bridge_window_base
            .saturating_add(self.bridge_window_slots.saturating_mul(2));
        PortRange::new(self.bridge_window_base, end)
    }

    /// Reject ranges that would reintroduce auto-attach races
    pub fn validate(&self) -> Result<()> {
        let window = self.bridge_window();
        if self.command_range.len() < 3 {
            return Err(HarnessError::Config(
                "ports.command_range must hold at least three ports".into(),
            ));
        }
        if self.aux_range.len() < 2 {
            return Err(HarnessError::Config(
                "ports.aux_range must hold at least two ports".into(),
            ));
        }
        if self.command_range.start < window.end {
            return Err(HarnessError::Config(format!(
                "ports.command_range must start after the bridge window ({}..{})",
                window.start, window.end
            )));
        }
        if self.aux_range.overlaps(&window) {
            return Err(HarnessError::Config(
                "ports.aux_range overlaps the bridge window".into(),
            ));
        }
        if self.aux_range.overlaps(&self.command_range) {
            return Err(HarnessError::Config(
                "ports.aux_range overlaps ports.command_range".into(),
            ));
        }
        Ok(())
    }
}

/// Captured output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving emulator and logcat output
    pub dir: PathBuf,
    /// Capture logcat once the instance has booted
    pub capture_logcat: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("emulator-output"),
            capture_logcat: false,
        }
    }
}

/// Main harness configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub android: AndroidConfig,
    pub emulator: EmulatorConfig,
    pub boot: BootConfig,
    pub console: ConsoleConfig,
    pub ports: PortConfig,
    pub output: OutputConfig,
}

impl HarnessConfig {
    /// Get the configuration directory path
    pub fn config_dir() -> Option<PathBuf> {
        ProjectDirs::from("dev", "emu-harness", "emu-harness")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the configuration file path
    pub fn config_file() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Load configuration from the platform config directory
    pub async fn load() -> Result<Self> {
        let config_file = Self::config_file()
            .ok_or_else(|| HarnessError::Config("Cannot determine config path".into()))?;

        if config_file.exists() {
            Self::load_from(&config_file).await
        } else {
            info!("Config file not found, using defaults");
            let config = HarnessConfig::default();
            config.save_to(&config_file).await?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file
    pub async fn load_from(path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", path);
        let contents = tokio::fs::read_to_string(path).await?;
        let config = Self::from_toml(&contents)?;
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: HarnessConfig = toml::from_str(contents)?;
        config.ports.validate()?;
        Ok(config)
    }

    /// Save configuration to the platform config directory
    pub async fn save(&self) -> Result<()> {
        let config_file = Self::config_file()
            .ok_or_else(|| HarnessError::Config("Cannot determine config path".into()))?;
        self.save_to(&config_file).await
    }

    /// Save configuration to an explicit file
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;

        debug!("Config saved to {:?}", path);
        Ok(())
    }

    /// Get Android SDK path, with auto-detection
    pub fn get_sdk_path(&self) -> Option<PathBuf> {
        self.android.sdk_path.clone().or_else(|| {
            let candidates = [
                std::env::var_os("ANDROID_SDK_ROOT").map(PathBuf::from),
                std::env::var_os("ANDROID_HOME").map(PathBuf::from),
                dirs::home_dir().map(|h: PathBuf| h.join("Android").join("Sdk")),
            ];

            candidates
                .into_iter()
                .flatten()
                .find(|p: &PathBuf| p.exists())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HarnessConfig::default();
        assert_eq!(config.boot.timeout_secs, 120);
        assert_eq!(config.boot.cold_boot_factor, 4);
        assert_eq!(config.console.watchdog(), Duration::from_secs(10));
        assert!(config.ports.validate().is_ok());
    }

    #[test]
    fn test_bridge_window() {
        let ports = PortConfig::default();
        assert_eq!(ports.bridge_window(), PortRange::new(5554, 5586));
        assert!(!ports.bridge_window().contains(ports.command_range.start));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = HarnessConfig::from_toml(
            r#"
            [boot]
            timeout_secs = 300

            [emulator]
            avd_name = "test_avd"
            "#,
        )
        .unwrap();
        assert_eq!(config.boot.timeout_secs, 300);
        assert_eq!(config.boot.cold_boot_factor, 4);
        assert_eq!(config.emulator.avd_name.as_deref(), Some("test_avd"));
        assert_eq!(config.console.quit_grace_ms, 100);
    }

    #[test]
    fn test_command_range_inside_window_rejected() {
        let result = HarnessConfig::from_toml(
            r#"
            [ports]
            command_range = { start = 5560, end = 5700 }
            "#,
        );
        assert!(matches!(result, Err(HarnessError::Config(_))));
    }

    #[test]
    fn test_overlapping_ranges_rejected() {
        let mut ports = PortConfig::default();
        ports.aux_range = PortRange::new(5700, 5900);
        assert!(ports.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = HarnessConfig::default();
        config.emulator.avd_name = Some("pixel".into());
        config.save_to(&path).await.unwrap();

        let loaded = HarnessConfig::load_from(&path).await.unwrap();
        assert_eq!(loaded.emulator.avd_name.as_deref(), Some("pixel"));
    }
}
