//! Configuration management
//!
//! This module handles loading, parsing, and validating the compositor
//! configuration from TOML files. Every section is optional; missing keys
//! fall back to their defaults.
//!
//! ```toml
//! [device]
//! path = "/dev/dri/card0"
//!
//! [scanout]
//! max_outputs = 8
//! suspend_drain_timeout_ms = 1000
//!
//! [render]
//! background = "#1E1E2E"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::output::MAX_OUTPUTS;
use crate::renderer::damage::MAX_RENDER_BOXES;
use crate::renderer::{Color, RenderOptions};

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct KmsConfig {
    /// Graphics device and session settings
    #[serde(default)]
    pub device: DeviceConfig,

    /// Scanout and page-flip settings
    #[serde(default)]
    pub scanout: ScanoutConfig,

    /// Render pass settings
    #[serde(default)]
    pub render: RenderConfig,

    /// Built-in demo client
    #[serde(default)]
    pub demo: DemoConfig,
}

/// Graphics device configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// DRM device node
    pub path: PathBuf,

    /// Watch udev for connector hotplug
    pub hotplug: bool,
}

/// Scanout configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScanoutConfig {
    /// Upper bound on simultaneously driven outputs (at most 32)
    pub max_outputs: usize,

    /// How long suspend may block waiting for in-flight flips
    pub suspend_drain_timeout_ms: u64,

    /// Damage boxes handed to the renderer per frame (1-4)
    pub max_damage_boxes: usize,
}

/// Render configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    /// Background color (hex: #RRGGBB)
    pub background: String,

    /// Tint damaged areas to visualize partial redraws
    pub damage_debug: bool,

    /// Tint color (hex: #RRGGBBAA)
    pub damage_debug_color: String,
}

/// Demo client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DemoConfig {
    /// Run the built-in demo client
    pub enabled: bool,

    /// Number of animated surfaces
    pub surfaces: u32,

    /// Interval between demo commits (milliseconds)
    pub interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/dri/card0"),
            hotplug: true,
        }
    }
}

impl Default for ScanoutConfig {
    fn default() -> Self {
        Self {
            max_outputs: 8,
            suspend_drain_timeout_ms: 1000,
            max_damage_boxes: MAX_RENDER_BOXES,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            background: "#1E1E2E".to_string(),
            damage_debug: false,
            damage_debug_color: "#FF000040".to_string(),
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            surfaces: 3,
            interval_ms: 16,
        }
    }
}

impl ScanoutConfig {
    pub fn suspend_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.suspend_drain_timeout_ms)
    }
}

impl KmsConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = expand_home(path.as_ref())?;

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: KmsConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.scanout.max_outputs == 0 || self.scanout.max_outputs > MAX_OUTPUTS {
            anyhow::bail!(
                "Invalid max_outputs: must be between 1 and {}",
                MAX_OUTPUTS
            );
        }

        if self.scanout.max_damage_boxes == 0 || self.scanout.max_damage_boxes > MAX_RENDER_BOXES {
            anyhow::bail!(
                "Invalid max_damage_boxes: must be between 1 and {}",
                MAX_RENDER_BOXES
            );
        }

        if self.scanout.suspend_drain_timeout_ms == 0 {
            anyhow::bail!("Invalid suspend_drain_timeout_ms: must be greater than 0");
        }

        if Color::from_hex(&self.render.background).is_none() {
            anyhow::bail!("Invalid background color: {}", self.render.background);
        }

        if Color::from_hex(&self.render.damage_debug_color).is_none() {
            anyhow::bail!(
                "Invalid damage_debug_color: {}",
                self.render.damage_debug_color
            );
        }

        if self.demo.enabled && self.demo.interval_ms == 0 {
            anyhow::bail!("Invalid demo interval_ms: must be greater than 0");
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }

    /// Render options derived from the `[render]` and `[scanout]` sections
    pub fn render_options(&self) -> RenderOptions {
        let background = Color::from_hex(&self.render.background).unwrap_or(Color::BLACK);
        let damage_tint = if self.render.damage_debug {
            Color::from_hex(&self.render.damage_debug_color)
        } else {
            None
        };

        RenderOptions {
            background,
            damage_tint,
            max_damage_boxes: self.scanout.max_damage_boxes,
        }
    }
}

/// Expands a leading `~` to `$HOME`
pub fn expand_home(path: &Path) -> Result<PathBuf> {
    if !path.to_string_lossy().starts_with('~') {
        return Ok(path.to_path_buf());
    }

    let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
    let rest = path.strip_prefix("~").unwrap_or(path);
    Ok(Path::new(&home).join(rest))
}

#[cfg(test)]
mod tests;

#[cfg(test)]
mod property_tests;
