//! Unit tests for configuration module
//!
//! Tests configuration parsing, validation, serialization and the `~`
//! expansion of the config path.

use super::*;
use anyhow::Result;
use std::fs;
use tempfile::tempdir;

#[test]
fn test_default_configuration_is_valid() {
    let config = KmsConfig::default();

    assert!(config.validate().is_ok());
    assert_eq!(config.device.path, PathBuf::from("/dev/dri/card0"));
    assert!(config.device.hotplug);
    assert_eq!(config.scanout.max_damage_boxes, 4);
    assert_eq!(
        config.scanout.suspend_drain_timeout(),
        Duration::from_secs(1)
    );
    assert!(!config.demo.enabled);
}

#[test]
fn test_configuration_from_file() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("test_config.toml");

    let test_config = r##"
[device]
path = "/dev/dri/card1"
hotplug = false

[scanout]
max_outputs = 4
suspend_drain_timeout_ms = 250
max_damage_boxes = 2

[render]
background = "#102030"
damage_debug = true
damage_debug_color = "#00FF0080"

[demo]
enabled = true
surfaces = 5
interval_ms = 33
"##;

    fs::write(&file_path, test_config)?;

    let config = KmsConfig::load(&file_path)?;

    assert_eq!(config.device.path, PathBuf::from("/dev/dri/card1"));
    assert!(!config.device.hotplug);
    assert_eq!(config.scanout.max_outputs, 4);
    assert_eq!(
        config.scanout.suspend_drain_timeout(),
        Duration::from_millis(250)
    );
    assert_eq!(config.demo.surfaces, 5);

    let options = config.render_options();
    assert_eq!(options.background, Color::rgb(0x10, 0x20, 0x30));
    assert_eq!(options.max_damage_boxes, 2);
    assert_eq!(options.damage_tint.map(|c| c.a), Some(0x80));

    Ok(())
}

#[test]
fn test_partial_configuration_uses_defaults() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("partial_config.toml");

    fs::write(&file_path, "[scanout]\nmax_outputs = 2\n")?;

    let config = KmsConfig::load(&file_path)?;

    assert_eq!(config.scanout.max_outputs, 2);
    assert_eq!(config.scanout.max_damage_boxes, 4);
    assert_eq!(config.render, RenderConfig::default());
    assert_eq!(config.device, DeviceConfig::default());

    Ok(())
}

#[test]
fn test_empty_file_is_default() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("empty.toml");
    fs::write(&file_path, "")?;

    assert_eq!(KmsConfig::load(&file_path)?, KmsConfig::default());
    Ok(())
}

#[test]
fn test_too_many_outputs_rejected() {
    let mut config = KmsConfig::default();
    config.scanout.max_outputs = 33;
    assert!(config.validate().is_err());

    config.scanout.max_outputs = 32;
    assert!(config.validate().is_ok());

    config.scanout.max_outputs = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_damage_box_budget_range() {
    let mut config = KmsConfig::default();
    for boxes in 1..=4 {
        config.scanout.max_damage_boxes = boxes;
        assert!(config.validate().is_ok());
    }

    config.scanout.max_damage_boxes = 5;
    assert!(config.validate().is_err());
    config.scanout.max_damage_boxes = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_invalid_colors_rejected() {
    let mut config = KmsConfig::default();
    config.render.background = "blue".to_string();
    assert!(config.validate().is_err());

    let mut config = KmsConfig::default();
    config.render.damage_debug_color = "#GG0000".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_invalid_file_reports_path() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("broken.toml");
    fs::write(&file_path, "[scanout\nmax_outputs = ")?;

    let err = KmsConfig::load(&file_path).unwrap_err();
    assert!(format!("{err:#}").contains("broken.toml"));
    Ok(())
}

#[test]
fn test_missing_file_is_error() {
    let dir = tempdir().unwrap();
    assert!(KmsConfig::load(dir.path().join("nope.toml")).is_err());
}

#[test]
fn test_save_and_reload() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("saved.toml");

    let mut config = KmsConfig::default();
    config.demo.enabled = true;
    config.scanout.max_outputs = 3;
    config.save(&file_path)?;

    assert_eq!(KmsConfig::load(&file_path)?, config);
    Ok(())
}

#[test]
fn test_expand_home() -> Result<()> {
    let plain = expand_home(Path::new("/etc/kms.toml"))?;
    assert_eq!(plain, PathBuf::from("/etc/kms.toml"));

    if let Ok(home) = std::env::var("HOME") {
        let expanded = expand_home(Path::new("~/.config/kms-compositor/config.toml"))?;
        assert_eq!(
            expanded,
            Path::new(&home).join(".config/kms-compositor/config.toml")
        );
    }
    Ok(())
}
