//! # KMS Compositor
//!
//! Runs the scanout core on a DRM device: one output per connected display,
//! page flips paced by vertical blanking, seat switching through libseat
//! and connector hotplug. Without a protocol layer attached, `--demo` animates a few
//! surfaces to exercise the pipeline.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::{debug, error, info};

use kms_compositor::{backend, KmsConfig};

#[derive(Parser)]
#[command(name = "kms-compositor")]
#[command(about = "KMS scanout and frame pacing core for a Wayland display server")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/kms-compositor/config.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// DRM device node, overrides the configuration
    #[arg(long)]
    device: Option<PathBuf>,

    /// Run the built-in demo client
    #[arg(long)]
    demo: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("🚀 Starting KMS compositor");
    info!(
        "📄 Version: {} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_DATE")
    );
    debug!(
        "Target {}, commit {}",
        env!("TARGET_TRIPLE"),
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    );

    // Load configuration
    let mut config = match KmsConfig::load(&cli.config) {
        Ok(config) => {
            info!("✅ Configuration loaded from: {}", cli.config);
            config
        }
        Err(e) => {
            error!("❌ Failed to load configuration: {:#}", e);
            info!("📝 Using default configuration");
            KmsConfig::default()
        }
    };

    // Override config with CLI flags
    if let Some(device) = cli.device {
        config.device.path = device;
    }
    if cli.demo {
        config.demo.enabled = true;
    }

    backend::run(&config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["kms-compositor"]).unwrap();
        assert!(!cli.debug);
        assert!(!cli.demo);
        assert!(cli.device.is_none());
        assert_eq!(cli.config, "~/.config/kms-compositor/config.toml");
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "kms-compositor",
            "--debug",
            "--demo",
            "--device",
            "/dev/dri/card1",
        ])
        .unwrap();
        assert!(cli.debug);
        assert!(cli.demo);
        assert_eq!(cli.device, Some(PathBuf::from("/dev/dri/card1")));
    }
}
