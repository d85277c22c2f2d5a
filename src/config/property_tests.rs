//! Property-based tests for configuration module
//!
//! These tests use proptest to generate random configurations and verify
//! validation bounds and serialization round-trips.

use super::*;
use proptest::prelude::*;

prop_compose! {
    fn hex_color()(r in any::<u8>(), g in any::<u8>(), b in any::<u8>()) -> String {
        format!("#{r:02X}{g:02X}{b:02X}")
    }
}

prop_compose! {
    fn valid_scanout_config()(
        max_outputs in 1usize..=32,
        suspend_drain_timeout_ms in 1u64..10_000,
        max_damage_boxes in 1usize..=4,
    ) -> ScanoutConfig {
        ScanoutConfig {
            max_outputs,
            suspend_drain_timeout_ms,
            max_damage_boxes,
        }
    }
}

prop_compose! {
    fn valid_render_config()(
        background in hex_color(),
        damage_debug in any::<bool>(),
    ) -> RenderConfig {
        RenderConfig {
            background,
            damage_debug,
            ..RenderConfig::default()
        }
    }
}

prop_compose! {
    fn valid_kms_config()(
        scanout in valid_scanout_config(),
        render in valid_render_config(),
        hotplug in any::<bool>(),
        demo_enabled in any::<bool>(),
        demo_surfaces in 0u32..16,
        demo_interval in 1u64..1000,
    ) -> KmsConfig {
        KmsConfig {
            device: DeviceConfig {
                hotplug,
                ..DeviceConfig::default()
            },
            scanout,
            render,
            demo: DemoConfig {
                enabled: demo_enabled,
                surfaces: demo_surfaces,
                interval_ms: demo_interval,
            },
        }
    }
}

proptest! {
    /// Generated configurations pass validation
    #[test]
    fn test_valid_configs_validate(config in valid_kms_config()) {
        prop_assert!(config.validate().is_ok());
    }

    /// TOML serialization round-trip preserves every field
    #[test]
    fn test_config_toml_roundtrip(config in valid_kms_config()) {
        let toml_str = toml::to_string(&config)?;
        let parsed: KmsConfig = toml::from_str(&toml_str)?;
        prop_assert_eq!(config, parsed);
    }

    /// Output limits past the bitmask width are always rejected
    #[test]
    fn test_output_limit_enforced(max_outputs in 33usize..10_000) {
        let mut config = KmsConfig::default();
        config.scanout.max_outputs = max_outputs;
        prop_assert!(config.validate().is_err());
    }

    /// The damage box budget never exceeds the renderer ceiling
    #[test]
    fn test_render_options_box_budget(config in valid_kms_config()) {
        let options = config.render_options();
        prop_assert!(options.max_damage_boxes >= 1);
        prop_assert!(options.max_damage_boxes <= MAX_RENDER_BOXES);
        prop_assert_eq!(options.damage_tint.is_some(), config.render.damage_debug);
    }
}
