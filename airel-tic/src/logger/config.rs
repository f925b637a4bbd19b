//! Logger configuration.
//!
//! Loaded from YAML. Every recognized option is an explicit field with a
//! documented effect; unknown keys are rejected at load time rather than
//! silently ignored.

use std::path::Path;

use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::protocol::OperatingMode;

/// One phase of the measurement cycle: a mode and its duration in
/// seconds. Written in YAML as a two-element sequence, e.g. `[zero, 60]`.
#[derive(Debug, Clone, Deserialize)]
pub struct CyclePhase(pub PhaseMode, pub f64);

impl CyclePhase {
    pub fn mode(&self) -> &PhaseMode {
        &self.0
    }

    pub fn duration(&self) -> f64 {
        self.1
    }
}

/// A standard operating mode, or parameters for a custom mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PhaseMode {
    Standard(OperatingMode),
    Custom(Map<String, Value>),
}

/// Configuration of the records logger.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerConfig {
    /// Averaging period of device records, seconds.
    #[serde(default = "defaults::averaging_period")]
    pub averaging_period: f64,

    /// Settling time applied after every mode switch, seconds.
    #[serde(default = "defaults::settling_time")]
    pub settling_time: f64,

    /// Repeating list of measurement phases.
    #[serde(default = "defaults::measurement_cycle")]
    pub measurement_cycle: Vec<CyclePhase>,

    /// Shift of the cycle relative to the epoch, seconds. Use a negative
    /// settling time here to align settled data with full minutes.
    pub cycle_shift: f64,

    /// IANA timezone used for file naming and record timestamps.
    #[serde(default = "defaults::local_tz")]
    pub local_tz: Tz,

    /// Allow the device to draw power from the USB data port.
    #[serde(default = "defaults::yes")]
    pub allow_power_from_usb_data: bool,

    /// Keep the blowers running during zero phases.
    #[serde(default = "defaults::yes")]
    pub blowers_enabled_during_zero: bool,

    /// Extra device settings applied on top of the derived ones.
    #[serde(default)]
    pub custom_settings: Map<String, Value>,
}

mod defaults {
    use super::{CyclePhase, PhaseMode};
    use crate::protocol::OperatingMode;
    use chrono_tz::Tz;

    pub fn averaging_period() -> f64 {
        10.0
    }

    pub fn settling_time() -> f64 {
        30.0
    }

    pub fn measurement_cycle() -> Vec<CyclePhase> {
        vec![
            CyclePhase(PhaseMode::Standard(OperatingMode::Zero), 60.0),
            CyclePhase(PhaseMode::Standard(OperatingMode::Run), 120.0),
        ]
    }

    pub fn local_tz() -> Tz {
        chrono_tz::UTC
    }

    pub fn yes() -> bool {
        true
    }
}

impl LoggerConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&yaml)
    }

    fn validate(&self) -> Result<()> {
        if self.averaging_period <= 0.0 {
            return Err(Error::Config("averaging_period must be positive".into()));
        }
        if self.settling_time <= 0.0 {
            return Err(Error::Config("settling_time must be positive".into()));
        }
        if self.measurement_cycle.is_empty() {
            return Err(Error::Config("measurement_cycle must not be empty".into()));
        }
        if self
            .measurement_cycle
            .iter()
            .any(|phase| phase.duration() <= 0.0)
        {
            return Err(Error::Config(
                "measurement cycle durations must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Device settings derived from this configuration.
    ///
    /// Internal auto-zeroing is disabled since the logger runs its own
    /// cycle; `custom_settings` entries override the derived values.
    pub fn device_settings(&self) -> Map<String, Value> {
        let mut settings = Map::new();
        settings.insert("auto_zero_enabled".into(), false.into());
        settings.insert("averaging_period".into(), self.averaging_period.into());
        settings.insert("run_at_start".into(), true.into());
        settings.insert("extended_record_fields_enabled".into(), true.into());
        settings.insert("non_run_records_hidden".into(), false.into());
        settings.insert(
            "allow_power_from_usb_data".into(),
            self.allow_power_from_usb_data.into(),
        );
        settings.insert(
            "blowers_enabled_during_zero".into(),
            self.blowers_enabled_during_zero.into(),
        );
        settings.insert("zero_settling_duration".into(), self.settling_time.into());
        settings.insert("run_settling_duration".into(), self.settling_time.into());

        for (key, value) in &self.custom_settings {
            settings.insert(key.clone(), value.clone());
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = LoggerConfig::from_yaml("cycle_shift: 0").unwrap();
        assert_eq!(config.averaging_period, 10.0);
        assert_eq!(config.settling_time, 30.0);
        assert_eq!(config.measurement_cycle.len(), 2);
        assert_eq!(config.local_tz, chrono_tz::UTC);
        assert!(config.allow_power_from_usb_data);
        assert!(config.custom_settings.is_empty());
    }

    #[test]
    fn full_config_is_parsed() {
        let config = LoggerConfig::from_yaml(
            r#"
            averaging_period: 5
            settling_time: 15
            measurement_cycle:
              - [zero, 60]
              - [run, 60]
              - [run_swapped, 60]
            cycle_shift: -15
            local_tz: Europe/Tallinn
            blowers_enabled_during_zero: false
            custom_settings:
              averaging_period: 2.5
            "#,
        )
        .unwrap();

        assert_eq!(config.cycle_shift, -15.0);
        assert_eq!(config.local_tz, chrono_tz::Europe::Tallinn);
        assert_eq!(config.measurement_cycle.len(), 3);
        assert!(matches!(
            config.measurement_cycle[2].mode(),
            PhaseMode::Standard(OperatingMode::RunSwapped)
        ));
    }

    #[test]
    fn custom_mode_phase_is_parsed() {
        let config = LoggerConfig::from_yaml(
            r#"
            cycle_shift: 0
            measurement_cycle:
              - [{cev_voltage: 200}, 30]
            "#,
        )
        .unwrap();

        match config.measurement_cycle[0].mode() {
            PhaseMode::Custom(params) => assert_eq!(params["cev_voltage"], 200),
            other => panic!("expected custom mode, got {other:?}"),
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result = LoggerConfig::from_yaml("cycle_shift: 0\naveraging: 10");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn missing_cycle_shift_is_rejected() {
        assert!(matches!(
            LoggerConfig::from_yaml("averaging_period: 10"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn non_positive_durations_are_rejected() {
        assert!(matches!(
            LoggerConfig::from_yaml("cycle_shift: 0\naveraging_period: 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            LoggerConfig::from_yaml("cycle_shift: 0\nmeasurement_cycle: [[run, 0]]"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            LoggerConfig::from_yaml("cycle_shift: 0\nmeasurement_cycle: []"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn bad_timezone_is_rejected() {
        assert!(matches!(
            LoggerConfig::from_yaml("cycle_shift: 0\nlocal_tz: Europe/Atlantis"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn custom_settings_override_derived_ones() {
        let config = LoggerConfig::from_yaml(
            "cycle_shift: 0\ncustom_settings:\n  auto_zero_enabled: true",
        )
        .unwrap();
        let settings = config.device_settings();
        assert_eq!(settings["auto_zero_enabled"], true);
        assert_eq!(settings["run_at_start"], true);
        assert_eq!(settings["zero_settling_duration"], 30.0);
    }
}
