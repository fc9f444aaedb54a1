//! Sweep configuration, loaded once from an INI file.

use std::{
    collections::HashMap,
    env,
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use configparser::ini::Ini;
use log::warn;

use crate::{
    acquisition::{AcquisitionSettings, Binning, Roi},
    exposure::ExposureOptions,
    filter_wheel::{FilterWheelOptions, MAX_SLOT},
    sweep::SweepPlan,
    temperature::{RegulatorTiming, TemperatureTarget},
};

type IniMap = HashMap<String, HashMap<String, Option<String>>>;

/// Directory holding the configuration file: `$OUT_DIR`, or the working
/// directory.
pub fn get_out_dir() -> PathBuf {
    PathBuf::from(env::var("OUT_DIR").unwrap_or("./".to_owned()))
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read configuration: {0}")]
    Load(String),
    #[error("could not write configuration: {0}")]
    Store(String),
    #[error("[{section}] {key}: could not parse {value:?}")]
    Parse {
        section: &'static str,
        key: &'static str,
        value: String,
    },
    #[error("[{section}] {key}: {reason}")]
    Invalid {
        section: &'static str,
        key: &'static str,
        reason: String,
    },
}

/// Everything a sweep needs, immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepConfig {
    /// Connect to the first camera whose id contains this string, or to the
    /// first camera found.
    pub camera: Option<String>,
    pub roi: Roi,
    pub bin: Binning,
    pub bit_depth: u32,
    pub read_mode: u32,
    pub usb_traffic: u32,
    /// Temperature setpoints in °C, outermost sweep axis.
    pub temperatures: Vec<f64>,
    pub offsets: Vec<u32>,
    pub gains: Vec<u32>,
    /// Exposure times in microseconds, innermost setting axis.
    pub exposures_us: Vec<u64>,
    /// Captures per setting combination.
    pub repeat: u32,
    /// Throwaway frames before every capture.
    pub bias_frames: u32,
    pub tolerance: f64,
    pub regulator: RegulatorTiming,
    /// Filter wheel slot, `None` to leave the wheel alone.
    pub filter_slot: Option<u8>,
    pub wheel: FilterWheelOptions,
    /// Prefix of every output file name.
    pub save_path: String,
    pub save_png: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            camera: None, // connect to the first camera
            roi: Roi {
                x: 0,
                y: 0,
                width: 9600,
                height: 6422,
            },
            bin: Binning::default(),
            bit_depth: 16,
            read_mode: 1,
            usb_traffic: 10,
            temperatures: vec![18.0, 20.0],
            offsets: vec![20, 40],
            gains: vec![56, 60],
            exposures_us: vec![5_000_000, 10_000_000],
            repeat: 2,
            bias_frames: 0,
            tolerance: 0.3,
            regulator: RegulatorTiming::default(),
            filter_slot: Some(2),
            wheel: FilterWheelOptions::default(),
            save_path: "/home/user/Documents/Images/qhyImg".to_string(),
            save_png: false,
        }
    }
}

fn raw<'a>(map: &'a IniMap, section: &str, key: &str) -> Option<&'a str> {
    map.get(section)?
        .get(key)?
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn parse_value<T: FromStr>(
    map: &IniMap,
    section: &'static str,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match raw(map, section, key) {
        None => Ok(default),
        Some(value) => value.parse::<T>().map_err(|_| ConfigError::Parse {
            section,
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_list<T: FromStr>(
    map: &IniMap,
    section: &'static str,
    key: &'static str,
    default: Vec<T>,
) -> Result<Vec<T>, ConfigError> {
    let Some(value) = raw(map, section, key) else {
        return Ok(default);
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<T>().map_err(|_| ConfigError::Parse {
                section,
                key,
                value: v.to_string(),
            })
        })
        .collect()
}

fn parse_seconds(
    map: &IniMap,
    section: &'static str,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let secs = parse_value(map, section, key, default.as_secs_f64())?;
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::Invalid {
        section,
        key,
        reason: format!("{secs} is not a valid duration"),
    })
}

fn join<T: Display>(values: &[T]) -> String {
    values
        .iter()
        .map(T::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn invalid(section: &'static str, key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        section,
        key,
        reason: reason.to_string(),
    }
}

impl SweepConfig {
    pub fn from_ini(path: &Path) -> Result<SweepConfig, ConfigError> {
        let map = Ini::new().load(path).map_err(ConfigError::Load)?;
        Self::from_map(&map)
    }

    pub fn from_ini_str(text: &str) -> Result<SweepConfig, ConfigError> {
        let map = Ini::new()
            .read(text.to_string())
            .map_err(ConfigError::Load)?;
        Self::from_map(&map)
    }

    /// Read `path`, or write the defaults there and use them when the file
    /// does not exist.
    pub fn load_or_default(path: &Path) -> Result<SweepConfig, ConfigError> {
        if path.exists() {
            return Self::from_ini(path);
        }
        warn!(
            "Configuration file {} not found, using defaults",
            path.display()
        );
        let cfg = SweepConfig::default();
        if let Err(e) = cfg.to_ini(path) {
            warn!("{e}");
        }
        Ok(cfg)
    }

    fn from_map(map: &IniMap) -> Result<SweepConfig, ConfigError> {
        let def = SweepConfig::default();

        let exposures_s = parse_list::<f64>(
            map,
            "sweep",
            "exposures",
            def.exposures_us
                .iter()
                .map(|&us| us as f64 / 1_000_000.0)
                .collect(),
        )?;
        let mut exposures_us = Vec::with_capacity(exposures_s.len());
        for secs in exposures_s {
            if !(secs.is_finite() && secs > 0.0) {
                return Err(invalid("sweep", "exposures", "exposures must be positive"));
            }
            exposures_us.push((secs * 1_000_000.0).round() as u64);
        }

        let filter_slot = match raw(map, "filterwheel", "slot") {
            None => def.filter_slot,
            Some(v) if v.eq_ignore_ascii_case("none") => None,
            Some(v) => Some(v.parse::<u8>().map_err(|_| ConfigError::Parse {
                section: "filterwheel",
                key: "slot",
                value: v.to_string(),
            })?),
        };

        let cfg = SweepConfig {
            camera: raw(map, "camera", "name").map(str::to_string),
            roi: Roi {
                x: parse_value(map, "camera", "roi_x", def.roi.x)?,
                y: parse_value(map, "camera", "roi_y", def.roi.y)?,
                width: parse_value(map, "camera", "roi_width", def.roi.width)?,
                height: parse_value(map, "camera", "roi_height", def.roi.height)?,
            },
            bin: Binning {
                x: parse_value(map, "camera", "bin_x", def.bin.x)?,
                y: parse_value(map, "camera", "bin_y", def.bin.y)?,
            },
            bit_depth: parse_value(map, "camera", "bit_depth", def.bit_depth)?,
            read_mode: parse_value(map, "camera", "read_mode", def.read_mode)?,
            usb_traffic: parse_value(map, "camera", "usb_traffic", def.usb_traffic)?,
            temperatures: parse_list(map, "sweep", "temperatures", def.temperatures)?,
            offsets: parse_list(map, "sweep", "offsets", def.offsets)?,
            gains: parse_list(map, "sweep", "gains", def.gains)?,
            exposures_us,
            repeat: parse_value(map, "sweep", "repeat", def.repeat)?,
            bias_frames: parse_value(map, "sweep", "bias_frames", def.bias_frames)?,
            tolerance: parse_value(map, "temperature", "tolerance", def.tolerance)?,
            regulator: RegulatorTiming {
                settle_checks: parse_value(
                    map,
                    "temperature",
                    "settle_checks",
                    def.regulator.settle_checks,
                )?,
                check_interval: parse_seconds(
                    map,
                    "temperature",
                    "check_interval",
                    def.regulator.check_interval,
                )?,
                poll_interval: parse_seconds(
                    map,
                    "temperature",
                    "poll_interval",
                    def.regulator.poll_interval,
                )?,
                max_polls_per_check: parse_value(
                    map,
                    "temperature",
                    "max_polls",
                    def.regulator.max_polls_per_check,
                )?,
            },
            filter_slot,
            wheel: FilterWheelOptions {
                poll_interval: parse_seconds(
                    map,
                    "filterwheel",
                    "poll_interval",
                    def.wheel.poll_interval,
                )?,
                max_polls: parse_value(map, "filterwheel", "max_polls", def.wheel.max_polls)?,
            },
            save_path: raw(map, "output", "save_path")
                .map(str::to_string)
                .unwrap_or(def.save_path),
            save_png: parse_value(map, "output", "save_png", def.save_png)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would make the sweep meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.temperatures.is_empty() {
            return Err(invalid("sweep", "temperatures", "list is empty"));
        }
        if self.offsets.is_empty() {
            return Err(invalid("sweep", "offsets", "list is empty"));
        }
        if self.gains.is_empty() {
            return Err(invalid("sweep", "gains", "list is empty"));
        }
        if self.exposures_us.is_empty() {
            return Err(invalid("sweep", "exposures", "list is empty"));
        }
        if self.exposures_us.contains(&0) {
            return Err(invalid("sweep", "exposures", "exposures must be positive"));
        }
        if self.repeat == 0 {
            return Err(invalid("sweep", "repeat", "must be at least 1"));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(invalid("temperature", "tolerance", "must be positive"));
        }
        if self.regulator.settle_checks == 0 {
            return Err(invalid("temperature", "settle_checks", "must be at least 1"));
        }
        if self.filter_slot.is_some_and(|s| s > MAX_SLOT) {
            return Err(invalid("filterwheel", "slot", "must be between 0 and 9"));
        }
        if self.roi.width == 0 || self.roi.height == 0 {
            return Err(invalid("camera", "roi_width", "region of interest is empty"));
        }
        if self.bin.x == 0 || self.bin.y == 0 {
            return Err(invalid("camera", "bin_x", "binning must be at least 1"));
        }
        if self.bit_depth != 8 && self.bit_depth != 16 {
            return Err(invalid("camera", "bit_depth", "must be 8 or 16"));
        }
        Ok(())
    }

    pub fn to_ini(&self, path: &Path) -> Result<(), ConfigError> {
        let mut config = Ini::new();
        if let Some(camera) = &self.camera {
            config.set("camera", "name", Some(camera.clone()));
        }
        config.set("camera", "roi_x", Some(self.roi.x.to_string()));
        config.set("camera", "roi_y", Some(self.roi.y.to_string()));
        config.set("camera", "roi_width", Some(self.roi.width.to_string()));
        config.set("camera", "roi_height", Some(self.roi.height.to_string()));
        config.set("camera", "bin_x", Some(self.bin.x.to_string()));
        config.set("camera", "bin_y", Some(self.bin.y.to_string()));
        config.set("camera", "bit_depth", Some(self.bit_depth.to_string()));
        config.set("camera", "read_mode", Some(self.read_mode.to_string()));
        config.set("camera", "usb_traffic", Some(self.usb_traffic.to_string()));

        config.set("sweep", "temperatures", Some(join(&self.temperatures)));
        config.set("sweep", "offsets", Some(join(&self.offsets)));
        config.set("sweep", "gains", Some(join(&self.gains)));
        let exposures_s: Vec<f64> = self
            .exposures_us
            .iter()
            .map(|&us| us as f64 / 1_000_000.0)
            .collect();
        config.set("sweep", "exposures", Some(join(&exposures_s)));
        config.set("sweep", "repeat", Some(self.repeat.to_string()));
        config.set("sweep", "bias_frames", Some(self.bias_frames.to_string()));

        config.set("temperature", "tolerance", Some(self.tolerance.to_string()));
        config.set(
            "temperature",
            "settle_checks",
            Some(self.regulator.settle_checks.to_string()),
        );
        config.set(
            "temperature",
            "check_interval",
            Some(self.regulator.check_interval.as_secs_f64().to_string()),
        );
        config.set(
            "temperature",
            "poll_interval",
            Some(self.regulator.poll_interval.as_secs_f64().to_string()),
        );
        config.set(
            "temperature",
            "max_polls",
            Some(self.regulator.max_polls_per_check.to_string()),
        );

        config.set(
            "filterwheel",
            "slot",
            Some(
                self.filter_slot
                    .map_or_else(|| "none".to_string(), |s| s.to_string()),
            ),
        );
        config.set(
            "filterwheel",
            "poll_interval",
            Some(self.wheel.poll_interval.as_secs_f64().to_string()),
        );
        config.set(
            "filterwheel",
            "max_polls",
            Some(self.wheel.max_polls.to_string()),
        );

        config.set("output", "save_path", Some(self.save_path.clone()));
        config.set("output", "save_png", Some(self.save_png.to_string()));
        config
            .write(path)
            .map_err(|err| ConfigError::Store(err.to_string()))?;
        Ok(())
    }

    /// Settings pushed to the camera for one setting combination.
    pub fn settings(&self, gain: u32, offset: u32, exposure_us: u64) -> AcquisitionSettings {
        AcquisitionSettings {
            gain,
            offset,
            exposure_us,
            roi: self.roi,
            bin: self.bin,
            bit_depth: self.bit_depth,
            read_mode: self.read_mode,
            usb_traffic: self.usb_traffic,
        }
    }

    pub fn target(&self, temperature: f64) -> TemperatureTarget {
        TemperatureTarget {
            target_celsius: temperature,
            tolerance_celsius: self.tolerance,
        }
    }

    pub fn exposure_options(&self) -> ExposureOptions {
        ExposureOptions {
            bias_frames: self.bias_frames,
            ..ExposureOptions::default()
        }
    }

    pub fn plan(&self) -> SweepPlan {
        SweepPlan {
            temperatures: self.temperatures.clone(),
            offsets: self.offsets.clone(),
            gains: self.gains.clone(),
            exposures_us: self.exposures_us.clone(),
            repeat: self.repeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(SweepConfig::from_ini_str("").unwrap(), SweepConfig::default());
    }

    #[test]
    fn parses_lists_and_units() {
        let cfg = SweepConfig::from_ini_str(
            "[camera]\nname = QHY600\nread_mode = 0\n\
             [sweep]\ntemperatures = -10, -5.5\nGains = 0,26\noffsets=30\n\
             exposures = 0.0001, 2.5\nrepeat = 3\nbias_frames = 2\n\
             [temperature]\ntolerance = 0.5\npoll_interval = 0.25\n\
             [filterwheel]\nslot = none\n\
             [output]\nsave_path = /tmp/run\nsave_png = true\n",
        )
        .unwrap();
        assert_eq!(cfg.camera.as_deref(), Some("QHY600"));
        assert_eq!(cfg.read_mode, 0);
        assert_eq!(cfg.temperatures, [-10.0, -5.5]);
        assert_eq!(cfg.gains, [0, 26]);
        assert_eq!(cfg.offsets, [30]);
        assert_eq!(cfg.exposures_us, [100, 2_500_000]);
        assert_eq!(cfg.repeat, 3);
        assert_eq!(cfg.exposure_options().bias_frames, 2);
        assert_eq!(cfg.regulator.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.filter_slot, None);
        assert_eq!(cfg.save_path, "/tmp/run");
        assert!(cfg.save_png);
        assert_eq!(cfg.plan().total(), 24);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            SweepConfig::from_ini_str("[sweep]\ngains = 1, x\n"),
            Err(ConfigError::Parse { key: "gains", .. })
        ));
        assert!(matches!(
            SweepConfig::from_ini_str("[sweep]\nrepeat = 0\n"),
            Err(ConfigError::Invalid { key: "repeat", .. })
        ));
        assert!(matches!(
            SweepConfig::from_ini_str("[temperature]\ntolerance = 0\n"),
            Err(ConfigError::Invalid { key: "tolerance", .. })
        ));
        assert!(matches!(
            SweepConfig::from_ini_str("[filterwheel]\nslot = 12\n"),
            Err(ConfigError::Invalid { key: "slot", .. })
        ));
        assert!(matches!(
            SweepConfig::from_ini_str("[sweep]\nexposures = 0\n"),
            Err(ConfigError::Invalid { key: "exposures", .. })
        ));
    }

    #[test]
    fn written_config_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qhysweep.ini");
        let mut cfg = SweepConfig {
            camera: Some("QHY268M".to_string()),
            temperatures: vec![-10.0, 0.5],
            exposures_us: vec![100, 1_500_000],
            filter_slot: None,
            ..SweepConfig::default()
        };
        cfg.regulator.check_interval = Duration::from_millis(500);
        cfg.to_ini(&path).unwrap();
        assert_eq!(SweepConfig::from_ini(&path).unwrap(), cfg);
    }

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qhysweep.ini");
        let cfg = SweepConfig::load_or_default(&path).unwrap();
        assert_eq!(cfg, SweepConfig::default());
        assert!(path.exists());
        assert_eq!(SweepConfig::from_ini(&path).unwrap(), cfg);
    }
}
