//! Acquisition settings and the order in which they are pushed to the camera.

use log::{info, warn};

use crate::device::{CameraDevice, ControlId, QhyError};

/// Rectangular pixel subregion requested from the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Horizontal and vertical binning factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binning {
    pub x: u32,
    pub y: u32,
}

impl Default for Binning {
    fn default() -> Self {
        Self { x: 1, y: 1 }
    }
}

/// Immutable snapshot of everything applied before an exposure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionSettings {
    pub gain: u32,
    pub offset: u32,
    pub exposure_us: u64,
    pub roi: Roi,
    pub bin: Binning,
    pub bit_depth: u32,
    pub read_mode: u32,
    pub usb_traffic: u32,
}

/// A setting the camera refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectedSetting {
    pub name: &'static str,
    pub error: QhyError,
}

/// Outcome of [`apply_settings`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub rejected: Vec<RejectedSetting>,
    pub skipped: Vec<&'static str>,
}

impl ApplyReport {
    /// Nothing was rejected or skipped.
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && self.skipped.is_empty()
    }

    fn record(&mut self, name: &'static str, res: Result<(), QhyError>) {
        match res {
            Ok(()) => {}
            Err(error) => {
                warn!("Could not set {name}: {error}");
                self.rejected.push(RejectedSetting { name, error });
            }
        }
    }
}

/// Push `settings` to the camera.
///
/// The order is USB traffic, resolution, binning, bit depth, read mode, then
/// gain, offset and exposure: some camera families compute their buffer
/// length from the resolution, so it must land before bit depth and read mode.
/// A refused setting is logged and recorded; the remaining ones are still
/// attempted.
pub fn apply_settings<D: CameraDevice>(
    dev: &mut D,
    settings: &AcquisitionSettings,
) -> ApplyReport {
    let mut report = ApplyReport::default();

    if dev.is_control_available(ControlId::UsbTraffic) {
        let res = dev.set_param(ControlId::UsbTraffic, settings.usb_traffic as f64);
        if res.is_ok() {
            info!("USB traffic set to {}", settings.usb_traffic);
        }
        report.record("usb traffic", res);
    } else {
        warn!("USB traffic control not available, skipping");
        report.skipped.push("usb traffic");
    }

    let Roi {
        x,
        y,
        width,
        height,
    } = settings.roi;
    let res = dev.set_resolution(x, y, width, height);
    if res.is_ok() {
        info!("Image resolution set to {width}x{height} at ({x}, {y})");
    }
    report.record("resolution", res);

    let res = dev.set_bin_mode(settings.bin.x, settings.bin.y);
    if res.is_ok() {
        info!("Binning mode set to {}x{}", settings.bin.x, settings.bin.y);
    }
    report.record("binning", res);

    if dev.is_control_available(ControlId::TransferBit) {
        let res = dev.set_bits_mode(settings.bit_depth);
        if res.is_ok() {
            info!("Bit resolution set to {}", settings.bit_depth);
        }
        report.record("bit depth", res);
    } else {
        warn!("Transfer bit control not available, skipping");
        report.skipped.push("bit depth");
    }

    let res = dev.set_read_mode(settings.read_mode);
    if res.is_ok() {
        info!("Read mode set to {}", settings.read_mode);
    }
    report.record("read mode", res);

    let res = dev.set_param(ControlId::Gain, settings.gain as f64);
    if res.is_ok() {
        info!("Gain set to {}", settings.gain);
    }
    report.record("gain", res);

    let res = dev.set_param(ControlId::Offset, settings.offset as f64);
    if res.is_ok() {
        info!("Offset set to {}", settings.offset);
    }
    report.record("offset", res);

    let res = dev.set_param(ControlId::Exposure, settings.exposure_us as f64);
    if res.is_ok() {
        info!(
            "Exposure set to {:.6} s",
            settings.exposure_us as f64 / 1_000_000.0
        );
    }
    report.record("exposure", res);

    report
}

/// Log the limits of gain, offset and exposure, and warn about sweep values
/// that fall outside them.
pub fn log_control_ranges<D: CameraDevice>(
    dev: &mut D,
    gains: &[u32],
    offsets: &[u32],
    exposures_us: &[u64],
) {
    let checks: [(&str, ControlId, Vec<f64>); 3] = [
        (
            "gain",
            ControlId::Gain,
            gains.iter().map(|&g| g as f64).collect(),
        ),
        (
            "offset",
            ControlId::Offset,
            offsets.iter().map(|&o| o as f64).collect(),
        ),
        (
            "exposure",
            ControlId::Exposure,
            exposures_us.iter().map(|&e| e as f64).collect(),
        ),
    ];
    for (name, control, values) in checks {
        match dev.param_range(control) {
            Ok(range) => {
                info!(
                    "{name}: min = {} max = {} step = {}",
                    range.min, range.max, range.step
                );
                for v in values.into_iter().filter(|v| !range.contains(*v)) {
                    warn!(
                        "Requested {name} {v} is outside [{}, {}]",
                        range.min, range.max
                    );
                }
            }
            Err(e) => warn!("Could not read {name} limits: {e}"),
        }
    }
}
