//! The sweep: every combination of temperature, offset, gain and exposure,
//! captured `repeat` times.

use std::{
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use chrono::Utc;
use log::{info, warn};

use crate::{
    acquisition::{apply_settings, log_control_ranges},
    config::SweepConfig,
    device::CameraDriver,
    exposure::capture_frame,
    filter_wheel::move_filter_wheel,
    persistence::{output_path, write_fits, write_png_preview, FrameMetadata, OutputRecord},
    session::DeviceSession,
    temperature::{RegulationOutcome, TemperatureRegulator},
};

/// The setting axes of a sweep, outermost first.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    pub temperatures: Vec<f64>,
    pub offsets: Vec<u32>,
    pub gains: Vec<u32>,
    pub exposures_us: Vec<u64>,
    pub repeat: u32,
}

/// One capture of a sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPoint {
    /// 1-based position in the sweep.
    pub number: usize,
    pub temperature: f64,
    pub offset: u32,
    pub gain: u32,
    pub exposure_us: u64,
    /// Index within the repeats of this setting combination.
    pub repeat: u32,
}

impl SweepPoint {
    /// First capture of its setting combination.
    pub fn starts_group(&self) -> bool {
        self.repeat == 0
    }
}

impl SweepPlan {
    /// Number of captures in the sweep.
    pub fn total(&self) -> usize {
        self.temperatures.len()
            * self.offsets.len()
            * self.gains.len()
            * self.exposures_us.len()
            * self.repeat as usize
    }

    /// Captures in sweep order: temperature outermost, repeat innermost.
    pub fn points(&self) -> impl Iterator<Item = SweepPoint> + '_ {
        (0..self.total()).map(move |n| {
            let repeat = self.repeat as usize;
            let mut rest = n / repeat;
            let exposure = rest % self.exposures_us.len();
            rest /= self.exposures_us.len();
            let gain = rest % self.gains.len();
            rest /= self.gains.len();
            let offset = rest % self.offsets.len();
            rest /= self.offsets.len();
            SweepPoint {
                number: n + 1,
                temperature: self.temperatures[rest],
                offset: self.offsets[offset],
                gain: self.gains[gain],
                exposure_us: self.exposures_us[exposure],
                repeat: (n % repeat) as u32,
            }
        })
    }
}

/// What happened during [`run_sweep`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub planned: usize,
    /// Frames retrieved from the camera.
    pub captured: usize,
    /// FITS files written, in sweep order.
    pub saved: Vec<PathBuf>,
    pub failed_captures: usize,
    pub failed_writes: usize,
    pub rejected_settings: usize,
    pub wheel_failures: usize,
    /// Captures taken without the sensor settling.
    pub unsettled: usize,
    /// The run flag was cleared before the sweep finished.
    pub interrupted: bool,
}

fn regulate<Drv: CameraDriver>(
    session: &mut DeviceSession<Drv>,
    regulator: &mut TemperatureRegulator,
    cfg: &SweepConfig,
    temperature: f64,
) -> RegulationOutcome {
    regulator.regulate(session.device_mut(), &cfg.target(temperature))
}

/// Run the sweep described by `cfg` on `session`.
///
/// Failures of a single setting, wheel move, capture or write are counted and
/// the sweep moves on. Clearing `running` stops it before the next capture.
pub fn run_sweep<Drv: CameraDriver>(
    session: &mut DeviceSession<Drv>,
    cfg: &SweepConfig,
    running: &AtomicBool,
) -> SweepReport {
    let plan = cfg.plan();
    let mut report = SweepReport {
        planned: plan.total(),
        ..Default::default()
    };
    let mut regulator = TemperatureRegulator::new(cfg.regulator);
    let exposure_opts = cfg.exposure_options();

    log_control_ranges(
        session.device_mut(),
        &cfg.gains,
        &cfg.offsets,
        &cfg.exposures_us,
    );

    for point in plan.points() {
        if !running.load(Ordering::SeqCst) {
            warn!(
                "Sweep stopped after {} of {} images",
                point.number - 1,
                report.planned
            );
            report.interrupted = true;
            break;
        }

        if point.starts_group() {
            info!(
                "Settings: temperature {:.2} C, offset {}, gain {}, exposure {} us",
                point.temperature, point.offset, point.gain, point.exposure_us
            );
            let settings = cfg.settings(point.gain, point.offset, point.exposure_us);
            let applied = apply_settings(session.device_mut(), &settings);
            report.rejected_settings += applied.rejected.len();
            if let Some(slot) = cfg.filter_slot {
                if let Err(e) = move_filter_wheel(session.device_mut(), slot, &cfg.wheel) {
                    warn!("{e}");
                    report.wheel_failures += 1;
                }
            }
            regulate(session, &mut regulator, cfg, point.temperature);
        }

        let outcome = regulate(session, &mut regulator, cfg, point.temperature);
        if !outcome.is_settled() {
            report.unsettled += 1;
        }

        info!("Taking image {} of {}", point.number, report.planned);
        let frame = match capture_frame(session.device_mut(), point.exposure_us, &exposure_opts) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Image {} failed: {e}", point.number);
                report.failed_captures += 1;
                continue;
            }
        };
        report.captured += 1;

        let unix_time = Utc::now().timestamp();
        let path = output_path(
            &cfg.save_path,
            unix_time,
            point.exposure_us,
            point.gain,
            point.offset,
            point.temperature,
            point.repeat,
        );
        let record = OutputRecord {
            pixels: frame.pixels,
            width: frame.info.width,
            height: frame.info.height,
            bits_per_pixel: frame.info.bpp,
            metadata: FrameMetadata {
                temperature: point.temperature,
                ccd_temperature: outcome.temperature(),
                exposure_us: point.exposure_us,
                gain: point.gain,
                offset: point.offset,
                read_mode: cfg.read_mode,
                unix_time,
            },
        };
        match write_fits(&record, &path) {
            Ok(()) => report.saved.push(path.clone()),
            Err(e) => {
                warn!("Could not write {}: {e}", path.display());
                report.failed_writes += 1;
            }
        }
        if cfg.save_png {
            let preview = path.with_extension("png");
            if let Err(e) = write_png_preview(&record, &preview) {
                warn!("Could not write {}: {e}", preview.display());
            }
        }
    }

    info!(
        "Sweep done: {} of {} images saved",
        report.saved.len(),
        report.planned
    );
    report
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fitsio::FitsFile;
    use serial_test::serial;

    use super::*;
    use crate::{
        acquisition::Roi,
        filter_wheel::FilterWheelOptions,
        session::SessionOptions,
        simulator::{SimulatedCamera, SimulatedDriver},
        temperature::RegulatorTiming,
    };

    fn plan() -> SweepPlan {
        SweepPlan {
            temperatures: vec![18.0, 20.0],
            offsets: vec![20],
            gains: vec![56, 60],
            exposures_us: vec![1_000, 2_000, 3_000],
            repeat: 2,
        }
    }

    fn config(save_path: String) -> SweepConfig {
        SweepConfig {
            roi: Roi {
                x: 0,
                y: 0,
                width: 16,
                height: 8,
            },
            temperatures: vec![24.0, 23.0],
            offsets: vec![10],
            gains: vec![0, 5],
            exposures_us: vec![1_000],
            repeat: 3,
            regulator: RegulatorTiming {
                settle_checks: 3,
                check_interval: Duration::ZERO,
                poll_interval: Duration::ZERO,
                max_polls_per_check: 50,
            },
            filter_slot: Some(1),
            wheel: FilterWheelOptions {
                poll_interval: Duration::ZERO,
                max_polls: 10,
            },
            save_path,
            ..SweepConfig::default()
        }
    }

    fn open(cam: SimulatedCamera) -> DeviceSession<SimulatedDriver> {
        DeviceSession::open(SimulatedDriver::new(cam), &SessionOptions::default()).unwrap()
    }

    #[test]
    fn point_count_is_the_product_of_the_axes() {
        let plan = plan();
        assert_eq!(plan.total(), 24);
        assert_eq!(plan.points().count(), 24);
        let single = SweepPlan {
            temperatures: vec![0.0],
            offsets: vec![0],
            gains: vec![0],
            exposures_us: vec![1],
            repeat: 5,
        };
        assert_eq!(single.points().count(), 5);
    }

    #[test]
    fn points_follow_nesting_order() {
        let points: Vec<_> = plan().points().collect();
        let key = |p: &SweepPoint| (p.temperature, p.offset, p.gain, p.exposure_us, p.repeat);
        assert_eq!(key(&points[0]), (18.0, 20, 56, 1_000, 0));
        assert_eq!(key(&points[1]), (18.0, 20, 56, 1_000, 1));
        assert_eq!(key(&points[2]), (18.0, 20, 56, 2_000, 0));
        assert_eq!(key(&points[6]), (18.0, 20, 60, 1_000, 0));
        assert_eq!(key(&points[12]), (20.0, 20, 56, 1_000, 0));
        assert_eq!(key(&points[23]), (20.0, 20, 60, 3_000, 1));
        for (n, p) in points.iter().enumerate() {
            assert_eq!(p.number, n + 1);
            assert_eq!(p.repeat as usize, n % 2);
            assert_eq!(p.starts_group(), n % 2 == 0);
        }
    }

    #[test]
    #[serial]
    fn sweep_writes_every_frame_with_its_settings() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path().join("img").to_string_lossy().into_owned());
        let mut session = open(SimulatedCamera::new("sim", 32, 16).with_filter_wheel(7, 4, 2));
        let running = AtomicBool::new(true);
        let report = run_sweep(&mut session, &cfg, &running);

        assert_eq!(report.planned, 12);
        assert_eq!(report.captured, 12);
        assert_eq!(report.saved.len(), 12);
        assert_eq!(report.failed_captures + report.failed_writes, 0);
        assert_eq!(report.rejected_settings + report.wheel_failures, 0);
        assert_eq!(report.unsettled, 0);
        assert!(!report.interrupted);
        assert_eq!(session.device().wheel_position(), Some(1));

        for ((n, path), point) in report.saved.iter().enumerate().zip(cfg.plan().points()) {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.ends_with(&format!("_{}.fits", n % 3)), "{name}");
            assert!(name.contains(&format!("_gain_{}_", point.gain)), "{name}");

            let mut f = FitsFile::open(path).unwrap();
            let hdu = f.primary_hdu().unwrap();
            assert_eq!(
                hdu.read_key::<f64>(&mut f, "INTTEMP").unwrap(),
                point.temperature
            );
            assert_eq!(hdu.read_key::<i64>(&mut f, "GAIN").unwrap(), point.gain as i64);
            assert_eq!(
                hdu.read_key::<i64>(&mut f, "OFFSET").unwrap(),
                point.offset as i64
            );
            assert_eq!(hdu.read_key::<i64>(&mut f, "EXPTIME").unwrap(), 1_000);
            assert_eq!(
                hdu.read_key::<i64>(&mut f, "READMODE").unwrap(),
                cfg.read_mode as i64
            );
            let pixels: Vec<u16> = hdu.read_image(&mut f).unwrap();
            assert_eq!(pixels.len(), 16 * 8);
        }
    }

    #[test]
    #[serial]
    fn failed_frame_does_not_stop_the_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path().join("img").to_string_lossy().into_owned());
        let mut session = open(
            SimulatedCamera::new("sim", 32, 16)
                .with_failing_frame(2)
                .with_failing_frame(7),
        );
        let running = AtomicBool::new(true);
        let report = run_sweep(&mut session, &cfg, &running);

        assert_eq!(report.failed_captures, 2);
        assert_eq!(report.captured, 10);
        assert_eq!(report.saved.len(), 10);
        assert_eq!(session.device().cancel_count(), 12);
    }

    #[test]
    #[serial]
    fn stuck_wheel_is_counted_per_group() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path().join("img").to_string_lossy().into_owned());
        let mut session = open(
            SimulatedCamera::new("sim", 32, 16)
                .with_filter_wheel(7, 4, 0)
                .with_stuck_wheel(),
        );
        let running = AtomicBool::new(true);
        let report = run_sweep(&mut session, &cfg, &running);

        assert_eq!(report.wheel_failures, 4);
        assert_eq!(report.saved.len(), 12);
        assert_eq!(session.device().wheel_position(), Some(4));
    }

    #[test]
    #[serial]
    fn unsettled_cooler_still_captures() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path().join("img").to_string_lossy().into_owned());
        let mut session = open(SimulatedCamera::new("sim", 32, 16).with_stuck_cooler());
        let running = AtomicBool::new(true);
        let report = run_sweep(&mut session, &cfg, &running);

        assert_eq!(report.unsettled, 12);
        assert_eq!(report.saved.len(), 12);
        let last = report.saved.last().unwrap();
        let mut f = FitsFile::open(last).unwrap();
        let hdu = f.primary_hdu().unwrap();
        assert_eq!(hdu.read_key::<f64>(&mut f, "INTTEMP").unwrap(), 23.0);
        assert_eq!(hdu.read_key::<f64>(&mut f, "CCDTEMP").unwrap(), 25.0);
    }

    #[test]
    #[serial]
    fn unwritable_output_keeps_capturing() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let cfg = config(blocker.join("img").to_string_lossy().into_owned());
        let mut session = open(SimulatedCamera::new("sim", 32, 16));
        let running = AtomicBool::new(true);
        let report = run_sweep(&mut session, &cfg, &running);

        assert_eq!(report.captured, report.planned);
        assert_eq!(report.failed_writes, 12);
        assert!(report.saved.is_empty());
        assert_eq!(session.device().exposure_log().len(), 12);
    }

    #[test]
    #[serial]
    fn rejected_roi_keeps_the_full_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path().join("img").to_string_lossy().into_owned());
        cfg.roi = Roi {
            x: 0,
            y: 0,
            width: 64,
            height: 8,
        };
        let mut session = open(SimulatedCamera::new("sim", 32, 16));
        let running = AtomicBool::new(true);
        let report = run_sweep(&mut session, &cfg, &running);

        assert_eq!(report.rejected_settings, 4);
        assert_eq!(report.saved.len(), 12);
        assert_eq!(session.device().roi(), (0, 0, 32, 16));
        let mut f = FitsFile::open(&report.saved[11]).unwrap();
        let hdu = f.primary_hdu().unwrap();
        let pixels: Vec<u16> = hdu.read_image(&mut f).unwrap();
        assert_eq!(pixels.len(), 32 * 16);
    }

    #[test]
    #[serial]
    fn cleared_run_flag_stops_before_capturing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path().join("img").to_string_lossy().into_owned());
        let mut session = open(SimulatedCamera::new("sim", 32, 16));
        let running = AtomicBool::new(false);
        let report = run_sweep(&mut session, &cfg, &running);

        assert!(report.interrupted);
        assert_eq!(report.captured, 0);
        assert!(session.device().exposure_log().is_empty());
    }
}
