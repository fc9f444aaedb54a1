#![cfg(not(windows))]
//! Single-frame acquisition sweeps for QHYCCD cameras.
//!
//! A sweep walks the cross product of temperature, offset, gain and exposure
//! settings, captures each combination a fixed number of times and writes
//! every frame to a FITS file whose name and header record the settings.
//!
//! The pipeline talks to the camera through [`CameraDriver`] and
//! [`CameraDevice`]. With the `qhyccd` feature these are backed by the vendor
//! SDK ([`QhyDriver`]); [`simulator`] provides an in-process camera.

pub mod acquisition;
pub mod config;
pub mod device;
pub mod exposure;
pub mod filter_wheel;
pub mod persistence;
pub mod session;
pub mod simulator;
pub mod sweep;
pub mod temperature;

#[cfg(feature = "qhyccd")]
mod qhy_ffi;
#[cfg(feature = "qhyccd")]
#[macro_use]
mod qhy_ffi_wrapper;
#[cfg(feature = "qhyccd")]
mod qhyhandle;

#[cfg(feature = "qhyccd")]
pub use qhyhandle::{QhyDriver, QhyHandle};

pub use acquisition::{apply_settings, AcquisitionSettings, ApplyReport, Binning, Roi};
pub use config::{ConfigError, SweepConfig};
pub use device::{CameraDevice, CameraDriver, ControlId, FrameInfo, QhyError};
pub use exposure::{capture_frame, CaptureError, ExposureOptions, Frame, FrameBuffer};
pub use filter_wheel::{move_filter_wheel, FilterWheelOptions, WheelError, WheelOutcome};
pub use persistence::{output_path, write_fits, FrameMetadata, OutputRecord, PersistError};
pub use session::{BootstrapError, DeviceSession, SessionOptions};
pub use sweep::{run_sweep, SweepPlan, SweepPoint, SweepReport};
pub use temperature::{
    RegulationOutcome, RegulatorState, RegulatorTiming, TemperatureRegulator, TemperatureTarget,
};
