//! Camera session bootstrap and teardown.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use log::{error, info, warn};

use crate::device::{CameraDevice, CameraDriver, ChipInfo, ControlId, QhyError};

/// Set while a [`DeviceSession`] is alive.
static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Single-frame acquisition.
const SINGLE_FRAME_MODE: u8 = 0;

/// Fatal bootstrap failures. The binary exits with [`BootstrapError::exit_code`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootstrapError {
    #[error("a camera session is already open in this process")]
    SessionActive,
    #[error("could not initialize the SDK resource: {0}")]
    Resource(QhyError),
    #[error("no camera found")]
    NoCamera,
    #[error("could not read the id of camera {index}: {error}")]
    DeviceId { index: u32, error: QhyError },
    #[error("no camera id contains {0:?}")]
    NotFound(String),
    #[error("could not open camera {id}: {error}")]
    Open { id: String, error: QhyError },
    #[error("could not select read mode {mode}: {error}")]
    ReadMode { mode: u32, error: QhyError },
    #[error("could not select single-frame mode: {0}")]
    StreamMode(QhyError),
    #[error("could not initialize camera: {0}")]
    Init(QhyError),
}

impl BootstrapError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            BootstrapError::Resource(_) => 2,
            BootstrapError::NoCamera => 3,
            BootstrapError::DeviceId { .. } | BootstrapError::NotFound(_) => 4,
            BootstrapError::Open { .. } => 5,
            BootstrapError::StreamMode(_) => 6,
            BootstrapError::Init(_) => 7,
            BootstrapError::SessionActive => 8,
            BootstrapError::ReadMode { .. } => 9,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Open the first camera whose id contains this string.
    pub camera: Option<String>,
    /// Read mode selected before the camera is initialized.
    pub read_mode: u32,
}

#[derive(Debug)]
struct SessionClaim;

impl SessionClaim {
    fn acquire() -> Result<Self, BootstrapError> {
        SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| SessionClaim)
            .map_err(|_| BootstrapError::SessionActive)
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        SESSION_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// The open camera, owned for the whole run.
///
/// Dropping the session cancels any exposure, closes the camera and releases
/// the SDK resource.
pub struct DeviceSession<Drv: CameraDriver> {
    driver: Drv,
    device: Drv::Camera,
    id: String,
    chip: Option<ChipInfo>,
    closed: bool,
    _claim: SessionClaim,
}

impl<Drv: CameraDriver> fmt::Debug for DeviceSession<Drv> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.id)
            .field("chip", &self.chip)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

fn select_device<Drv: CameraDriver>(
    driver: &mut Drv,
    wanted: Option<&str>,
) -> Result<String, BootstrapError> {
    let count = driver.available_devices();
    info!("Found {count} cameras");
    if count == 0 {
        return Err(BootstrapError::NoCamera);
    }
    for index in 0..count {
        let id = driver
            .device_id(index)
            .map_err(|error| BootstrapError::DeviceId { index, error })?;
        info!("Camera {index}: {id}");
        match wanted {
            Some(name) if !id.contains(name) => continue,
            _ => return Ok(id),
        }
    }
    Err(BootstrapError::NotFound(
        wanted.unwrap_or_default().to_string(),
    ))
}

fn prepare_device<D: CameraDevice>(
    device: &mut D,
    opts: &SessionOptions,
) -> Result<Option<ChipInfo>, BootstrapError> {
    device
        .set_read_mode(opts.read_mode)
        .map_err(|error| BootstrapError::ReadMode {
            mode: opts.read_mode,
            error,
        })?;
    device
        .set_stream_mode(SINGLE_FRAME_MODE)
        .map_err(BootstrapError::StreamMode)?;
    device.init().map_err(BootstrapError::Init)?;
    // leave manual cooler mode so the setpoint takes over
    if let Err(e) = device.set_param(ControlId::ManualPwm, 0.0) {
        warn!("Could not clear manual cooler PWM: {e}");
    }
    match device.chip_info() {
        Ok(chip) => {
            info!(
                "Chip {:.2}x{:.2} mm, {}x{} px of {:.2}x{:.2} um, {} bpp",
                chip.chip_width_mm,
                chip.chip_height_mm,
                chip.max_width,
                chip.max_height,
                chip.pixel_width_um,
                chip.pixel_height_um,
                chip.bpp
            );
            Ok(Some(chip))
        }
        Err(e) => {
            warn!("Could not read chip info: {e}");
            Ok(None)
        }
    }
}

impl<Drv: CameraDriver> DeviceSession<Drv> {
    /// Bring up the SDK and open one camera in single-frame mode.
    ///
    /// Anything acquired before a failure is released before returning.
    pub fn open(mut driver: Drv, opts: &SessionOptions) -> Result<Self, BootstrapError> {
        let claim = SessionClaim::acquire()?;
        driver.init_resource().map_err(BootstrapError::Resource)?;
        info!("SDK resources initialized");

        let opened = select_device(&mut driver, opts.camera.as_deref()).and_then(|id| {
            let mut device = driver
                .connect_device(&id)
                .map_err(|error| BootstrapError::Open {
                    id: id.clone(),
                    error,
                })?;
            info!("Connected to camera {id}");
            match prepare_device(&mut device, opts) {
                Ok(chip) => Ok((id, device, chip)),
                Err(e) => {
                    if let Err(ce) = device.close() {
                        warn!("Could not close camera: {ce}");
                    }
                    Err(e)
                }
            }
        });

        match opened {
            Ok((id, device, chip)) => Ok(Self {
                driver,
                device,
                id,
                chip,
                closed: false,
                _claim: claim,
            }),
            Err(e) => {
                error!("{e}");
                if let Err(re) = driver.release_resource() {
                    warn!("Could not release SDK resources: {re}");
                }
                Err(e)
            }
        }
    }

    /// Whether a session is open anywhere in this process.
    pub fn is_active() -> bool {
        SESSION_ACTIVE.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn chip_info(&self) -> Option<&ChipInfo> {
        self.chip.as_ref()
    }

    pub fn device(&self) -> &Drv::Camera {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Drv::Camera {
        &mut self.device
    }

    /// Tear the session down, returning the first failure.
    pub fn close(mut self) -> Result<(), QhyError> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), QhyError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut res = Ok(());
        if let Err(e) = self.device.cancel_exposing_and_readout() {
            warn!("Could not cancel exposure: {e}");
        }
        if let Err(e) = self.device.close() {
            warn!("Could not close camera: {e}");
            res = Err(e);
        }
        if let Err(e) = self.driver.release_resource() {
            warn!("Could not release SDK resources: {e}");
            res = res.and(Err(e));
        }
        info!("Camera {} closed", self.id);
        res
    }
}

impl<Drv: CameraDriver> Drop for DeviceSession<Drv> {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::simulator::{SimulatedCamera, SimulatedDriver};

    fn opts() -> SessionOptions {
        SessionOptions {
            camera: None,
            read_mode: 1,
        }
    }

    #[test]
    #[serial]
    fn opens_in_single_frame_mode() {
        let drv = SimulatedDriver::new(SimulatedCamera::new("QHY600M-abc", 64, 32));
        let session = DeviceSession::open(drv, &opts()).unwrap();
        assert!(DeviceSession::<SimulatedDriver>::is_active());
        assert_eq!(session.id(), "QHY600M-abc");
        let cam = session.device();
        assert_eq!(cam.stream_mode(), Some(0));
        assert!(cam.is_initialized());
        assert_eq!(cam.read_mode(), 1);
        assert_eq!(cam.param(ControlId::ManualPwm), Some(0.0));
        assert_eq!(session.chip_info().map(|c| c.max_width), Some(64));
        session.close().unwrap();
        assert!(!DeviceSession::<SimulatedDriver>::is_active());
    }

    #[test]
    #[serial]
    fn only_one_session_per_process() {
        let first = DeviceSession::open(
            SimulatedDriver::new(SimulatedCamera::new("a", 8, 8)),
            &opts(),
        )
        .unwrap();
        let second = DeviceSession::open(
            SimulatedDriver::new(SimulatedCamera::new("b", 8, 8)),
            &opts(),
        );
        assert_eq!(second.unwrap_err(), BootstrapError::SessionActive);
        drop(first);
        assert!(DeviceSession::open(
            SimulatedDriver::new(SimulatedCamera::new("c", 8, 8)),
            &opts()
        )
        .is_ok());
    }

    #[test]
    #[serial]
    fn bootstrap_failures_are_fatal_and_release_the_claim() {
        let err = DeviceSession::open(SimulatedDriver::empty(), &opts()).unwrap_err();
        assert_eq!(err, BootstrapError::NoCamera);
        assert_eq!(err.exit_code(), 3);
        assert!(!DeviceSession::<SimulatedDriver>::is_active());

        let err = DeviceSession::open(
            SimulatedDriver::new(SimulatedCamera::new("a", 8, 8)).with_failing_resource(),
            &opts(),
        )
        .unwrap_err();
        assert!(matches!(err, BootstrapError::Resource(_)));

        let err = DeviceSession::open(
            SimulatedDriver::new(SimulatedCamera::new("a", 8, 8).with_failing_open()),
            &opts(),
        )
        .unwrap_err();
        assert!(matches!(err, BootstrapError::Open { .. }));
        assert_eq!(err.exit_code(), 5);
        assert!(!DeviceSession::<SimulatedDriver>::is_active());
    }

    #[test]
    #[serial]
    fn selects_camera_by_name() {
        let wanted = SessionOptions {
            camera: Some("268".to_string()),
            read_mode: 0,
        };
        let err = DeviceSession::open(
            SimulatedDriver::new(SimulatedCamera::new("QHY600M-1", 8, 8)),
            &wanted,
        )
        .unwrap_err();
        assert_eq!(err, BootstrapError::NotFound("268".to_string()));

        let session = DeviceSession::open(
            SimulatedDriver::new(SimulatedCamera::new("QHY268M-1", 8, 8)),
            &wanted,
        )
        .unwrap();
        assert_eq!(session.id(), "QHY268M-1");
    }

    #[test]
    #[serial]
    fn mode_failures_abort_bootstrap() {
        let bad_mode = SessionOptions {
            camera: None,
            read_mode: 7,
        };
        let err = DeviceSession::open(
            SimulatedDriver::new(SimulatedCamera::new("a", 8, 8)),
            &bad_mode,
        )
        .unwrap_err();
        assert_eq!(
            err,
            BootstrapError::ReadMode {
                mode: 7,
                error: QhyError::GeneralError
            }
        );
        assert_eq!(err.exit_code(), 9);
        assert!(!DeviceSession::<SimulatedDriver>::is_active());

        let err = DeviceSession::open(
            SimulatedDriver::new(SimulatedCamera::new("a", 8, 8).with_failing_stream_mode()),
            &opts(),
        )
        .unwrap_err();
        assert_eq!(err, BootstrapError::StreamMode(QhyError::GeneralError));
        assert_eq!(err.exit_code(), 6);
        assert!(!DeviceSession::<SimulatedDriver>::is_active());
    }

    #[test]
    #[serial]
    fn manual_pwm_failure_is_not_fatal() {
        let cam = SimulatedCamera::new("a", 8, 8).without_control(ControlId::ManualPwm);
        let session = DeviceSession::open(SimulatedDriver::new(cam), &opts()).unwrap();
        assert!(session.device().is_initialized());
        assert_eq!(session.device().param(ControlId::ManualPwm), None);
    }
}
