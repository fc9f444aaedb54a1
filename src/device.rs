//! Device control interface consumed by the acquisition pipeline.
//!
//! Every vendor call reports a status word; [`check_status`] turns it into a
//! [`Result`]. The pipeline only talks to hardware through [`CameraDriver`]
//! and [`CameraDevice`], which are implemented by the SDK bindings
//! (`qhyccd` feature) and by the [`simulator`](crate::simulator).

/// Status word returned by every successful SDK call.
pub const QHYCCD_SUCCESS: u32 = 0;
/// Generic failure status.
pub const QHYCCD_ERROR: u32 = 0xFFFF_FFFF;
/// Returned by `ExpQHYCCDSingleFrame` when the frame can be read without waiting.
pub const QHYCCD_READ_DIRECTLY: u32 = 0x2001;

/// Scalar camera controls, numbered as in the vendor `CONTROL_ID` enum.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ControlId {
    /// Analog gain.
    Gain = 6,
    /// Black level.
    Offset = 7,
    /// Exposure time in microseconds.
    Exposure = 8,
    /// Transfer bit depth.
    TransferBit = 10,
    /// USB bandwidth throttle.
    UsbTraffic = 12,
    /// Current sensor temperature, read only.
    CurTemp = 14,
    /// Current cooler PWM (0..=255), read only.
    CurPwm = 15,
    /// Manual cooler PWM.
    ManualPwm = 16,
    /// Cooler setpoint in degrees Celsius.
    Cooler = 18,
}

impl ControlId {
    /// Vendor numeric id.
    pub fn raw(self) -> u32 {
        self as u32
    }
}

/// Failure reported by the device layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum QhyError {
    /// The SDK returned `QHYCCD_ERROR`.
    #[error("SDK call failed")]
    GeneralError,
    /// The SDK returned an unexpected status word.
    #[error("SDK call returned status {0:#x}")]
    Status(u32),
    /// The camera handle could not be obtained.
    #[error("camera could not be opened")]
    OpenFailed,
    /// The camera does not implement the control.
    #[error("control {0:?} is not available")]
    ControlUnavailable(ControlId),
    /// The frame buffer is smaller than the frame the device wants to return.
    #[error("frame buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall {
        /// Bytes the device needs.
        needed: usize,
        /// Bytes in the supplied buffer.
        have: usize,
    },
    /// The device has been closed.
    #[error("camera closed")]
    CameraClosed,
}

impl From<u32> for QhyError {
    fn from(val: u32) -> Self {
        match val {
            QHYCCD_ERROR => QhyError::GeneralError,
            other => QhyError::Status(other),
        }
    }
}

/// Compare a raw status word against the success sentinel.
pub fn check_status(status: u32) -> Result<(), QhyError> {
    if status == QHYCCD_SUCCESS {
        Ok(())
    } else {
        Err(status.into())
    }
}

/// Dimensions reported by a frame retrieval. These can differ from the
/// requested region of interest because the device rounds them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Bits per pixel.
    pub bpp: u32,
    /// Number of channels.
    pub channels: u32,
}

/// Sensor geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChipInfo {
    pub chip_width_mm: f64,
    pub chip_height_mm: f64,
    pub max_width: u32,
    pub max_height: u32,
    pub pixel_width_um: f64,
    pub pixel_height_um: f64,
    pub bpp: u32,
}

/// Limits of a scalar control.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl ControlRange {
    /// Whether `value` lies within the limits.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// SDK-level entry points: resource management and device enumeration.
pub trait CameraDriver {
    /// Handle type produced by [`CameraDriver::connect_device`].
    type Camera: CameraDevice;

    /// Acquire the SDK resource pool.
    fn init_resource(&mut self) -> Result<(), QhyError>;

    /// Number of enumerable devices.
    fn available_devices(&mut self) -> u32;

    /// Identifier string of the device at `index`.
    fn device_id(&mut self, index: u32) -> Result<String, QhyError>;

    /// Open the device with identifier `id`.
    fn connect_device(&mut self, id: &str) -> Result<Self::Camera, QhyError>;

    /// Release the SDK resource pool.
    fn release_resource(&mut self) -> Result<(), QhyError>;
}

/// Handle-level operations on an open camera.
pub trait CameraDevice {
    /// Select streaming (1) or single-frame (0) acquisition.
    fn set_stream_mode(&mut self, mode: u8) -> Result<(), QhyError>;

    /// Initialize the opened camera.
    fn init(&mut self) -> Result<(), QhyError>;

    /// Write a scalar control.
    fn set_param(&mut self, control: ControlId, value: f64) -> Result<(), QhyError>;

    /// Read a scalar control.
    fn get_param(&mut self, control: ControlId) -> Result<f64, QhyError>;

    /// Whether the camera implements `control`.
    fn is_control_available(&mut self, control: ControlId) -> bool;

    /// Limits of `control`.
    fn param_range(&mut self, control: ControlId) -> Result<ControlRange, QhyError>;

    /// Sensor geometry.
    fn chip_info(&mut self) -> Result<ChipInfo, QhyError>;

    /// Set the region of interest.
    fn set_resolution(&mut self, x: u32, y: u32, width: u32, height: u32)
        -> Result<(), QhyError>;

    /// Set the binning mode.
    fn set_bin_mode(&mut self, bin_x: u32, bin_y: u32) -> Result<(), QhyError>;

    /// Set the transfer bit depth.
    fn set_bits_mode(&mut self, bits: u32) -> Result<(), QhyError>;

    /// Select the sensor read mode.
    fn set_read_mode(&mut self, mode: u32) -> Result<(), QhyError>;

    /// Start a single-frame exposure.
    fn start_single_frame(&mut self) -> Result<(), QhyError>;

    /// Bytes required to hold a frame.
    fn mem_length(&mut self) -> u32;

    /// Block until the frame is read out into `buffer`.
    fn get_single_frame(&mut self, buffer: &mut [u8]) -> Result<FrameInfo, QhyError>;

    /// Abort any exposure or readout in progress.
    fn cancel_exposing_and_readout(&mut self) -> Result<(), QhyError>;

    /// Whether a colour filter wheel is attached.
    fn cfw_plugged(&mut self) -> bool;

    /// Current filter wheel status character, `b'0'` for slot 0.
    fn cfw_status(&mut self) -> Result<u8, QhyError>;

    /// Order the filter wheel to the slot encoded as `order`.
    fn cfw_move(&mut self, order: u8) -> Result<(), QhyError>;

    /// Close the handle.
    fn close(&mut self) -> Result<(), QhyError>;
}
