//! In-process camera used by `--simulate` and by the test suite.
//!
//! The model is intentionally small: the sensor temperature walks toward the
//! cooler setpoint by a fixed step on every read, the filter wheel arrives
//! after a configurable number of status polls, and frames are filled with a
//! deterministic ramp derived from gain and offset. Failures can be injected
//! per control, per frame and per accessory.

use std::collections::{HashMap, HashSet};

use crate::device::{
    CameraDevice, CameraDriver, ChipInfo, ControlId, ControlRange, FrameInfo, QhyError,
};

/// Driver handing out a single [`SimulatedCamera`].
#[derive(Debug)]
pub struct SimulatedDriver {
    ids: Vec<String>,
    camera: Option<SimulatedCamera>,
    resource_initialized: bool,
    resource_fails: bool,
}

impl SimulatedDriver {
    /// Driver with one attached camera.
    pub fn new(camera: SimulatedCamera) -> Self {
        Self {
            ids: vec![camera.id.clone()],
            camera: Some(camera),
            resource_initialized: false,
            resource_fails: false,
        }
    }

    /// Driver with nothing attached.
    pub fn empty() -> Self {
        Self {
            ids: Vec::new(),
            camera: None,
            resource_initialized: false,
            resource_fails: false,
        }
    }

    /// Make `init_resource` fail.
    pub fn with_failing_resource(mut self) -> Self {
        self.resource_fails = true;
        self
    }

    /// Whether the resource pool is currently held.
    pub fn resource_initialized(&self) -> bool {
        self.resource_initialized
    }
}

impl CameraDriver for SimulatedDriver {
    type Camera = SimulatedCamera;

    fn init_resource(&mut self) -> Result<(), QhyError> {
        if self.resource_fails {
            return Err(QhyError::GeneralError);
        }
        self.resource_initialized = true;
        Ok(())
    }

    fn available_devices(&mut self) -> u32 {
        if !self.resource_initialized {
            return 0;
        }
        self.ids.len() as u32
    }

    fn device_id(&mut self, index: u32) -> Result<String, QhyError> {
        self.ids
            .get(index as usize)
            .cloned()
            .ok_or(QhyError::GeneralError)
    }

    fn connect_device(&mut self, id: &str) -> Result<SimulatedCamera, QhyError> {
        match self.camera.take() {
            Some(cam) if cam.id == id && !cam.open_fails => Ok(cam),
            Some(cam) => {
                self.camera = Some(cam);
                Err(QhyError::OpenFailed)
            }
            None => Err(QhyError::OpenFailed),
        }
    }

    fn release_resource(&mut self) -> Result<(), QhyError> {
        if !self.resource_initialized {
            return Err(QhyError::GeneralError);
        }
        self.resource_initialized = false;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct SimWheel {
    slots: u8,
    position: u8,
    target: Option<u8>,
    remaining: u32,
    travel_polls: u32,
    stuck: bool,
    status_failures: u32,
}

/// Simulated single-frame camera.
#[derive(Debug, Clone)]
pub struct SimulatedCamera {
    id: String,
    chip: ChipInfo,
    open_fails: bool,
    stream_mode_fails: bool,
    stream_mode: Option<u8>,
    initialized: bool,
    closed: bool,
    params: HashMap<ControlId, f64>,
    unsupported: HashSet<ControlId>,
    roi: (u32, u32, u32, u32),
    bin: (u32, u32),
    bits: u32,
    read_mode: u32,
    temperature: f64,
    cooling_step: f64,
    cooler_stuck: bool,
    wheel: Option<SimWheel>,
    exposing: bool,
    frame_calls: usize,
    failing_frames: HashSet<usize>,
    exposure_log: Vec<f64>,
    cancel_count: usize,
    calls: Vec<String>,
}

impl SimulatedCamera {
    /// Camera named `id` with a `max_width` × `max_height` sensor at 25 °C.
    pub fn new(id: &str, max_width: u32, max_height: u32) -> Self {
        Self {
            id: id.to_string(),
            chip: ChipInfo {
                chip_width_mm: max_width as f64 * 3.76e-3,
                chip_height_mm: max_height as f64 * 3.76e-3,
                max_width,
                max_height,
                pixel_width_um: 3.76,
                pixel_height_um: 3.76,
                bpp: 16,
            },
            open_fails: false,
            stream_mode_fails: false,
            stream_mode: None,
            initialized: false,
            closed: false,
            params: HashMap::new(),
            unsupported: HashSet::new(),
            roi: (0, 0, max_width, max_height),
            bin: (1, 1),
            bits: 16,
            read_mode: 0,
            temperature: 25.0,
            cooling_step: 0.5,
            cooler_stuck: false,
            wheel: None,
            exposing: false,
            frame_calls: 0,
            failing_frames: HashSet::new(),
            exposure_log: Vec::new(),
            cancel_count: 0,
            calls: Vec::new(),
        }
    }

    /// Geometry of a QHY600M.
    pub fn qhy600m() -> Self {
        Self::new("QHY600M-sim", 9600, 6422)
    }

    /// Start at `celsius`.
    pub fn with_temperature(mut self, celsius: f64) -> Self {
        self.temperature = celsius;
        self
    }

    /// Move by `step` degrees toward the setpoint on every temperature read.
    pub fn with_cooling_step(mut self, step: f64) -> Self {
        self.cooling_step = step;
        self
    }

    /// The cooler never changes the sensor temperature.
    pub fn with_stuck_cooler(mut self) -> Self {
        self.cooler_stuck = true;
        self
    }

    /// Attach a wheel with `slots` positions, sitting at `position`, that
    /// arrives after `travel_polls` status reads.
    pub fn with_filter_wheel(mut self, slots: u8, position: u8, travel_polls: u32) -> Self {
        self.wheel = Some(SimWheel {
            slots,
            position,
            target: None,
            remaining: 0,
            travel_polls,
            stuck: false,
            status_failures: 0,
        });
        self
    }

    /// The attached wheel accepts orders but never moves.
    pub fn with_stuck_wheel(mut self) -> Self {
        if let Some(wheel) = self.wheel.as_mut() {
            wheel.stuck = true;
        }
        self
    }

    /// The next `count` status reads of the attached wheel fail.
    pub fn with_failing_wheel_status(mut self, count: u32) -> Self {
        if let Some(wheel) = self.wheel.as_mut() {
            wheel.status_failures = count;
        }
        self
    }

    /// The `n`th frame retrieval (1-based, counting bias frames) fails.
    pub fn with_failing_frame(mut self, n: usize) -> Self {
        self.failing_frames.insert(n);
        self
    }

    /// The camera rejects every access to `control`.
    pub fn without_control(mut self, control: ControlId) -> Self {
        self.unsupported.insert(control);
        self
    }

    /// `connect_device` fails for this camera.
    pub fn with_failing_open(mut self) -> Self {
        self.open_fails = true;
        self
    }

    /// `set_stream_mode` fails for this camera.
    pub fn with_failing_stream_mode(mut self) -> Self {
        self.stream_mode_fails = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current sensor temperature without advancing the model.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Last value written to `control`.
    pub fn param(&self, control: ControlId) -> Option<f64> {
        self.params.get(&control).copied()
    }

    pub fn roi(&self) -> (u32, u32, u32, u32) {
        self.roi
    }

    pub fn bin(&self) -> (u32, u32) {
        self.bin
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn read_mode(&self) -> u32 {
        self.read_mode
    }

    pub fn stream_mode(&self) -> Option<u8> {
        self.stream_mode
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Filter wheel slot, if a wheel is attached.
    pub fn wheel_position(&self) -> Option<u8> {
        self.wheel.as_ref().map(|w| w.position)
    }

    /// Exposure setting in effect at each frame retrieval.
    pub fn exposure_log(&self) -> &[f64] {
        &self.exposure_log
    }

    pub fn cancel_count(&self) -> usize {
        self.cancel_count
    }

    /// Names of the configuration calls, in order.
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    fn frame_geometry(&self) -> (u32, u32) {
        let (_, _, w, h) = self.roi;
        (w / self.bin.0.max(1), h / self.bin.1.max(1))
    }

    fn ensure_open(&self) -> Result<(), QhyError> {
        if self.closed {
            Err(QhyError::CameraClosed)
        } else {
            Ok(())
        }
    }

    fn cooler_pwm(&self) -> f64 {
        match self.params.get(&ControlId::Cooler) {
            Some(sp) => ((self.temperature - sp).abs() * 50.0).min(255.0),
            None => 0.0,
        }
    }
}

impl CameraDevice for SimulatedCamera {
    fn set_stream_mode(&mut self, mode: u8) -> Result<(), QhyError> {
        self.ensure_open()?;
        if mode > 1 || self.stream_mode_fails {
            return Err(QhyError::GeneralError);
        }
        self.stream_mode = Some(mode);
        Ok(())
    }

    fn init(&mut self) -> Result<(), QhyError> {
        self.ensure_open()?;
        if self.stream_mode.is_none() {
            return Err(QhyError::GeneralError);
        }
        self.initialized = true;
        Ok(())
    }

    fn set_param(&mut self, control: ControlId, value: f64) -> Result<(), QhyError> {
        self.ensure_open()?;
        self.calls.push(format!("set_param({control:?})"));
        if self.unsupported.contains(&control) {
            return Err(QhyError::GeneralError);
        }
        match control {
            ControlId::CurTemp | ControlId::CurPwm => Err(QhyError::GeneralError),
            _ => {
                self.params.insert(control, value);
                Ok(())
            }
        }
    }

    fn get_param(&mut self, control: ControlId) -> Result<f64, QhyError> {
        self.ensure_open()?;
        if self.unsupported.contains(&control) {
            return Err(QhyError::GeneralError);
        }
        match control {
            ControlId::CurTemp => {
                if let (Some(sp), false) = (self.params.get(&ControlId::Cooler), self.cooler_stuck)
                {
                    let diff = sp - self.temperature;
                    let step = self.cooling_step.min(diff.abs());
                    self.temperature += step.copysign(diff);
                }
                Ok(self.temperature)
            }
            ControlId::CurPwm => Ok(self.cooler_pwm()),
            other => self
                .params
                .get(&other)
                .copied()
                .ok_or(QhyError::GeneralError),
        }
    }

    fn is_control_available(&mut self, control: ControlId) -> bool {
        !self.unsupported.contains(&control)
    }

    fn param_range(&mut self, control: ControlId) -> Result<ControlRange, QhyError> {
        if self.unsupported.contains(&control) {
            return Err(QhyError::ControlUnavailable(control));
        }
        let (min, max, step) = match control {
            ControlId::Gain => (0.0, 200.0, 1.0),
            ControlId::Offset => (0.0, 255.0, 1.0),
            ControlId::Exposure => (1.0, 3_600_000_000.0, 1.0),
            ControlId::UsbTraffic => (0.0, 60.0, 1.0),
            ControlId::Cooler => (-50.0, 50.0, 0.1),
            _ => return Err(QhyError::ControlUnavailable(control)),
        };
        Ok(ControlRange { min, max, step })
    }

    fn chip_info(&mut self) -> Result<ChipInfo, QhyError> {
        self.ensure_open()?;
        Ok(self.chip)
    }

    fn set_resolution(
        &mut self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<(), QhyError> {
        self.ensure_open()?;
        self.calls.push("set_resolution".to_string());
        if width == 0
            || height == 0
            || x.checked_add(width).map_or(true, |end| end > self.chip.max_width)
            || y.checked_add(height).map_or(true, |end| end > self.chip.max_height)
        {
            return Err(QhyError::GeneralError);
        }
        self.roi = (x, y, width, height);
        Ok(())
    }

    fn set_bin_mode(&mut self, bin_x: u32, bin_y: u32) -> Result<(), QhyError> {
        self.ensure_open()?;
        self.calls.push("set_bin_mode".to_string());
        if !matches!(bin_x, 1..=4) || !matches!(bin_y, 1..=4) {
            return Err(QhyError::GeneralError);
        }
        self.bin = (bin_x, bin_y);
        Ok(())
    }

    fn set_bits_mode(&mut self, bits: u32) -> Result<(), QhyError> {
        self.ensure_open()?;
        self.calls.push("set_bits_mode".to_string());
        if bits != 8 && bits != 16 {
            return Err(QhyError::GeneralError);
        }
        self.bits = bits;
        Ok(())
    }

    fn set_read_mode(&mut self, mode: u32) -> Result<(), QhyError> {
        self.ensure_open()?;
        self.calls.push("set_read_mode".to_string());
        if mode > 3 {
            return Err(QhyError::GeneralError);
        }
        self.read_mode = mode;
        Ok(())
    }

    fn start_single_frame(&mut self) -> Result<(), QhyError> {
        self.ensure_open()?;
        if !self.initialized {
            return Err(QhyError::GeneralError);
        }
        self.exposing = true;
        Ok(())
    }

    fn mem_length(&mut self) -> u32 {
        if self.closed {
            return 0;
        }
        self.chip.max_width * self.chip.max_height * 2
    }

    fn get_single_frame(&mut self, buffer: &mut [u8]) -> Result<FrameInfo, QhyError> {
        self.ensure_open()?;
        if !self.exposing {
            return Err(QhyError::GeneralError);
        }
        self.exposing = false;
        self.frame_calls += 1;
        self.exposure_log
            .push(self.params.get(&ControlId::Exposure).copied().unwrap_or(0.0));
        if self.failing_frames.contains(&self.frame_calls) {
            return Err(QhyError::GeneralError);
        }

        let (width, height) = self.frame_geometry();
        let bytes_per_pixel = if self.bits > 8 { 2 } else { 1 };
        let needed = (width * height) as usize * bytes_per_pixel;
        if buffer.len() < needed {
            return Err(QhyError::BufferTooSmall {
                needed,
                have: buffer.len(),
            });
        }

        let gain = self.params.get(&ControlId::Gain).copied().unwrap_or(0.0) as u16;
        let offset = self.params.get(&ControlId::Offset).copied().unwrap_or(0.0) as u16;
        for y in 0..height {
            for x in 0..width {
                let idx = (y * width + x) as usize;
                let value = offset
                    .wrapping_mul(16)
                    .wrapping_add(((x + y) as u16).wrapping_mul(gain.wrapping_add(1)));
                if bytes_per_pixel == 2 {
                    buffer[2 * idx..2 * idx + 2].copy_from_slice(&value.to_ne_bytes());
                } else {
                    buffer[idx] = value as u8;
                }
            }
        }
        Ok(FrameInfo {
            width,
            height,
            bpp: self.bits,
            channels: 1,
        })
    }

    fn cancel_exposing_and_readout(&mut self) -> Result<(), QhyError> {
        self.ensure_open()?;
        self.exposing = false;
        self.cancel_count += 1;
        Ok(())
    }

    fn cfw_plugged(&mut self) -> bool {
        self.wheel.is_some()
    }

    fn cfw_status(&mut self) -> Result<u8, QhyError> {
        self.ensure_open()?;
        let wheel = self.wheel.as_mut().ok_or(QhyError::GeneralError)?;
        if wheel.status_failures > 0 {
            wheel.status_failures -= 1;
            return Err(QhyError::GeneralError);
        }
        if let Some(target) = wheel.target {
            if !wheel.stuck {
                if wheel.remaining == 0 {
                    wheel.position = target;
                    wheel.target = None;
                } else {
                    wheel.remaining -= 1;
                }
            }
        }
        Ok(b'0' + wheel.position)
    }

    fn cfw_move(&mut self, order: u8) -> Result<(), QhyError> {
        self.ensure_open()?;
        let wheel = self.wheel.as_mut().ok_or(QhyError::GeneralError)?;
        let slot = order.wrapping_sub(b'0');
        if slot >= wheel.slots {
            return Err(QhyError::GeneralError);
        }
        wheel.target = Some(slot);
        wheel.remaining = wheel.travel_polls;
        Ok(())
    }

    fn close(&mut self) -> Result<(), QhyError> {
        self.ensure_open()?;
        self.closed = true;
        Ok(())
    }
}
