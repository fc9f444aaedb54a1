//! Single-frame exposure sequencing.

use std::{thread::sleep, time::Duration};

use log::{info, warn};

use crate::device::{CameraDevice, ControlId, FrameInfo, QhyError};

/// Zeroed frame buffer sized by the device-reported byte length.
///
/// Storage is kept as 16-bit words so a 16-bit frame can be handed to the
/// writer without copying; the byte view passed to the device is exactly the
/// requested length.
#[derive(Debug)]
pub struct FrameBuffer {
    words: Vec<u16>,
    len: usize,
}

impl FrameBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0; (len + 1) / 2],
            len,
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }

    /// Convert the first `width * height` pixels to 16-bit values. 8-bit
    /// frames are widened.
    pub fn into_pixels(mut self, info: &FrameInfo) -> Result<Vec<u16>, CaptureError> {
        if info.channels != 1 {
            return Err(CaptureError::UnsupportedChannels(info.channels));
        }
        let count = info.width as usize * info.height as usize;
        let bytes_per_pixel = if info.bpp > 8 { 2 } else { 1 };
        let needed = count * bytes_per_pixel;
        if needed > self.len {
            return Err(CaptureError::ShortFrame {
                needed,
                have: self.len,
            });
        }
        if bytes_per_pixel == 2 {
            self.words.truncate(count);
            Ok(self.words)
        } else {
            Ok(self.as_bytes()[..count].iter().map(|&b| b as u16).collect())
        }
    }
}

/// A retrieved frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub pixels: Vec<u16>,
    pub info: FrameInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("could not start exposure: {0}")]
    Start(QhyError),
    #[error("device reported a zero-length frame buffer")]
    NoBuffer,
    #[error("could not grab image data from camera: {0}")]
    Readout(QhyError),
    #[error("frame has {0} channels, only single-channel frames are supported")]
    UnsupportedChannels(u32),
    #[error("frame needs {needed} bytes but the buffer holds {have}")]
    ShortFrame { needed: usize, have: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureOptions {
    /// Throwaway frames taken before the real exposure.
    pub bias_frames: u32,
    /// Exposure used for the throwaway frames, in microseconds.
    pub bias_exposure_us: u64,
    /// Wait between the last throwaway frame and the real exposure.
    pub bias_settle: Duration,
}

impl Default for ExposureOptions {
    fn default() -> Self {
        Self {
            bias_frames: 0,
            bias_exposure_us: 100,
            bias_settle: Duration::from_secs(3),
        }
    }
}

/// Start an exposure and read the frame into a freshly allocated buffer.
fn expose_once<D: CameraDevice>(dev: &mut D) -> Result<Frame, CaptureError> {
    dev.start_single_frame().map_err(CaptureError::Start)?;
    let length = dev.mem_length() as usize;
    if length == 0 {
        return Err(CaptureError::NoBuffer);
    }
    let mut buffer = FrameBuffer::zeroed(length);
    info!("Buffer length = {length}");
    let info = dev
        .get_single_frame(buffer.as_bytes_mut())
        .map_err(CaptureError::Readout)?;
    let pixels = buffer.into_pixels(&info)?;
    Ok(Frame { pixels, info })
}

/// Flush the sensor with `opts.bias_frames` minimal exposures whose data is
/// dropped. The exposure control is restored to `exposure_us` afterwards,
/// whether or not the flush succeeded.
fn discard_bias_frames<D: CameraDevice>(dev: &mut D, exposure_us: u64, opts: &ExposureOptions) {
    if opts.bias_frames == 0 {
        return;
    }
    if let Err(e) = dev.set_param(ControlId::Exposure, opts.bias_exposure_us as f64) {
        warn!("Could not set bias exposure: {e}");
    }
    for n in 1..=opts.bias_frames {
        match expose_once(dev) {
            Ok(frame) => info!(
                "Discarded bias frame {n}/{} ({}x{})",
                opts.bias_frames, frame.info.width, frame.info.height
            ),
            Err(e) => warn!("Bias frame {n}/{} failed: {e}", opts.bias_frames),
        }
    }
    if let Err(e) = dev.cancel_exposing_and_readout() {
        warn!("Could not cancel exposure and readout: {e}");
    }
    sleep(opts.bias_settle);
    if let Err(e) = dev.set_param(ControlId::Exposure, exposure_us as f64) {
        warn!("Could not restore exposure to {exposure_us} us: {e}");
    }
}

/// Take one frame at `exposure_us`, preceded by the configured bias flush.
///
/// The device is told to cancel any exposure or readout once the frame has
/// been retrieved or the attempt has failed, so it is idle for the next call.
pub fn capture_frame<D: CameraDevice>(
    dev: &mut D,
    exposure_us: u64,
    opts: &ExposureOptions,
) -> Result<Frame, CaptureError> {
    discard_bias_frames(dev, exposure_us, opts);
    let res = expose_once(dev);
    match &res {
        Ok(frame) => info!(
            "Got image of size {}x{}, bpp {}, channels {}",
            frame.info.width, frame.info.height, frame.info.bpp, frame.info.channels
        ),
        Err(e) => warn!("{e}"),
    }
    if let Err(e) = dev.cancel_exposing_and_readout() {
        warn!("Could not cancel exposure and readout: {e}");
    }
    res
}
