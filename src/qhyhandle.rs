use std::{
    ffi::{c_char, CString},
    ptr,
};

use log::warn;

use crate::{
    device::{
        CameraDevice, CameraDriver, ChipInfo, ControlId, ControlRange, FrameInfo, QhyError,
        QHYCCD_READ_DIRECTLY, QHYCCD_SUCCESS,
    },
    qhy_ffi::{
        qhyccd_handle, CancelQHYCCDExposingAndReadout, CloseQHYCCD, ExpQHYCCDSingleFrame,
        GetQHYCCDCFWStatus, GetQHYCCDChipInfo, GetQHYCCDId, GetQHYCCDMemLength, GetQHYCCDParam,
        GetQHYCCDParamMinMaxStep, GetQHYCCDSingleFrame, InitQHYCCD, InitQHYCCDResource,
        IsQHYCCDCFWPlugged, IsQHYCCDControlAvailable, OpenQHYCCD, ReleaseQHYCCDResource,
        ScanQHYCCD, SendOrder2QHYCCDCFW, SetQHYCCDBinMode, SetQHYCCDBitsMode, SetQHYCCDParam,
        SetQHYCCDReadMode, SetQHYCCDResolution, SetQHYCCDStreamMode,
    },
    qhy_ffi_wrapper::{control_id, id_from_buf, PARAM_ERROR},
    QHYCALL,
};

/// Length of the id and filter wheel status buffers handed to the SDK.
const ID_LEN: usize = 64;

/// Entry points of the vendor SDK.
#[derive(Debug, Default)]
pub struct QhyDriver {
    initialized: bool,
}

impl QhyDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CameraDriver for QhyDriver {
    type Camera = QhyHandle;

    fn init_resource(&mut self) -> Result<(), QhyError> {
        QHYCALL!(InitQHYCCDResource());
        self.initialized = true;
        Ok(())
    }

    fn available_devices(&mut self) -> u32 {
        if !self.initialized {
            return 0;
        }
        match unsafe { ScanQHYCCD() } {
            crate::device::QHYCCD_ERROR => 0,
            n => n,
        }
    }

    fn device_id(&mut self, index: u32) -> Result<String, QhyError> {
        let mut id = [0 as c_char; ID_LEN];
        QHYCALL!(GetQHYCCDId(index, id.as_mut_ptr()));
        Ok(id_from_buf(&id))
    }

    fn connect_device(&mut self, id: &str) -> Result<QhyHandle, QhyError> {
        let id = CString::new(id).map_err(|_| QhyError::OpenFailed)?;
        let handle = unsafe { OpenQHYCCD(id.as_ptr() as *mut c_char) };
        if handle.is_null() {
            warn!("OpenQHYCCD({id:?}) returned a null handle");
            return Err(QhyError::OpenFailed);
        }
        Ok(QhyHandle {
            handle,
            closed: false,
        })
    }

    fn release_resource(&mut self) -> Result<(), QhyError> {
        QHYCALL!(ReleaseQHYCCDResource());
        self.initialized = false;
        Ok(())
    }
}

/// An open camera.
#[derive(Debug)]
pub struct QhyHandle {
    handle: *mut qhyccd_handle,
    closed: bool,
}

impl Drop for QhyHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let ret = unsafe { CancelQHYCCDExposingAndReadout(self.handle) };
        if ret != QHYCCD_SUCCESS {
            warn!("Failed to cancel exposure: {:?}", QhyError::from(ret));
        }
        let ret = unsafe { CloseQHYCCD(self.handle) };
        if ret != QHYCCD_SUCCESS {
            warn!("Failed to close camera: {:?}", QhyError::from(ret));
        }
        self.handle = ptr::null_mut();
    }
}

impl QhyHandle {
    fn handle(&self) -> Result<*mut qhyccd_handle, QhyError> {
        if self.closed {
            Err(QhyError::CameraClosed)
        } else {
            Ok(self.handle)
        }
    }
}

impl CameraDevice for QhyHandle {
    fn set_stream_mode(&mut self, mode: u8) -> Result<(), QhyError> {
        let handle = self.handle()?;
        QHYCALL!(SetQHYCCDStreamMode(handle, mode));
        Ok(())
    }

    fn init(&mut self) -> Result<(), QhyError> {
        let handle = self.handle()?;
        QHYCALL!(InitQHYCCD(handle));
        Ok(())
    }

    fn set_param(&mut self, control: ControlId, value: f64) -> Result<(), QhyError> {
        let handle = self.handle()?;
        QHYCALL!(SetQHYCCDParam(handle, control_id(control), value));
        Ok(())
    }

    fn get_param(&mut self, control: ControlId) -> Result<f64, QhyError> {
        let handle = self.handle()?;
        let value = unsafe { GetQHYCCDParam(handle, control_id(control)) };
        if value == PARAM_ERROR {
            warn!("Error calling GetQHYCCDParam({control:?})");
            return Err(QhyError::GeneralError);
        }
        Ok(value)
    }

    fn is_control_available(&mut self, control: ControlId) -> bool {
        match self.handle() {
            Ok(handle) => {
                unsafe { IsQHYCCDControlAvailable(handle, control_id(control)) } == QHYCCD_SUCCESS
            }
            Err(_) => false,
        }
    }

    fn param_range(&mut self, control: ControlId) -> Result<ControlRange, QhyError> {
        let handle = self.handle()?;
        let (mut min, mut max, mut step) = (0.0, 0.0, 0.0);
        QHYCALL!(GetQHYCCDParamMinMaxStep(
            handle,
            control_id(control),
            &mut min,
            &mut max,
            &mut step
        ));
        Ok(ControlRange { min, max, step })
    }

    fn chip_info(&mut self) -> Result<ChipInfo, QhyError> {
        let handle = self.handle()?;
        let (mut chip_w, mut chip_h, mut pix_w, mut pix_h) = (0.0, 0.0, 0.0, 0.0);
        let (mut max_w, mut max_h, mut bpp) = (0, 0, 0);
        QHYCALL!(GetQHYCCDChipInfo(
            handle,
            &mut chip_w,
            &mut chip_h,
            &mut max_w,
            &mut max_h,
            &mut pix_w,
            &mut pix_h,
            &mut bpp
        ));
        Ok(ChipInfo {
            chip_width_mm: chip_w,
            chip_height_mm: chip_h,
            max_width: max_w,
            max_height: max_h,
            pixel_width_um: pix_w,
            pixel_height_um: pix_h,
            bpp,
        })
    }

    fn set_resolution(
        &mut self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<(), QhyError> {
        let handle = self.handle()?;
        QHYCALL!(SetQHYCCDResolution(handle, x, y, width, height));
        Ok(())
    }

    fn set_bin_mode(&mut self, bin_x: u32, bin_y: u32) -> Result<(), QhyError> {
        let handle = self.handle()?;
        QHYCALL!(SetQHYCCDBinMode(handle, bin_x, bin_y));
        Ok(())
    }

    fn set_bits_mode(&mut self, bits: u32) -> Result<(), QhyError> {
        let handle = self.handle()?;
        QHYCALL!(SetQHYCCDBitsMode(handle, bits));
        Ok(())
    }

    fn set_read_mode(&mut self, mode: u32) -> Result<(), QhyError> {
        let handle = self.handle()?;
        QHYCALL!(SetQHYCCDReadMode(handle, mode));
        Ok(())
    }

    fn start_single_frame(&mut self) -> Result<(), QhyError> {
        let handle = self.handle()?;
        match unsafe { ExpQHYCCDSingleFrame(handle) } {
            QHYCCD_SUCCESS | QHYCCD_READ_DIRECTLY => Ok(()),
            res => {
                warn!(
                    "Error calling ExpQHYCCDSingleFrame(): {:?}",
                    QhyError::from(res)
                );
                Err(res.into())
            }
        }
    }

    fn mem_length(&mut self) -> u32 {
        match self.handle() {
            Ok(handle) => unsafe { GetQHYCCDMemLength(handle) },
            Err(_) => 0,
        }
    }

    fn get_single_frame(&mut self, buffer: &mut [u8]) -> Result<FrameInfo, QhyError> {
        let handle = self.handle()?;
        let needed = unsafe { GetQHYCCDMemLength(handle) } as usize;
        if buffer.len() < needed {
            return Err(QhyError::BufferTooSmall {
                needed,
                have: buffer.len(),
            });
        }
        let (mut width, mut height, mut bpp, mut channels) = (0, 0, 0, 0);
        QHYCALL!(GetQHYCCDSingleFrame(
            handle,
            &mut width,
            &mut height,
            &mut bpp,
            &mut channels,
            buffer.as_mut_ptr()
        ));
        Ok(FrameInfo {
            width,
            height,
            bpp,
            channels,
        })
    }

    fn cancel_exposing_and_readout(&mut self) -> Result<(), QhyError> {
        let handle = self.handle()?;
        QHYCALL!(CancelQHYCCDExposingAndReadout(handle));
        Ok(())
    }

    fn cfw_plugged(&mut self) -> bool {
        match self.handle() {
            Ok(handle) => unsafe { IsQHYCCDCFWPlugged(handle) } == QHYCCD_SUCCESS,
            Err(_) => false,
        }
    }

    fn cfw_status(&mut self) -> Result<u8, QhyError> {
        let handle = self.handle()?;
        let mut status = [0 as c_char; ID_LEN];
        QHYCALL!(GetQHYCCDCFWStatus(handle, status.as_mut_ptr()));
        Ok(status[0] as u8)
    }

    fn cfw_move(&mut self, order: u8) -> Result<(), QhyError> {
        let handle = self.handle()?;
        let mut order = [order as c_char];
        QHYCALL!(SendOrder2QHYCCDCFW(handle, order.as_mut_ptr(), 1));
        Ok(())
    }

    fn close(&mut self) -> Result<(), QhyError> {
        let handle = self.handle()?;
        QHYCALL!(CloseQHYCCD(handle));
        self.closed = true;
        Ok(())
    }
}
