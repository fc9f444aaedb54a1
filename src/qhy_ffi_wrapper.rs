use std::ffi::{c_char, CStr};

use crate::{device::ControlId, qhy_ffi::*};

/// Call an SDK function returning a status word. On anything but
/// `QHYCCD_SUCCESS` the failure is logged and returned from the enclosing
/// function.
#[macro_export]
macro_rules! QHYCALL {
    ($func:ident($($arg:expr),*)) => {
        {
            #[allow(clippy::macro_metavars_in_unsafe)]
            let res = unsafe { $func($($arg),*) };
            if let Err(e) = $crate::device::check_status(res) {
                log::warn!("Error calling {}(): {:?}", stringify!($func), e);
                return Err(e);
            }
        }
    };
}

/// `GetQHYCCDParam` reports failure in-band.
pub(crate) const PARAM_ERROR: f64 = crate::device::QHYCCD_ERROR as f64;

pub(crate) fn control_id(control: ControlId) -> CONTROL_ID {
    match control {
        ControlId::Gain => CONTROL_ID_CONTROL_GAIN,
        ControlId::Offset => CONTROL_ID_CONTROL_OFFSET,
        ControlId::Exposure => CONTROL_ID_CONTROL_EXPOSURE,
        ControlId::TransferBit => CONTROL_ID_CONTROL_TRANSFERBIT,
        ControlId::UsbTraffic => CONTROL_ID_CONTROL_USBTRAFFIC,
        ControlId::CurTemp => CONTROL_ID_CONTROL_CURTEMP,
        ControlId::CurPwm => CONTROL_ID_CONTROL_CURPWM,
        ControlId::ManualPwm => CONTROL_ID_CONTROL_MANULPWM,
        ControlId::Cooler => CONTROL_ID_CONTROL_COOLER,
    }
}

/// Read a NUL-terminated id out of a fixed buffer.
pub(crate) fn id_from_buf(buf: &[c_char]) -> String {
    if !buf.contains(&0) {
        return String::new();
    }
    // Safety: the buffer holds a NUL terminator.
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_ids_match_sdk_numbering() {
        for control in [
            ControlId::Gain,
            ControlId::Offset,
            ControlId::Exposure,
            ControlId::TransferBit,
            ControlId::UsbTraffic,
            ControlId::CurTemp,
            ControlId::CurPwm,
            ControlId::ManualPwm,
            ControlId::Cooler,
        ] {
            assert_eq!(control_id(control) as u32, control.raw(), "{control:?}");
        }
    }

    #[test]
    fn unterminated_id_is_empty() {
        let buf = [b'Q' as c_char; 4];
        assert_eq!(id_from_buf(&buf), "");
        let buf = [b'Q' as c_char, b'H' as c_char, b'Y' as c_char, 0];
        assert_eq!(id_from_buf(&buf), "QHY");
    }
}
