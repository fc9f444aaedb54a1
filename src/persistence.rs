//! Output files: one FITS image per exposure, optionally with a PNG preview.

use std::{
    fs,
    path::{Path, PathBuf},
};

use fitsio::{
    images::{ImageDescription, ImageType},
    FitsFile,
};
use image::{imageops::FilterType, DynamicImage, ImageBuffer, Luma};
use log::info;

/// Longest edge of a PNG preview.
pub const PREVIEW_MAX_EDGE: u32 = 1024;

/// Settings that produced a frame, written to the FITS header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMetadata {
    /// Temperature setpoint in °C.
    pub temperature: f64,
    /// Sensor temperature measured before the exposure, if it could be read.
    pub ccd_temperature: Option<f64>,
    pub exposure_us: u64,
    pub gain: u32,
    pub offset: u32,
    pub read_mode: u32,
    /// Capture time, seconds since the Unix epoch.
    pub unix_time: i64,
}

/// A frame ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub pixels: Vec<u16>,
    pub width: u32,
    pub height: u32,
    /// Depth the camera delivered; 8-bit frames are widened before writing.
    pub bits_per_pixel: u32,
    pub metadata: FrameMetadata,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("frame is {width}x{height} but holds {pixels} pixels")]
    Shape {
        width: u32,
        height: u32,
        pixels: usize,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("FITS error: {0}")]
    Fits(#[from] fitsio::errors::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Build `<base>_<ts>_exp_<exp>us_gain_<g>_offset_<o>_temp_<t>_<index>.fits`.
///
/// The temperature is truncated toward zero.
pub fn output_path(
    base: &str,
    timestamp: i64,
    exposure_us: u64,
    gain: u32,
    offset: u32,
    temperature: f64,
    index: u32,
) -> PathBuf {
    PathBuf::from(format!(
        "{base}_{timestamp}_exp_{exposure_us}us_gain_{gain}_offset_{offset}_temp_{}_{index}.fits",
        temperature.trunc() as i64
    ))
}

fn check_shape(record: &OutputRecord) -> Result<(), PersistError> {
    let expected = record.width as usize * record.height as usize;
    if record.pixels.len() != expected || expected == 0 {
        return Err(PersistError::Shape {
            width: record.width,
            height: record.height,
            pixels: record.pixels.len(),
        });
    }
    Ok(())
}

fn prepare_path(path: &Path) -> Result<(), PersistError> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Write `record` as a 16-bit FITS image, replacing any file at `path`.
pub fn write_fits(record: &OutputRecord, path: &Path) -> Result<(), PersistError> {
    check_shape(record)?;
    prepare_path(path)?;

    let desc = ImageDescription {
        data_type: ImageType::UnsignedShort,
        dimensions: &[record.height as usize, record.width as usize],
    };
    let mut fptr = FitsFile::create(path).with_custom_primary(&desc).open()?;
    let hdu = fptr.primary_hdu()?;
    let meta = &record.metadata;
    hdu.write_key(&mut fptr, "INTTEMP", meta.temperature)?;
    hdu.write_key(&mut fptr, "EXPTIME", meta.exposure_us as i64)?;
    hdu.write_key(&mut fptr, "OFFSET", meta.offset as i64)?;
    hdu.write_key(&mut fptr, "GAIN", meta.gain as i64)?;
    hdu.write_key(&mut fptr, "READMODE", meta.read_mode as i64)?;
    hdu.write_key(&mut fptr, "TIME", meta.unix_time)?;
    hdu.write_key(&mut fptr, "BITDEPTH", record.bits_per_pixel as i64)?;
    if let Some(ccd) = meta.ccd_temperature {
        hdu.write_key(&mut fptr, "CCDTEMP", ccd)?;
    }
    hdu.write_image(&mut fptr, &record.pixels)?;
    info!("Saved {}", path.display());
    Ok(())
}

/// Write a greyscale PNG preview of `record`, downscaled so neither edge
/// exceeds [`PREVIEW_MAX_EDGE`].
pub fn write_png_preview(record: &OutputRecord, path: &Path) -> Result<(), PersistError> {
    check_shape(record)?;
    prepare_path(path)?;

    let buf: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::from_raw(record.width, record.height, record.pixels.clone()).ok_or(
            PersistError::Shape {
                width: record.width,
                height: record.height,
                pixels: record.pixels.len(),
            },
        )?;
    let mut img = DynamicImage::ImageLuma16(buf);
    if record.width.max(record.height) > PREVIEW_MAX_EDGE {
        img = img.resize(PREVIEW_MAX_EDGE, PREVIEW_MAX_EDGE, FilterType::Nearest);
    }
    img.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use fitsio::hdu::HduInfo;

    use super::*;

    fn record(width: u32, height: u32) -> OutputRecord {
        OutputRecord {
            pixels: (0..width * height).map(|v| (v * 7) as u16).collect(),
            width,
            height,
            bits_per_pixel: 16,
            metadata: FrameMetadata {
                temperature: -12.5,
                ccd_temperature: Some(-12.4),
                exposure_us: 5_000_000,
                gain: 56,
                offset: 20,
                read_mode: 1,
                unix_time: 1_700_000_000,
            },
        }
    }

    #[test]
    fn filename_is_deterministic() {
        assert_eq!(
            output_path("img", 1000, 5_000_000, 56, 20, 18.0, 0),
            PathBuf::from("img_1000_exp_5000000us_gain_56_offset_20_temp_18_0.fits")
        );
        assert_eq!(
            output_path("/data/qhy", 7, 100, 0, 5, -5.7, 3),
            PathBuf::from("/data/qhy_7_exp_100us_gain_0_offset_5_temp_-5_3.fits")
        );
    }

    #[test]
    fn fits_header_and_pixels_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.fits");
        let rec = record(5, 3);
        write_fits(&rec, &path).unwrap();

        let mut f = FitsFile::open(&path).unwrap();
        let hdu = f.primary_hdu().unwrap();
        assert_eq!(hdu.read_key::<f64>(&mut f, "INTTEMP").unwrap(), -12.5);
        assert!((hdu.read_key::<f64>(&mut f, "CCDTEMP").unwrap() + 12.4).abs() < 1e-6);
        assert_eq!(hdu.read_key::<i64>(&mut f, "EXPTIME").unwrap(), 5_000_000);
        assert_eq!(hdu.read_key::<i64>(&mut f, "GAIN").unwrap(), 56);
        assert_eq!(hdu.read_key::<i64>(&mut f, "OFFSET").unwrap(), 20);
        assert_eq!(hdu.read_key::<i64>(&mut f, "READMODE").unwrap(), 1);
        assert_eq!(hdu.read_key::<i64>(&mut f, "TIME").unwrap(), 1_700_000_000);
        assert_eq!(hdu.read_key::<i64>(&mut f, "BITDEPTH").unwrap(), 16);
        match &hdu.info {
            HduInfo::ImageInfo { shape, .. } => assert_eq!(shape, &vec![3, 5]),
            other => panic!("expected an image HDU, got {other:?}"),
        }
        let pixels: Vec<u16> = hdu.read_image(&mut f).unwrap();
        assert_eq!(pixels, rec.pixels);
    }

    #[test]
    fn existing_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("frame.fits");
        write_fits(&record(4, 4), &path).unwrap();
        let mut rec = record(2, 2);
        rec.metadata.gain = 60;
        write_fits(&rec, &path).unwrap();

        let mut f = FitsFile::open(&path).unwrap();
        let hdu = f.primary_hdu().unwrap();
        assert_eq!(hdu.read_key::<i64>(&mut f, "GAIN").unwrap(), 60);
        let pixels: Vec<u16> = hdu.read_image(&mut f).unwrap();
        assert_eq!(pixels.len(), 4);
    }

    #[test]
    fn mismatched_shape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = record(4, 4);
        rec.pixels.pop();
        let path = dir.path().join("bad.fits");
        assert!(matches!(
            write_fits(&rec, &path),
            Err(PersistError::Shape { pixels: 15, .. })
        ));
        assert!(!path.exists());
    }

    #[test]
    fn preview_is_downscaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        write_png_preview(&record(2048, 16), &path).unwrap();
        let img = image::open(&path).unwrap();
        assert_eq!(img.width(), PREVIEW_MAX_EDGE);
        assert!(img.height() <= 16);
    }
}
