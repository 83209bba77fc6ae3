use image::{GrayImage, ImageBuffer, RgbImage};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture as V4lCapture;
use v4l::{Device, FourCC};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to open camera device: {0}")]
    DeviceOpen(String),
    #[error("Failed to read from video device: {0}")]
    Capture(String),
    #[error("Frame conversion failed: {0}")]
    Conversion(String),
    #[error("V4L2 error: {0}")]
    V4L(#[from] std::io::Error),
}

/// Where frames come from: a device index or a device path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraSource {
    Index(u32),
    Path(PathBuf),
}

impl CameraSource {
    /// Integers select a device index, anything else is a path
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        match value.parse::<u32>() {
            Ok(index) => CameraSource::Index(index),
            Err(_) => CameraSource::Path(PathBuf::from(value)),
        }
    }

    fn open(&self) -> Result<Device, CaptureError> {
        match self {
            CameraSource::Index(index) => Device::new(*index as usize)
                .map_err(|e| CaptureError::DeviceOpen(format!("{}: {}", self, e))),
            CameraSource::Path(path) => Device::with_path(path)
                .map_err(|e| CaptureError::DeviceOpen(format!("{}: {}", self, e))),
        }
    }
}

impl fmt::Display for CameraSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraSource::Index(index) => write!(f, "/dev/video{}", index),
            CameraSource::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

impl Serialize for CameraSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CameraSource::Index(index) => serializer.serialize_u32(*index),
            CameraSource::Path(path) => serializer.serialize_str(&path.to_string_lossy()),
        }
    }
}

impl<'de> Deserialize<'de> for CameraSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Index(u32),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Index(index) => CameraSource::Index(index),
            Raw::Text(text) => CameraSource::parse(&text),
        })
    }
}

/// A source of grayscale frames.
///
/// Implementations hold their device for as long as they live and release it
/// when dropped.
pub trait CaptureSource {
    /// Read the next frame as a single-channel image
    fn read_frame(&mut self) -> Result<GrayImage, CaptureError>;

    /// Human readable name of the underlying device
    fn describe(&self) -> String;
}

pub struct Camera {
    // Declared before `device` so streaming stops before the handle closes
    stream: Option<MmapStream<'static>>,
    device: Device,
    source: CameraSource,
    width: u32,
    height: u32,
    format: FourCC,
}

impl Camera {
    /// Open a camera and negotiate the requested resolution
    pub fn open(source: &CameraSource, width: u32, height: u32) -> Result<Self, CaptureError> {
        let device = source.open()?;

        let fmt = device
            .format()
            .map_err(|e| CaptureError::DeviceOpen(format!("Failed to get format: {}", e)))?;

        let mut format = fmt.clone();
        format.width = width;
        format.height = height;

        // Prefer MJPEG if available, fallback to YUYV
        let preferred_formats = [FourCC::new(b"MJPG"), FourCC::new(b"YUYV")];

        for &fourcc in &preferred_formats {
            format.fourcc = fourcc;
            if device.set_format(&format).is_ok() {
                break;
            }
        }

        let actual_format = device
            .format()
            .map_err(|e| CaptureError::DeviceOpen(format!("Failed to verify format: {}", e)))?;

        log::info!(
            "Camera {} opened: {}x{} {}",
            source,
            actual_format.width,
            actual_format.height,
            actual_format.fourcc
        );

        Ok(Self {
            stream: None,
            device,
            source: source.clone(),
            width: actual_format.width,
            height: actual_format.height,
            format: actual_format.fourcc,
        })
    }

    /// Capture a single color frame.
    ///
    /// Streaming starts on the first call and stays on until the camera is
    /// dropped.
    pub fn capture_rgb(&mut self) -> Result<RgbImage, CaptureError> {
        if self.stream.is_none() {
            let stream =
                MmapStream::with_buffers(&self.device, v4l::buffer::Type::VideoCapture, 4)
                    .map_err(|e| {
                        CaptureError::Capture(format!("Failed to create stream: {}", e))
                    })?;
            log::debug!("Streaming started on {}", self.source);
            self.stream = Some(stream);
        }

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CaptureError::Capture("Stream not started".to_string()))?;

        let (buf, _meta) = stream
            .next()
            .map_err(|e| CaptureError::Capture(e.to_string()))?;

        match self.format.str() {
            Ok("MJPG") => decode_mjpeg(buf),
            Ok("YUYV") => decode_yuyv(buf, self.width, self.height),
            _ => Err(CaptureError::Conversion(format!(
                "Unsupported pixel format: {}",
                self.format
            ))),
        }
    }

    /// Enumerate available camera devices
    pub fn list_devices() -> Result<Vec<String>, CaptureError> {
        let mut devices = Vec::new();

        for entry in fs::read_dir("/dev")
            .map_err(|e| CaptureError::DeviceOpen(format!("Failed to read /dev: {}", e)))?
        {
            let entry = entry.map_err(|e| CaptureError::DeviceOpen(e.to_string()))?;
            let path = entry.path();

            let is_video = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with("video"))
                .unwrap_or(false);

            if is_video {
                devices.push(path.to_string_lossy().into_owned());
            }
        }

        devices.sort();
        Ok(devices)
    }
}

impl CaptureSource for Camera {
    fn read_frame(&mut self) -> Result<GrayImage, CaptureError> {
        let rgb = self.capture_rgb()?;
        Ok(image::imageops::grayscale(&rgb))
    }

    fn describe(&self) -> String {
        self.source.to_string()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        // The v4l handle closes with `device`
        log::debug!("Releasing camera {}", self.source);
    }
}

/// Decode MJPEG frame to RGB
fn decode_mjpeg(data: &[u8]) -> Result<RgbImage, CaptureError> {
    let img = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)
        .map_err(|e| CaptureError::Conversion(format!("MJPEG decode failed: {}", e)))?;

    Ok(img.to_rgb8())
}

/// Decode YUYV frame to RGB
fn decode_yuyv(data: &[u8], width: u32, height: u32) -> Result<RgbImage, CaptureError> {
    let width = width as usize;
    let height = height as usize;

    if data.len() < width * height * 2 {
        return Err(CaptureError::Conversion("YUYV buffer too small".to_string()));
    }

    let mut rgb_data = vec![0u8; width * height * 3];

    // YUYV format: Y0 U Y1 V (2 pixels in 4 bytes)
    for y in 0..height {
        for x in 0..(width / 2) {
            let yuyv_offset = (y * width * 2) + (x * 4);
            let rgb_offset = (y * width * 3) + (x * 2 * 3);

            let u = data[yuyv_offset + 1] as i32 - 128;
            let v = data[yuyv_offset + 3] as i32 - 128;

            for (pixel, luma_offset) in [(0, 0), (1, 2)] {
                let luma = data[yuyv_offset + luma_offset] as i32;
                let out = rgb_offset + pixel * 3;
                rgb_data[out] = (luma + ((1436 * v) >> 10)).clamp(0, 255) as u8;
                rgb_data[out + 1] = (luma - ((354 * u + 732 * v) >> 10)).clamp(0, 255) as u8;
                rgb_data[out + 2] = (luma + ((1814 * u) >> 10)).clamp(0, 255) as u8;
            }
        }
    }

    ImageBuffer::from_raw(width as u32, height as u32, rgb_data)
        .ok_or_else(|| CaptureError::Conversion("Failed to create RGB image".to_string()))
}
