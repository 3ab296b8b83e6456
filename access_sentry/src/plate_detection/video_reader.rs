use anyhow::{anyhow, Result};
use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;
use opencv::prelude::VideoCaptureTrait;
use opencv::prelude::VideoCaptureTraitConst;
use opencv::videoio::VideoCapture;
use opencv::videoio::CAP_ANY;
use opencv::videoio::CAP_PROP_FRAME_HEIGHT;
use opencv::videoio::CAP_PROP_FRAME_WIDTH;
use serde::Deserialize;
use tracing::{info, warn};

use super::CaptureDevice;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraSettings {
    /// Either a device index ("0") or a file path / stream url.
    pub source: String,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            source: "0".to_string(),
            width: 1920,
            height: 1080,
        }
    }
}

pub struct VideoReader {
    capture: VideoCapture,
    frames: u64,
}

impl VideoReader {
    pub fn open(settings: &CameraSettings) -> Result<Self> {
        let mut capture = match settings.source.trim().parse::<i32>() {
            Ok(index) => VideoCapture::new(index, CAP_ANY)?,
            Err(_) => VideoCapture::from_file(&settings.source, CAP_ANY)?,
        };
        if !capture.is_opened()? {
            return Err(anyhow!("could not open camera {}", settings.source));
        }
        if !capture.set(CAP_PROP_FRAME_WIDTH, settings.width as f64)?
            || !capture.set(CAP_PROP_FRAME_HEIGHT, settings.height as f64)?
        {
            warn!(
                source = %settings.source,
                "camera rejected the requested {}x{} resolution",
                settings.width,
                settings.height
            );
        }
        info!(source = %settings.source, "camera opened");
        Ok(Self {
            capture,
            frames: 0,
        })
    }
}

impl CaptureDevice for VideoReader {
    fn read(&mut self) -> Result<Option<Mat>> {
        let mut image = Mat::default();
        let grabbed = self.capture.read(&mut image)?;
        if !grabbed || image.empty() {
            warn!(frames = self.frames, "failed to capture image from camera");
            return Ok(None);
        }
        self.frames += 1;
        Ok(Some(image))
    }

    fn release(&mut self) -> Result<()> {
        self.capture.release()?;
        info!(frames = self.frames, "camera released");
        Ok(())
    }
}
