//! TOML configuration with `ACCESS_SENTRY_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::backend::ModelSettings;
use crate::face::sface;
use crate::mjpeg::DEFAULT_FPS;
use crate::orchestrator::{FaceSampling, PipelineSettings};
use crate::plate_detection::plate_reader::PlateSettings;
use crate::plate_detection::video_reader::CameraSettings;

pub const CONFIG_ENV: &str = "ACCESS_SENTRY_CONFIG";

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("access_sentry.db"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThresholdSettings {
    pub face_tolerance: f32,
    pub vehicle_confidence: f32,
    pub plate_confidence: f32,
    pub text_confidence: f32,
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        let plate = PlateSettings::default();
        let pipeline = PipelineSettings::default();
        Self {
            face_tolerance: pipeline.tolerance,
            vehicle_confidence: pipeline.vehicle_confidence,
            plate_confidence: plate.plate_confidence,
            text_confidence: plate.text_confidence,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopSettings {
    pub face_scale: f64,
    pub face_sampling: FaceSampling,
    pub rate_limit_secs: u64,
    pub evidence_quality: i32,
    pub stream_quality: i32,
    pub plate_upscale: f64,
}

impl Default for LoopSettings {
    fn default() -> Self {
        let pipeline = PipelineSettings::default();
        Self {
            face_scale: pipeline.face_scale,
            face_sampling: pipeline.face_sampling,
            rate_limit_secs: pipeline.rate_limit_window.as_secs(),
            evidence_quality: pipeline.evidence_quality,
            stream_quality: pipeline.stream_quality,
            plate_upscale: pipeline.plate.upscale,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RtpSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamSettings {
    pub fps: u32,
    /// Also push the stream as RTP/H.264 when built with `rtp-sink`.
    pub rtp: Option<RtpSettings>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            rtp: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct SentryConfig {
    pub database: DatabaseSettings,
    pub camera: CameraSettings,
    pub models: ModelSettings,
    pub thresholds: ThresholdSettings,
    pub pipeline: LoopSettings,
    pub stream: StreamSettings,
    pub server: ServerSettings,
}

impl SentryConfig {
    /// Reads `path`, or the file named by `ACCESS_SENTRY_CONFIG`, or starts
    /// from defaults. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        let mut config = match path {
            Some(path) => read_config_file(&path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_value("ACCESS_SENTRY_DB") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(source) = env_value("ACCESS_SENTRY_CAMERA") {
            self.camera.source = source;
        }
        if let Some(addr) = env_value("ACCESS_SENTRY_ADDR") {
            self.server.addr = addr;
        }
        if let Some(tolerance) = env_value("ACCESS_SENTRY_FACE_TOLERANCE") {
            self.thresholds.face_tolerance = tolerance
                .parse()
                .map_err(|_| anyhow!("ACCESS_SENTRY_FACE_TOLERANCE must be a number"))?;
        }
        if let Some(seconds) = env_value("ACCESS_SENTRY_RATE_LIMIT_SECS") {
            self.pipeline.rate_limit_secs = seconds.parse().map_err(|_| {
                anyhow!("ACCESS_SENTRY_RATE_LIMIT_SECS must be an integer number of seconds")
            })?;
        }
        if let Some(gpu) = env_value("ACCESS_SENTRY_USE_GPU") {
            self.models.use_gpu = matches!(gpu.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let tolerance = self.thresholds.face_tolerance;
        if tolerance.is_nan() || tolerance <= 0.0 || tolerance > sface::MAX_DISTANCE {
            return Err(anyhow!(
                "thresholds.face_tolerance must be within (0, {}], got {tolerance}",
                sface::MAX_DISTANCE
            ));
        }
        let thresholds = [
            ("vehicle_confidence", self.thresholds.vehicle_confidence),
            ("plate_confidence", self.thresholds.plate_confidence),
            ("text_confidence", self.thresholds.text_confidence),
        ];
        for (name, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("thresholds.{name} must be within [0, 1], got {value}"));
            }
        }
        if self.pipeline.rate_limit_secs == 0 {
            return Err(anyhow!("pipeline.rate_limit_secs must be greater than zero"));
        }
        if self.pipeline.face_scale <= 0.0 || self.pipeline.face_scale > 1.0 {
            return Err(anyhow!("pipeline.face_scale must be within (0, 1]"));
        }
        for (name, quality) in [
            ("evidence_quality", self.pipeline.evidence_quality),
            ("stream_quality", self.pipeline.stream_quality),
        ] {
            if !(0..=100).contains(&quality) {
                return Err(anyhow!("pipeline.{name} must be within [0, 100]"));
            }
        }
        if self.stream.fps == 0 {
            return Err(anyhow!("stream.fps must be greater than zero"));
        }
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            tolerance: self.thresholds.face_tolerance,
            vehicle_confidence: self.thresholds.vehicle_confidence,
            face_scale: self.pipeline.face_scale,
            face_sampling: self.pipeline.face_sampling,
            rate_limit_window: Duration::from_secs(self.pipeline.rate_limit_secs),
            evidence_quality: self.pipeline.evidence_quality,
            stream_quality: self.pipeline.stream_quality,
            plate: PlateSettings {
                plate_confidence: self.thresholds.plate_confidence,
                text_confidence: self.thresholds.text_confidence,
                upscale: self.pipeline.plate_upscale,
            },
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<SentryConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
}
