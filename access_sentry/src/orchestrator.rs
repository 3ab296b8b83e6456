//! The detection loop and its start/stop control.
//!
//! One worker thread per run. The worker builds its own models and capture
//! device so none of them has to be `Send`; startup success or failure is
//! reported back to `start` over a rendezvous channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use crossbeam::channel::bounded;
use opencv::core::Size;
use opencv::imgproc::resize;
use opencv::imgproc::INTER_LINEAR;
use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::authorization::{resolve_face, resolve_plate, FaceDecision, PlateDecision};
use crate::event_logger::{AccessAttempt, EventLogger, Logged};
use crate::events::AccessStatus;
use crate::face::{FaceAnalysis, DEFAULT_TOLERANCE};
use crate::frame_buffer::{encode_jpeg, Frame, SharedFrameBuffer};
use crate::metrics;
use crate::plate_detection::bounding_box_render::BoundingBoxRender;
use crate::plate_detection::plate_reader::{PlateReader, PlateSettings};
use crate::plate_detection::{
    crop, is_vehicle, BoundingBox, CaptureDevice, Detection, ObjectDetection, TextRecognition,
};
use crate::rate_limit::{RateCheck, SubjectKey, SubjectRateLimiter};
use crate::registry::{self, Registry};
use crate::store::{EventStore, RegistryStore};

/// Which cycles run face matching. Object and plate detection run on every
/// cycle regardless.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceSampling {
    EveryCycle,
    /// Cycles 0, 2, 4...
    #[default]
    EvenCycles,
    OddCycles,
}

impl FaceSampling {
    pub fn runs_on(self, cycle: u64) -> bool {
        match self {
            FaceSampling::EveryCycle => true,
            FaceSampling::EvenCycles => cycle % 2 == 0,
            FaceSampling::OddCycles => cycle % 2 == 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub tolerance: f32,
    /// Vehicles must be strictly above this to reach the plate reader.
    pub vehicle_confidence: f32,
    /// Faces are searched on a frame downscaled by this factor.
    pub face_scale: f64,
    pub face_sampling: FaceSampling,
    pub rate_limit_window: Duration,
    pub evidence_quality: i32,
    pub stream_quality: i32,
    pub plate: PlateSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            vehicle_confidence: 0.5,
            face_scale: 0.25,
            face_sampling: FaceSampling::default(),
            rate_limit_window: Duration::from_secs(60),
            evidence_quality: 70,
            stream_quality: 95,
            plate: PlateSettings::default(),
        }
    }
}

/// Inference services for one run.
pub struct Models {
    pub faces: Box<dyn FaceAnalysis>,
    pub objects: Box<dyn ObjectDetection>,
    pub plate_detector: Box<dyn ObjectDetection>,
    pub ocr: Box<dyn TextRecognition>,
}

/// Builds the per-run services. Called on the worker thread.
pub trait PipelineBackend: Send + Sync {
    fn load_models(&self) -> Result<Models>;
    fn open_capture(&self) -> Result<Box<dyn CaptureDevice>>;
}

pub struct FaceObservation {
    /// Frame coordinates.
    pub bbox: BoundingBox,
    pub decision: FaceDecision,
    pub evidence: Option<Mat>,
}

pub struct PlateObservation {
    pub vehicle: Detection,
    /// Frame coordinates.
    pub bbox: BoundingBox,
    pub decision: PlateDecision,
    pub evidence: Mat,
}

/// Everything the cascade found in one frame. No side effects have happened
/// yet when this is returned.
#[derive(Default)]
pub struct FrameAnalysis {
    pub cycle: u64,
    pub faces_sampled: bool,
    pub faces: Vec<FaceObservation>,
    pub objects: Vec<Detection>,
    pub plates: Vec<PlateObservation>,
}

impl FrameAnalysis {
    pub fn object_labels(&self) -> Vec<String> {
        self.objects.iter().map(|d| d.label.clone()).collect()
    }
}

fn stage_failed(stage: &str, err: &anyhow::Error) {
    warn!(stage, "{err:#}");
    metrics::STAGE_FAILURES.with_label_values(&[stage]).inc();
}

/// Per-run cascade state: models, registry snapshot and the rate-limit map.
pub struct FrameProcessor {
    faces: Box<dyn FaceAnalysis>,
    objects: Box<dyn ObjectDetection>,
    plates: PlateReader,
    registry: Registry,
    logger: EventLogger,
    limiter: SubjectRateLimiter,
    render: BoundingBoxRender,
    settings: PipelineSettings,
    cycle: u64,
}

impl FrameProcessor {
    pub fn new(
        models: Models,
        registry: Registry,
        events: Arc<dyn EventStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            faces: models.faces,
            objects: models.objects,
            plates: PlateReader::new(models.plate_detector, models.ocr, settings.plate.clone()),
            registry,
            logger: EventLogger::new(events),
            limiter: SubjectRateLimiter::new(settings.rate_limit_window),
            render: BoundingBoxRender::default(),
            settings,
            cycle: 0,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn match_faces(&mut self, frame: &Mat) -> Result<Vec<FaceObservation>> {
        let scale = self.settings.face_scale;
        let mut small = Mat::default();
        resize(frame, &mut small, Size::default(), scale, scale, INTER_LINEAR)?;

        let boxes = self.faces.locate_faces(&small)?;
        if boxes.is_empty() {
            return Ok(vec![]);
        }
        let embeddings = self.faces.embed(&small, &boxes)?;

        let mut observed = Vec::with_capacity(boxes.len());
        for (bbox, embedding) in boxes.iter().zip(embeddings) {
            let bbox = bbox.scale(1.0 / scale).clamp(frame.cols(), frame.rows());
            let face = self.registry.match_face(&embedding, self.settings.tolerance);
            observed.push(FaceObservation {
                bbox,
                decision: resolve_face(&self.registry, face),
                evidence: crop(frame, bbox)?,
            });
        }
        Ok(observed)
    }

    fn read_plate(&mut self, frame: &Mat, vehicle: &Detection) -> Result<Option<PlateObservation>> {
        let origin = vehicle.bbox.clamp(frame.cols(), frame.rows());
        let Some(vehicle_image) = crop(frame, origin)? else {
            return Ok(None);
        };
        let Some(read) = self.plates.locate_and_read(&vehicle_image)? else {
            return Ok(None);
        };
        Ok(Some(PlateObservation {
            vehicle: vehicle.clone(),
            bbox: read.bbox.translate(origin.x1, origin.y1),
            decision: resolve_plate(&self.registry, &read.text),
            evidence: read.image,
        }))
    }

    /// Runs the detection cascade on `frame` and advances the cycle counter.
    /// A failing stage is logged and contributes nothing.
    pub fn analyze(&mut self, frame: &Mat) -> FrameAnalysis {
        let cycle = self.cycle;
        self.cycle += 1;

        let mut analysis = FrameAnalysis {
            cycle,
            faces_sampled: self.settings.face_sampling.runs_on(cycle),
            ..Default::default()
        };

        if analysis.faces_sampled {
            match self.match_faces(frame) {
                Ok(faces) => analysis.faces = faces,
                Err(e) => stage_failed("face", &e),
            }
        }

        match self.objects.infer(frame) {
            Ok(objects) => analysis.objects = objects,
            Err(e) => stage_failed("objects", &e),
        }

        let vehicles: Vec<Detection> = analysis
            .objects
            .iter()
            .filter(|d| is_vehicle(&d.label) && d.confidence > self.settings.vehicle_confidence)
            .cloned()
            .collect();
        for vehicle in &vehicles {
            match self.read_plate(frame, vehicle) {
                Ok(Some(plate)) => analysis.plates.push(plate),
                Ok(None) => {}
                Err(e) => stage_failed("plate", &e),
            }
        }

        debug!(
            cycle,
            faces = analysis.faces.len(),
            objects = analysis.objects.len(),
            plates = analysis.plates.len(),
            "frame analyzed"
        );
        analysis
    }

    fn evidence(&self, image: Option<&Mat>) -> Option<Vec<u8>> {
        let image = image.filter(|image| !image.empty())?;
        match encode_jpeg(image, self.settings.evidence_quality) {
            Ok(jpeg) => Some(jpeg),
            Err(e) => {
                stage_failed("evidence", &e);
                None
            }
        }
    }

    fn log(
        &mut self,
        key: SubjectKey,
        attempt: impl FnOnce(&Self) -> AccessAttempt,
        status: AccessStatus,
        now: DateTime<Utc>,
    ) -> Option<Logged> {
        let subject = match &key {
            SubjectKey::Face(_) => "face",
            SubjectKey::Plate(_) => "plate",
        };
        if self.limiter.check(key, now) == RateCheck::Suppressed {
            metrics::SUPPRESSED_EVENTS.with_label_values(&[subject]).inc();
            return None;
        }
        let attempt = attempt(self);
        match self.logger.record(attempt, status, now) {
            Ok(logged) => Some(logged),
            Err(e) => {
                stage_failed("event", &e);
                None
            }
        }
    }

    /// Writes audit entries for the subjects in `analysis` that are not
    /// rate limited.
    pub fn record(&mut self, analysis: &FrameAnalysis, now: DateTime<Utc>) -> Vec<Logged> {
        let labels = analysis.object_labels();
        let mut logged = vec![];

        for face in &analysis.faces {
            let decision = &face.decision;
            let entry = self.log(
                SubjectKey::Face(decision.face.name.clone()),
                |this| AccessAttempt {
                    name: Some(decision.face.name.clone()),
                    roll_no: decision.details.as_ref().map(|d| d.roll_no.clone()),
                    confidence: decision.face.confidence,
                    plate: None,
                    evidence: this.evidence(face.evidence.as_ref()),
                    objects_detected: labels.clone(),
                },
                decision.status,
                now,
            );
            logged.extend(entry);
        }

        for plate in &analysis.plates {
            let decision = &plate.decision;
            let entry = self.log(
                SubjectKey::Plate(decision.plate.clone()),
                |this| AccessAttempt {
                    name: decision.owner.as_ref().map(|o| o.owner_name.clone()),
                    roll_no: decision.owner.as_ref().map(|o| o.roll_no.clone()),
                    confidence: None,
                    plate: Some(decision.plate.clone()),
                    evidence: this.evidence(Some(&plate.evidence)),
                    objects_detected: labels.clone(),
                },
                decision.status,
                now,
            );
            logged.extend(entry);
        }
        logged
    }

    /// A copy of `frame` with faces, objects and plates drawn on it.
    pub fn annotate(&self, frame: &Mat, analysis: &FrameAnalysis) -> Result<Mat> {
        let mut display = frame.try_clone()?;
        for face in &analysis.faces {
            self.render.draw_face(&mut display, face.bbox, &face.decision)?;
        }
        self.render.draw_objects(&mut display, &analysis.objects)?;
        for plate in &analysis.plates {
            self.render.draw_plate(&mut display, plate.bbox, &plate.decision)?;
        }
        Ok(display)
    }

    /// One full cycle short of publishing: analyze, log, draw.
    pub fn process(&mut self, frame: &Mat, now: DateTime<Utc>) -> Result<(Mat, Vec<Logged>)> {
        let analysis = self.analyze(frame);
        let logged = self.record(&analysis, now);
        let display = self.annotate(frame, &analysis)?;
        Ok((display, logged))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Stopped,
    Running,
}

/// Outcome of a start or stop request. Requests that find the pipeline
/// already in the wanted state are informational, not errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlStatus {
    Started,
    AlreadyRunning,
    Stopped,
    NotRunning,
}

impl ControlStatus {
    pub fn changed_state(&self) -> bool {
        matches!(self, ControlStatus::Started | ControlStatus::Stopped)
    }

    pub fn message(&self) -> &'static str {
        match self {
            ControlStatus::Started => "Detection started",
            ControlStatus::AlreadyRunning => "Detection already running",
            ControlStatus::Stopped => "Detection stopped",
            ControlStatus::NotRunning => "Detection not running",
        }
    }
}

pub struct Orchestrator {
    backend: Arc<dyn PipelineBackend>,
    registry_store: Arc<dyn RegistryStore>,
    event_store: Arc<dyn EventStore>,
    settings: PipelineSettings,
    frames: Arc<SharedFrameBuffer>,
    active: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Worker {
    processor: FrameProcessor,
    capture: Box<dyn CaptureDevice>,
    frames: Arc<SharedFrameBuffer>,
    active: Arc<AtomicBool>,
    stream_quality: i32,
}

impl Worker {
    fn setup(
        backend: &dyn PipelineBackend,
        registry_store: &dyn RegistryStore,
        event_store: Arc<dyn EventStore>,
        settings: PipelineSettings,
    ) -> Result<(FrameProcessor, Box<dyn CaptureDevice>)> {
        let mut models = backend.load_models()?;
        let registry = registry::load(registry_store, models.faces.as_mut())?;
        let capture = backend.open_capture()?;
        Ok((
            FrameProcessor::new(models, registry, event_store, settings),
            capture,
        ))
    }

    fn cycle(&mut self) -> Result<bool> {
        let Some(frame) = self.capture.read()? else {
            return Ok(false);
        };
        let display = match self.processor.process(&frame, Utc::now()) {
            Ok((display, _)) => display,
            Err(e) => {
                stage_failed("annotate", &e);
                frame
            }
        };
        match Frame::encode(&display, self.stream_quality) {
            Ok(encoded) => {
                self.frames.publish(encoded);
            }
            Err(e) => stage_failed("publish", &e),
        }
        Ok(true)
    }

    fn run(mut self) {
        info!("detection loop running");
        while self.active.load(Ordering::SeqCst) {
            let started = Instant::now();
            match self.cycle() {
                Ok(true) => {}
                Ok(false) => {
                    warn!("capture ended, stopping detection");
                    break;
                }
                Err(e) => {
                    // Only the capture device can fail a whole cycle.
                    error!("camera read failed: {e:#}");
                    break;
                }
            }
            metrics::FRAMES_PROCESSED.inc();
            metrics::CYCLE_SECONDS.observe(started.elapsed().as_secs_f64());
        }
        if let Err(e) = self.capture.release() {
            warn!("camera release failed: {e:#}");
        }
        self.active.store(false, Ordering::SeqCst);
        metrics::PIPELINE_RUNNING.set(0);
        info!("detection loop stopped");
    }
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn PipelineBackend>,
        registry_store: Arc<dyn RegistryStore>,
        event_store: Arc<dyn EventStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            backend,
            registry_store,
            event_store,
            settings,
            frames: Arc::new(SharedFrameBuffer::new()),
            active: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Handle readers use to follow the annotated stream.
    pub fn frames(&self) -> Arc<SharedFrameBuffer> {
        self.frames.clone()
    }

    pub fn state(&self) -> PipelineState {
        if self.active.load(Ordering::SeqCst) {
            PipelineState::Running
        } else {
            PipelineState::Stopped
        }
    }

    fn worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reap(handle: JoinHandle<()>) {
        if handle.join().is_err() {
            error!("detection worker panicked");
        }
    }

    /// Loads the registry and models, opens the camera and starts the loop.
    /// Returns once the worker is running or has failed to start.
    pub fn start(&self) -> Result<ControlStatus> {
        let mut worker = self.worker();
        if self.active.load(Ordering::SeqCst) {
            info!("detection already running");
            return Ok(ControlStatus::AlreadyRunning);
        }
        // The previous run may have ended on its own.
        if let Some(finished) = worker.take() {
            Self::reap(finished);
        }

        let (ready_s, ready_r) = bounded::<Result<()>>(1);
        let backend = self.backend.clone();
        let registry_store = self.registry_store.clone();
        let event_store = self.event_store.clone();
        let settings = self.settings.clone();
        let frames = self.frames.clone();
        let active = self.active.clone();

        self.active.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("detection".to_string())
            .spawn(move || {
                let stream_quality = settings.stream_quality;
                let setup = Worker::setup(
                    backend.as_ref(),
                    registry_store.as_ref(),
                    event_store,
                    settings,
                );
                let (processor, capture) = match setup {
                    Ok(parts) => parts,
                    Err(e) => {
                        active.store(false, Ordering::SeqCst);
                        let _ = ready_s.send(Err(e));
                        return;
                    }
                };
                metrics::PIPELINE_RUNNING.set(1);
                let _ = ready_s.send(Ok(()));
                Worker {
                    processor,
                    capture,
                    frames,
                    active,
                    stream_quality,
                }
                .run();
            });
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        match ready_r.recv() {
            Ok(Ok(())) => {
                info!("detection started");
                *worker = Some(handle);
                Ok(ControlStatus::Started)
            }
            Ok(Err(e)) => {
                Self::reap(handle);
                error!("detection failed to start: {e:#}");
                Err(e)
            }
            Err(_) => {
                self.active.store(false, Ordering::SeqCst);
                Self::reap(handle);
                Err(anyhow!("detection worker exited during startup"))
            }
        }
    }

    /// Signals the loop and waits for it; the camera is released by the time
    /// this returns.
    pub fn stop(&self) -> ControlStatus {
        let mut worker = self.worker();
        let was_active = self.active.swap(false, Ordering::SeqCst);
        if let Some(handle) = worker.take() {
            Self::reap(handle);
        }
        if was_active {
            info!("detection stopped");
            ControlStatus::Stopped
        } else {
            ControlStatus::NotRunning
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_policies() {
        let even: Vec<bool> = (0..4).map(|c| FaceSampling::EvenCycles.runs_on(c)).collect();
        assert_eq!(even, vec![true, false, true, false]);
        let odd: Vec<bool> = (0..4).map(|c| FaceSampling::OddCycles.runs_on(c)).collect();
        assert_eq!(odd, vec![false, true, false, true]);
        assert!((0..4).all(|c| FaceSampling::EveryCycle.runs_on(c)));
    }

    #[test]
    fn control_messages() {
        assert_eq!(ControlStatus::Started.message(), "Detection started");
        assert_eq!(ControlStatus::NotRunning.message(), "Detection not running");
        assert!(ControlStatus::Stopped.changed_state());
        assert!(!ControlStatus::AlreadyRunning.changed_state());
    }
}
