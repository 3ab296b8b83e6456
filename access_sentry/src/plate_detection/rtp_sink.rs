use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use gstreamer::parse_launch;
use gstreamer::prelude::Cast;
use gstreamer::prelude::CastNone;
use gstreamer::prelude::ElementExt;
use gstreamer::prelude::GstBinExt;
use gstreamer::Buffer;
use gstreamer::Caps;
use gstreamer::ClockTime;
use gstreamer_video::VideoCapsBuilder;
use gstreamer_video::VideoFormat;
use tracing::{debug, info, warn};

use crate::frame_buffer::{Frame, SharedFrameBuffer};

pub fn create_caps(width: i32, height: i32, fps: u32) -> Caps {
    VideoCapsBuilder::new()
        .width(width)
        .height(height)
        .framerate(gstreamer::Fraction::new(fps as i32, 1))
        .format(VideoFormat::Bgr)
        .build()
}

/// Re-encodes the annotated stream as H.264 and sends it over RTP/UDP.
pub struct RtpSink {
    pipeline: gstreamer::Pipeline,
    app_src: gstreamer_app::AppSrc,
    fps: u32,
    frames: u64,
    size: Option<(i32, i32)>,
}

impl RtpSink {
    pub fn new(fps: u32, host: &str, port: u16) -> Result<Self> {
        gstreamer::init()?;
        let description = format!(
            "appsrc name=frames ! videoconvert ! x264enc tune=zerolatency bitrate=500 speed-preset=superfast ! rtph264pay ! udpsink host={host} port={port}"
        );
        let pipeline = parse_launch(&description)?
            .dynamic_cast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("not a pipeline: {description}"))?;
        let app_src = pipeline
            .by_name("frames")
            .and_dynamic_cast::<gstreamer_app::AppSrc>()
            .map_err(|_| anyhow!("pipeline has no appsrc"))?;
        app_src.set_format(gstreamer::Format::Time);
        app_src.set_is_live(true);

        pipeline.set_state(gstreamer::State::Playing)?;
        info!(host, port, fps, "rtp sink playing");
        Ok(Self {
            pipeline,
            app_src,
            fps: fps.max(1),
            frames: 0,
            size: None,
        })
    }

    fn push(&mut self, frame: &Frame) -> Result<()> {
        if self.size != Some((frame.width, frame.height)) {
            self.app_src
                .set_caps(Some(&create_caps(frame.width, frame.height, self.fps)));
            self.size = Some((frame.width, frame.height));
        }
        let duration = ClockTime::from_nseconds(1_000_000_000 / self.fps as u64);
        let pts = duration * self.frames;

        let mut buffer = Buffer::from_slice(frame.raster.clone());
        {
            let buffer = buffer
                .get_mut()
                .ok_or_else(|| anyhow!("gst buffer is shared"))?;
            buffer.set_duration(duration);
            buffer.set_pts(pts);
            buffer.set_dts(pts);
        }
        self.app_src
            .push_buffer(buffer)
            .map_err(|e| anyhow!("appsrc rejected buffer: {e:?}"))?;
        self.frames += 1;
        Ok(())
    }

    /// Forwards every new frame of `frames` until `stop` is raised.
    pub fn spawn(
        mut self,
        frames: Arc<SharedFrameBuffer>,
        stop: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut last = 0;
            while !stop.load(Ordering::Relaxed) {
                let Some(snapshot) = frames.wait_newer(last, Duration::from_millis(500)) else {
                    continue;
                };
                last = snapshot.sequence;
                if let Err(e) = self.push(&snapshot.frame) {
                    warn!("rtp push failed: {e:#}");
                    break;
                }
                debug!(frame = self.frames, "rtp frame sent");
            }
            let _ = self.app_src.end_of_stream();
            if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
                warn!("rtp pipeline shutdown failed: {e}");
            }
        })
    }
}
