//! multipart/x-mixed-replace stream of the shared frame.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::frame_buffer::SharedFrameBuffer;

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub const DEFAULT_FPS: u32 = 30;

/// Keeps a loop from running faster than a fixed rate.
pub struct FpsLimiter {
    started: Instant,
    period: Duration,
}

impl FpsLimiter {
    pub fn new(fps: u32) -> Self {
        Self {
            started: Instant::now(),
            period: Duration::from_nanos(1_000_000_000 / fps.max(1) as u64),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Sleeps out the rest of the current period and starts the next one.
    pub fn wait(&mut self) {
        let elapsed = self.started.elapsed();
        if self.period > elapsed {
            spin_sleep::sleep(self.period - elapsed);
        }
        self.started = Instant::now();
    }
}

pub fn write_part<W: Write>(writer: &mut W, jpeg: &[u8]) -> io::Result<()> {
    write!(writer, "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n")?;
    writer.write_all(jpeg)?;
    writer.write_all(b"\r\n")?;
    writer.flush()
}

/// Streams the latest frame to `writer` until `stop` is raised or the
/// client goes away. Before the first publish nothing is written, the
/// reader just keeps polling.
pub fn stream_to<W: Write>(
    buffer: &SharedFrameBuffer,
    writer: &mut W,
    fps: u32,
    stop: &AtomicBool,
) -> io::Result<u64> {
    let mut limiter = FpsLimiter::new(fps);
    let mut parts = 0;
    while !stop.load(Ordering::Relaxed) {
        if let Some(snapshot) = buffer.read() {
            if let Err(err) = write_part(writer, &snapshot.frame.jpeg) {
                debug!(%err, parts, "stream client gone");
                return Err(err);
            }
            parts += 1;
        }
        limiter.wait();
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_buffer::Frame;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn part_is_framed_with_boundary_and_content_type() {
        let mut out = Vec::new();
        write_part(&mut out, &[0xff, 0xd8, 0xff, 0xd9]).unwrap();
        let mut expected = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xff, 0xd8, 0xff, 0xd9]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(out, expected);
    }

    #[test]
    fn limiter_period_matches_rate() {
        assert_eq!(FpsLimiter::new(25).period(), Duration::from_millis(40));
        assert_eq!(FpsLimiter::new(0).period(), Duration::from_secs(1));
    }

    struct Counting {
        bytes: Vec<u8>,
        fail_after: usize,
        parts: usize,
    }

    impl Write for Counting {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.bytes.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.parts += 1;
            if self.parts >= self.fail_after {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn stream_ends_when_client_disconnects() {
        let buffer = SharedFrameBuffer::new();
        buffer.publish(Frame {
            width: 1,
            height: 1,
            raster: vec![0; 3],
            jpeg: vec![1, 2, 3],
        });
        let mut client = Counting {
            bytes: vec![],
            fail_after: 3,
            parts: 0,
        };
        let stop = AtomicBool::new(false);
        let err = stream_to(&buffer, &mut client, 200, &stop).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let text = String::from_utf8_lossy(&client.bytes);
        assert_eq!(text.matches("--frame\r\n").count(), 3);
    }

    #[test]
    fn stream_writes_nothing_until_first_publish() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let (buffer, stop) = (buffer.clone(), stop.clone());
            thread::spawn(move || {
                let mut out = Vec::new();
                let parts = stream_to(&buffer, &mut out, 100, &stop).unwrap();
                (parts, out)
            })
        };
        thread::sleep(Duration::from_millis(50));
        stop.store(true, Ordering::Relaxed);
        let (parts, out) = handle.join().unwrap();
        assert_eq!(parts, 0);
        assert!(out.is_empty());
    }
}
