//! Single slot, most recent wins hand-off between the pipeline worker and
//! any number of stream readers.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use opencv::core::Vector;
use opencv::imgcodecs::imencode;
use opencv::imgcodecs::IMWRITE_JPEG_QUALITY;
use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;
use opencv::prelude::MatTraitConstManual;

/// Encodes `image` as JPEG at `quality` (0-100).
pub fn encode_jpeg(image: &Mat, quality: i32) -> Result<Vec<u8>> {
    let mut buffer = Vector::<u8>::new();
    let params = Vector::<i32>::from_slice(&[IMWRITE_JPEG_QUALITY, quality]);
    if !imencode(".jpg", image, &mut buffer, &params)? {
        return Err(anyhow!("jpeg encoding failed"));
    }
    Ok(buffer.to_vec())
}

/// An annotated frame, both as BGR raster and as JPEG for transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub width: i32,
    pub height: i32,
    pub raster: Vec<u8>,
    pub jpeg: Vec<u8>,
}

impl Frame {
    pub fn encode(image: &Mat, quality: i32) -> Result<Self> {
        let contiguous = image.try_clone()?;
        Ok(Self {
            width: image.cols(),
            height: image.rows(),
            raster: contiguous.data_bytes()?.to_vec(),
            jpeg: encode_jpeg(image, quality)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct Snapshot {
    /// Increases by one with every publish, starting at 1.
    pub sequence: u64,
    pub frame: Arc<Frame>,
}

#[derive(Default)]
struct Slot {
    sequence: u64,
    frame: Option<Arc<Frame>>,
}

#[derive(Default)]
pub struct SharedFrameBuffer {
    slot: Mutex<Slot>,
    published: Condvar,
}

impl SharedFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        // A panicking reader cannot leave the slot half written, the swap is
        // a single assignment.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the current frame and wakes waiting readers.
    pub fn publish(&self, frame: Frame) -> u64 {
        let frame = Arc::new(frame);
        let sequence = {
            let mut slot = self.slot();
            slot.sequence += 1;
            slot.frame = Some(frame);
            slot.sequence
        };
        self.published.notify_all();
        sequence
    }

    /// The latest frame, `None` until the first publish.
    pub fn read(&self) -> Option<Snapshot> {
        let slot = self.slot();
        slot.frame.as_ref().map(|frame| Snapshot {
            sequence: slot.sequence,
            frame: frame.clone(),
        })
    }

    /// Blocks until some frame is available or `timeout` passes.
    pub fn wait_for(&self, timeout: Duration) -> Option<Snapshot> {
        self.wait_newer(0, timeout)
    }

    /// Waits up to `timeout` for a frame newer than `after`.
    pub fn wait_newer(&self, after: u64, timeout: Duration) -> Option<Snapshot> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot();
        loop {
            if let Some(frame) = slot.frame.as_ref().filter(|_| slot.sequence > after) {
                return Some(Snapshot {
                    sequence: slot.sequence,
                    frame: frame.clone(),
                });
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            slot = self
                .published
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn sequence(&self) -> u64 {
        self.slot().sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn frame(fill: u8) -> Frame {
        Frame {
            width: 2,
            height: 1,
            raster: vec![fill; 6],
            jpeg: vec![0xff, 0xd8, fill],
        }
    }

    #[test]
    fn empty_before_first_publish() {
        let buffer = SharedFrameBuffer::new();
        assert!(buffer.read().is_none());
        assert!(buffer
            .wait_newer(0, Duration::from_millis(10))
            .is_none());
    }

    #[test]
    fn reads_are_identical_until_next_publish() {
        let buffer = SharedFrameBuffer::new();
        assert_eq!(buffer.publish(frame(7)), 1);
        let first = buffer.read().unwrap();
        let second = buffer.read().unwrap();
        assert_eq!(first.sequence, second.sequence);
        assert_eq!(first.frame.jpeg, second.frame.jpeg);
        assert_eq!(first.frame.raster, second.frame.raster);

        buffer.publish(frame(9));
        let third = buffer.read().unwrap();
        assert_eq!(third.sequence, 2);
        assert_eq!(third.frame.raster, vec![9; 6]);
        // Readers keep their own snapshot.
        assert_eq!(first.frame.raster, vec![7; 6]);
    }

    #[test]
    fn concurrent_readers_only_see_whole_frames() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(snapshot) = buffer.read() {
                            let fill = snapshot.frame.raster[0];
                            assert!(snapshot.frame.raster.iter().all(|b| *b == fill));
                            assert_eq!(snapshot.frame.jpeg[2], fill);
                        }
                    }
                })
            })
            .collect();
        for i in 0..500u32 {
            buffer.publish(frame((i % 256) as u8));
        }
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn waiting_reader_is_woken_by_publish() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let waiter = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.wait_newer(0, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        buffer.publish(frame(3));
        let snapshot = waiter.join().unwrap().unwrap();
        assert_eq!(snapshot.sequence, 1);
    }
}
