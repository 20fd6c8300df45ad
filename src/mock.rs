//! Scripted stand-ins for the driver queue and the decode collaborator,
//! for exercising the acquisition loop without hardware.

use std::collections::VecDeque;
use std::time::Duration;

use nix::errno::Errno;

use crate::error::{CaptureError, Result};
use crate::traits::{
    BufferOwner, CaptureQueue, DecodedFrame, FilledBuffer, FrameDecoder, Readiness,
};
use crate::validation;

/// One scripted step of queue behavior, consumed per wait/dequeue pair.
#[derive(Debug, Clone, Copy)]
pub enum MockStep {
    /// Readable, and the dequeue yields this buffer filled end to end.
    Frame {
        /// Buffer table index to hand out.
        index: u32,
    },
    /// Readable, but the dequeue reports the driver momentarily unready.
    Busy,
    /// The wait expires with nothing ready.
    Stall,
    /// The wait itself fails.
    WaitError,
    /// The dequeue fails with a non-transient error.
    DequeueError,
}

/// Scripted queue for testing the capture loop without hardware.
///
/// Buffers start driver-owned, as if start had enqueued the whole table.
/// An exhausted script behaves like a stalled device.
#[derive(Debug)]
pub struct MockQueue {
    steps: VecDeque<MockStep>,
    buffers: Vec<Vec<u8>>,
    /// Ownership tag per buffer, mirrored from the production table.
    pub owners: Vec<BufferOwner>,
    /// Indices handed back to the driver, in order.
    pub requeued: Vec<u32>,
    /// Number of wait calls observed.
    pub wait_calls: u32,
    /// Number of dequeue calls observed.
    pub dequeue_calls: u32,
    fail_requeue: bool,
}

impl MockQueue {
    /// Create a queue over the given buffer payloads.
    #[must_use]
    pub fn new(buffers: Vec<Vec<u8>>) -> Self {
        let owners = vec![BufferOwner::Driver; buffers.len()];
        Self {
            steps: VecDeque::new(),
            buffers,
            owners,
            requeued: Vec::new(),
            wait_calls: 0,
            dequeue_calls: 0,
            fail_requeue: false,
        }
    }

    /// Append scripted steps.
    #[must_use]
    pub fn script<I: IntoIterator<Item = MockStep>>(mut self, steps: I) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Make every requeue fail.
    #[must_use]
    pub fn failing_requeue(mut self) -> Self {
        self.fail_requeue = true;
        self
    }
}

impl CaptureQueue for MockQueue {
    fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    fn wait_readable(&mut self, _timeout: Duration) -> Result<Readiness> {
        self.wait_calls += 1;
        match self.steps.front() {
            None => Ok(Readiness::TimedOut),
            Some(MockStep::Stall) => {
                self.steps.pop_front();
                Ok(Readiness::TimedOut)
            }
            Some(MockStep::WaitError) => {
                self.steps.pop_front();
                Err(CaptureError::WaitFailed(Errno::EBADF))
            }
            Some(_) => Ok(Readiness::Ready),
        }
    }

    fn dequeue(&mut self) -> Result<Option<FilledBuffer>> {
        self.dequeue_calls += 1;
        match self.steps.pop_front() {
            Some(MockStep::Frame { index }) => {
                #[allow(clippy::cast_possible_truncation)]
                let bytes_used = self.buffers.get(index as usize).map_or(0, Vec::len) as u32;
                if let Some(owner) = self.owners.get_mut(index as usize) {
                    *owner = BufferOwner::Application;
                }
                Ok(Some(FilledBuffer { index, bytes_used }))
            }
            Some(MockStep::Busy) => Ok(None),
            Some(MockStep::DequeueError) => Err(CaptureError::DequeueFailed(Errno::EIO)),
            // A dequeue with no scripted outcome is a test bug; fail hard
            // rather than spin.
            Some(MockStep::Stall | MockStep::WaitError) | None => {
                Err(CaptureError::DequeueFailed(Errno::ENODATA))
            }
        }
    }

    fn requeue(&mut self, index: u32) -> Result<()> {
        if self.fail_requeue {
            return Err(CaptureError::EnqueueFailed(Errno::EIO));
        }
        if let Some(owner) = self.owners.get_mut(index as usize) {
            *owner = BufferOwner::Driver;
        }
        self.requeued.push(index);
        Ok(())
    }

    fn frame_data(&self, filled: &FilledBuffer) -> &[u8] {
        let index = filled.index as usize;
        assert!(
            index < self.buffers.len(),
            "dequeued buffer index {index} outside table of {}",
            self.buffers.len()
        );
        let data = &self.buffers[index];
        let len = (filled.bytes_used as usize).min(data.len());
        &data[..len]
    }
}

/// Decoder that accepts exactly the payloads carrying valid JPEG markers
/// and reports the geometry parsed from the frame header.
#[derive(Debug, Clone, Copy)]
pub struct MarkerDecoder;

impl FrameDecoder for MarkerDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<DecodedFrame> {
        validation::validate_frame(data)?;
        let (width, height) = validation::jpeg_dimensions(data).unwrap_or((0, 0));
        Ok(DecodedFrame {
            width: width.into(),
            height: height.into(),
            pixels: data.to_vec(),
        })
    }
}

/// Minimal well-formed JPEG payload: SOI, a one-component SOF0 carrying the
/// given geometry, EOI.
#[must_use]
pub fn tiny_jpeg(width: u16, height: u16) -> Vec<u8> {
    let mut data = vec![0xFF, 0xD8];
    data.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08]);
    data.extend_from_slice(&height.to_be_bytes());
    data.extend_from_slice(&width.to_be_bytes());
    data.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_queue_flips_ownership_like_the_driver() {
        let mut queue =
            MockQueue::new(vec![tiny_jpeg(4, 4)]).script([MockStep::Frame { index: 0 }]);
        assert_eq!(queue.owners, vec![BufferOwner::Driver]);

        let filled = queue
            .dequeue()
            .expect("dequeue succeeds")
            .expect("a frame is scripted");
        assert_eq!(queue.owners, vec![BufferOwner::Application]);
        assert_eq!(filled.bytes_used as usize, tiny_jpeg(4, 4).len());

        queue.requeue(0).expect("requeue succeeds");
        assert_eq!(queue.owners, vec![BufferOwner::Driver]);
        assert_eq!(queue.requeued, vec![0]);
    }

    #[test]
    fn exhausted_script_reads_as_stalled_device() {
        let mut queue = MockQueue::new(vec![tiny_jpeg(4, 4)]);
        assert_eq!(
            queue
                .wait_readable(Duration::from_millis(1))
                .expect("wait itself succeeds"),
            Readiness::TimedOut
        );
    }

    #[test]
    fn marker_decoder_reports_geometry() {
        let mut decoder = MarkerDecoder;
        let frame = decoder
            .decode(&tiny_jpeg(320, 240))
            .expect("valid payload decodes");
        assert_eq!((frame.width, frame.height), (320, 240));

        let err = decoder.decode(&[0u8; 16]).expect_err("garbage is rejected");
        assert!(matches!(err, CaptureError::DecodeFailed(_)));
    }
}
