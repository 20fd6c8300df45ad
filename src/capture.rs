//! The acquisition loop: wait, dequeue, dispatch, re-queue.
//!
//! Runs on a dedicated thread with exclusive ownership of the buffer table,
//! which it returns to the controller when it exits. The loop never mutates
//! session state; it only flips buffer ownership through the
//! [`CaptureQueue`] primitives and reports through the event channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::time::Duration;

use log::{debug, warn};

use crate::traits::{CaptureEvent, CaptureQueue, FrameDecoder, Readiness};

/// Run the capture cycle until the run flag is cleared or a fault ends it.
///
/// Each cycle: bounded wait for readability (expiry is a stall: one
/// [`CaptureEvent::Stall`], then exit), dequeue one filled buffer (EAGAIN
/// retried without re-waiting, anything else fatal), hand the payload to the
/// decoder (failure drops that frame only), re-queue the buffer (failure
/// fatal - the table may no longer agree with the driver).
///
/// Returns the queue so the controller regains the buffer table at join.
pub(crate) fn run_capture_loop<Q, D>(
    mut queue: Q,
    mut decoder: D,
    run: &AtomicBool,
    events: &Sender<CaptureEvent>,
    timeout: Duration,
) -> Q
where
    Q: CaptureQueue,
    D: FrameDecoder,
{
    debug!("acquisition loop entered, {} buffers", queue.buffer_count());

    while run.load(Ordering::Acquire) {
        match queue.wait_readable(timeout) {
            Ok(Readiness::Ready) => {}
            Ok(Readiness::TimedOut) => {
                warn!("no frame within {timeout:?}, treating as stall");
                events.send(CaptureEvent::Stall).ok();
                break;
            }
            Err(err) => {
                events.send(CaptureEvent::Fault(err)).ok();
                break;
            }
        }

        let filled = loop {
            match queue.dequeue() {
                Ok(Some(filled)) => break filled,
                // Driver momentarily unready right after readability;
                // retry the dequeue itself.
                Ok(None) => {}
                Err(err) => {
                    events.send(CaptureEvent::Fault(err)).ok();
                    debug!("acquisition loop exiting on dequeue fault");
                    return queue;
                }
            }
        };

        match decoder.decode(queue.frame_data(&filled)) {
            Ok(image) => {
                events.send(CaptureEvent::Frame(image)).ok();
            }
            Err(err) => {
                // One corrupt frame must not stop the stream.
                events.send(CaptureEvent::Fault(err)).ok();
            }
        }

        if let Err(err) = queue.requeue(filled.index) {
            events.send(CaptureEvent::Fault(err)).ok();
            debug!("acquisition loop exiting on re-queue fault");
            return queue;
        }
    }

    debug!("acquisition loop exited");
    queue
}
