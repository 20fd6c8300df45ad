//! Capture demo: open a camera, stream frames, recover from stalls.

use std::time::Duration;

use usb_video_capture::{
    validation, CaptureEvent, DecodedFrame, DeviceSession, FrameDecoder, Result,
    DEFAULT_BUFFER_COUNT,
};

/// Pass-through decoder: checks the MJPEG markers and hands the payload on
/// with the geometry parsed from the frame header.
struct MjpegPassthrough;

impl FrameDecoder for MjpegPassthrough {
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

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/video0".to_owned());

    let (mut session, events) = DeviceSession::open(&path)?;
    if let Some(caps) = session.capabilities() {
        let (major, minor, patch) = caps.version_triple();
        println!("Device : {} ({})", caps.card, caps.driver);
        println!("Bus    : {}", caps.bus_info);
        println!("Driver : {major}.{minor}.{patch}");
    }

    session.initialize(DEFAULT_BUFFER_COUNT)?;
    if let Some(format) = session.format() {
        println!("Format : {format}");
    }

    session.start_capture(MjpegPassthrough)?;

    let mut frames: u64 = 0;
    for event in events {
        match event {
            CaptureEvent::Frame(image) => {
                frames += 1;
                println!(
                    "frame {frames}: {}x{}, {} bytes",
                    image.width,
                    image.height,
                    image.pixels.len()
                );
            }
            CaptureEvent::Status(text) => println!("{text}"),
            CaptureEvent::Fault(fault) => eprintln!("fault: {fault}"),
            CaptureEvent::Stall => {
                eprintln!("device stalled; rebuilding buffers");
                session.clear_stall()?;
                std::thread::sleep(Duration::from_millis(500));
                session.restart_capture(MjpegPassthrough)?;
            }
        }
    }
    Ok(())
}
