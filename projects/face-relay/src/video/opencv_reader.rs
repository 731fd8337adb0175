use super::VideoReader;
use anyhow::{bail, Context, Result};
use opencv::{
    core::Vector,
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_HEIGHT, CAP_PROP_FRAME_WIDTH,
        CAP_PROP_HW_ACCELERATION, CAP_PROP_OPEN_TIMEOUT_MSEC, CAP_PROP_READ_TIMEOUT_MSEC,
        VIDEO_ACCELERATION_ANY,
    },
};
use std::time::Duration;

/// Live stream, video file or local device read through OpenCV.
pub struct OpencvReader {
    capture: VideoCapture,
}

impl OpencvReader {
    /// `locator` is an RTSP/HTTP URL, a file path, or an integer device index.
    /// A read that stalls past `read_timeout` ends the stream instead of blocking.
    pub fn open(locator: &str, open_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let shown = redact_url(locator);
        let params = capture_params(open_timeout, read_timeout);
        let mut capture = match locator.trim().parse::<i32>() {
            Ok(index) => VideoCapture::new_with_params(index, CAP_ANY, &params)
                .with_context(|| format!("Failed to open device {}", index))?,
            Err(_) => VideoCapture::from_file_with_params(locator, CAP_ANY, &params)
                .with_context(|| format!("Failed to open {}", shown))?,
        };
        if !capture.is_opened()? {
            bail!("Failed to open video source: {}", shown);
        }

        // Try to enable hardware acceleration (VideoToolbox on macOS, VA-API on Linux, etc.)
        match capture.set(CAP_PROP_HW_ACCELERATION, VIDEO_ACCELERATION_ANY as f64) {
            Ok(true) => tracing::debug!("OpencvReader: hardware acceleration enabled"),
            _ => tracing::debug!("OpencvReader: hardware acceleration not available"),
        }

        let fps = capture.get(CAP_PROP_FPS).unwrap_or(0.0);
        let width = capture.get(CAP_PROP_FRAME_WIDTH).unwrap_or(0.0);
        let height = capture.get(CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0);
        tracing::info!(
            "OpencvReader: opened {}, {}x{} @ {:.2} fps",
            shown,
            width,
            height,
            fps
        );

        Ok(Self { capture })
    }
}

impl VideoReader for OpencvReader {
    fn read_frame(&mut self) -> Result<Option<Mat>> {
        let mut frame = Mat::default();
        let success = self.capture.read(&mut frame)?;
        if !success || frame.empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }
}

/// Property/value pairs for the capture constructors, in milliseconds.
fn capture_params(open_timeout: Duration, read_timeout: Duration) -> Vector<i32> {
    let millis = |d: Duration| i32::try_from(d.as_millis()).unwrap_or(i32::MAX);
    Vector::from_slice(&[
        CAP_PROP_OPEN_TIMEOUT_MSEC,
        millis(open_timeout),
        CAP_PROP_READ_TIMEOUT_MSEC,
        millis(read_timeout),
    ])
}

/// Hides `user:password@` in stream URLs before they reach the logs.
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let host_end = rest.find('/').unwrap_or(rest.len());
    match rest[..host_end].rfind('@') {
        Some(at) => format!("{}://***@{}", &url[..scheme_end], &rest[at + 1..]),
        None => url.to_string(),
    }
}
