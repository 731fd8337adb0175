pub mod opencv_reader;
pub mod tracked_stream;

use crate::pipeline::types::FrameBatch;
use anyhow::Result;
use opencv::core::Mat;

pub trait VideoReader {
    /// Next decoded frame, `Ok(None)` once the stream has nothing more to give.
    fn read_frame(&mut self) -> Result<Option<Mat>>;
}

/// Where a supervisor gets its frames and tracked detections from.
pub trait DetectionSource {
    /// (Re)establishes the underlying stream.
    fn open(&mut self) -> Result<()>;

    /// Next frame with all of its tracked detections, `Ok(None)` at end of stream.
    fn next_batch(&mut self) -> Result<Option<FrameBatch>>;
}
