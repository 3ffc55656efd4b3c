use thiserror::Error;

use crate::domain::{Action, RangeFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Written,
    /// The frame had no valid samples, nothing was written.
    SkippedEmpty,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordingError {
    #[error("training log write failed: {0}")]
    Storage(String),
    #[error("cannot encode training record: {0}")]
    Encode(String),
    #[error("action {0} has no index in the configured action set")]
    UnmappedAction(Action),
}

/// Append-only sink for labelled frames.
///
/// A record must be durable when `record` returns. Failures are per record:
/// callers log them and keep going.
pub trait FrameRecorder {
    fn record(&mut self, frame: &RangeFrame, action: Action) -> Result<RecordOutcome, RecordingError>;
}

impl<R: FrameRecorder + ?Sized> FrameRecorder for &mut R {
    fn record(&mut self, frame: &RangeFrame, action: Action) -> Result<RecordOutcome, RecordingError> {
        (**self).record(frame, action)
    }
}

impl<R: FrameRecorder + ?Sized> FrameRecorder for Box<R> {
    fn record(&mut self, frame: &RangeFrame, action: Action) -> Result<RecordOutcome, RecordingError> {
        (**self).record(frame, action)
    }
}
