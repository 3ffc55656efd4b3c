use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::buffer::SharedScanBuffer;
use crate::config::SensorConfig;
use crate::sensor::{FrameSource, SensorError};
use crate::shutdown::StopSignal;
use crate::validation::{filter_frame, CircuitBreaker, FilterStage};

/// Why the acquisition task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionExit {
    /// The stop signal was raised.
    Cancelled,
    /// The driver reported a disconnect or the frame stream ended.
    Disconnected(String),
    /// Too many transient errors in a row.
    Failed { consecutive_errors: u32, last_error: String },
}

impl AcquisitionExit {
    /// True when the task stopped for a reason other than a requested shutdown.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AcquisitionExit::Cancelled)
    }
}

impl std::fmt::Display for AcquisitionExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquisitionExit::Cancelled => f.write_str("cancelled"),
            AcquisitionExit::Disconnected(msg) => write!(f, "disconnected ({msg})"),
            AcquisitionExit::Failed { consecutive_errors, last_error } => {
                write!(f, "failed after {consecutive_errors} consecutive errors ({last_error})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionReport {
    pub exit: AcquisitionExit,
    pub frames_published: u64,
    pub frames_dropped: u64,
    pub transient_errors: u64,
}

/// What the producer thread hands back when it ends.
pub struct AcquisitionOutcome {
    pub report: AcquisitionReport,
    /// The driver handle, returned so the supervisor can release it in order.
    /// `None` if the thread died without handing it back.
    pub source: Option<Box<dyn FrameSource>>,
}

impl std::fmt::Debug for AcquisitionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionOutcome")
            .field("report", &self.report)
            .field("source", &self.source.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AcquisitionOptions {
    pub filter_stage: FilterStage,
    pub min_frame_samples: usize,
    pub discard_initial_frames: usize,
    pub max_consecutive_errors: u32,
}

impl Default for AcquisitionOptions {
    fn default() -> Self {
        Self {
            filter_stage: FilterStage::Producer,
            min_frame_samples: 0,
            discard_initial_frames: 0,
            max_consecutive_errors: 5,
        }
    }
}

impl From<&SensorConfig> for AcquisitionOptions {
    fn from(cfg: &SensorConfig) -> Self {
        Self {
            filter_stage: cfg.filter_stage,
            min_frame_samples: cfg.min_frame_samples,
            discard_initial_frames: cfg.discard_initial_frames,
            max_consecutive_errors: cfg.max_consecutive_errors,
        }
    }
}

/// Cheap handle for checking whether the producer is still running.
#[derive(Debug, Clone, Default)]
pub struct ProducerWatch(Option<Arc<AtomicBool>>);

impl ProducerWatch {
    /// A watch with no producer behind it; it never reports an exit.
    pub fn detached() -> Self {
        Self(None)
    }

    pub fn has_exited(&self) -> bool {
        self.0.as_ref().is_some_and(|f| f.load(Ordering::SeqCst))
    }
}

/// Background producer draining a [`FrameSource`] into a [`SharedScanBuffer`].
#[derive(Debug)]
pub struct ScanAcquisitionTask {
    handle: Option<JoinHandle<()>>,
    done_rx: Receiver<AcquisitionOutcome>,
    exited: Arc<AtomicBool>,
}

struct ExitFlag(Arc<AtomicBool>);

impl Drop for ExitFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl ScanAcquisitionTask {
    pub fn spawn<S>(
        source: S,
        buffer: Arc<SharedScanBuffer>,
        stop: StopSignal,
        opts: AcquisitionOptions,
    ) -> std::io::Result<Self>
    where
        S: FrameSource + 'static,
    {
        let (done_tx, done_rx): (Sender<AcquisitionOutcome>, _) = bounded(1);
        let exited = Arc::new(AtomicBool::new(false));
        let flag = ExitFlag(Arc::clone(&exited));
        let handle = thread::Builder::new().name("scan-acquisition".into()).spawn(move || {
            let _flag = flag;
            let mut source: Box<dyn FrameSource> = Box::new(source);
            let report = run_acquisition(source.as_mut(), &buffer, &stop, &opts);
            info!(
                "acquisition exited: {:?} (published={}, dropped={}, transient_errors={})",
                report.exit, report.frames_published, report.frames_dropped, report.transient_errors
            );
            // the receiver may already be gone if the supervisor gave up waiting
            let _ = done_tx.send(AcquisitionOutcome { report, source: Some(source) });
        })?;
        Ok(Self { handle: Some(handle), done_rx, exited })
    }

    /// Non-blocking check whether the producer thread has finished.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn watch(&self) -> ProducerWatch {
        ProducerWatch(Some(Arc::clone(&self.exited)))
    }

    /// Wait up to `timeout` for the producer to finish.
    ///
    /// Returns `None` when the producer is still blocked inside the driver
    /// after the timeout; the thread is then left detached.
    pub fn wait(mut self, timeout: Duration) -> Option<AcquisitionOutcome> {
        match self.done_rx.recv_timeout(timeout) {
            Ok(outcome) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                Some(outcome)
            }
            Err(RecvTimeoutError::Disconnected) => {
                // sender dropped without a report: the thread panicked
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                error!("acquisition thread terminated without a report");
                Some(AcquisitionOutcome {
                    report: AcquisitionReport {
                        exit: AcquisitionExit::Failed {
                            consecutive_errors: 0,
                            last_error: "acquisition thread panicked".into(),
                        },
                        frames_published: 0,
                        frames_dropped: 0,
                        transient_errors: 0,
                    },
                    source: None,
                })
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("acquisition did not exit within {:?}, detaching", timeout);
                None
            }
        }
    }
}

/// The producer loop. Returns once the stop signal is raised or the source fails.
pub fn run_acquisition(
    source: &mut dyn FrameSource,
    buffer: &SharedScanBuffer,
    stop: &StopSignal,
    opts: &AcquisitionOptions,
) -> AcquisitionReport {
    let started = Instant::now();
    let mut breaker = CircuitBreaker::new(opts.max_consecutive_errors);
    let mut report = AcquisitionReport {
        exit: AcquisitionExit::Cancelled,
        frames_published: 0,
        frames_dropped: 0,
        transient_errors: 0,
    };

    if let Err(e) = source.start() {
        error!("sensor failed to start: {}", e);
        report.exit = match e {
            SensorError::Disconnected(msg) => AcquisitionExit::Disconnected(msg),
            SensorError::Transient(msg) => {
                AcquisitionExit::Failed { consecutive_errors: 1, last_error: msg }
            }
        };
        return report;
    }

    let mut seen = 0usize;
    loop {
        if stop.is_raised() {
            report.exit = AcquisitionExit::Cancelled;
            return report;
        }
        match source.next_frame() {
            Ok(Some(frame)) => {
                breaker.reset();
                seen += 1;
                if seen <= opts.discard_initial_frames {
                    report.frames_dropped += 1;
                    continue;
                }
                let frame = match opts.filter_stage {
                    FilterStage::Producer => filter_frame(frame),
                    FilterStage::Consumer => frame,
                };
                if frame.valid_len() < opts.min_frame_samples {
                    debug!(
                        "frame with {} valid samples below minimum {}, keeping previous",
                        frame.valid_len(),
                        opts.min_frame_samples
                    );
                    report.frames_dropped += 1;
                    continue;
                }
                if stop.is_raised() {
                    report.exit = AcquisitionExit::Cancelled;
                    return report;
                }
                buffer.publish(frame);
                report.frames_published += 1;
            }
            Ok(None) => {
                warn!("sensor frame stream ended");
                report.exit = AcquisitionExit::Disconnected("frame stream ended".into());
                return report;
            }
            Err(SensorError::Transient(msg)) => {
                report.transient_errors += 1;
                breaker.trip(started.elapsed().as_micros() as i64);
                warn!("transient sensor error ({} in a row): {}", breaker.failure_count(), msg);
                if !breaker.allow() {
                    error!("giving up after {} consecutive sensor errors", breaker.failure_count());
                    report.exit = AcquisitionExit::Failed {
                        consecutive_errors: breaker.failure_count(),
                        last_error: msg,
                    };
                    return report;
                }
            }
            Err(SensorError::Disconnected(msg)) => {
                error!("sensor disconnected: {}", msg);
                report.exit = AcquisitionExit::Disconnected(msg);
                return report;
            }
        }
    }
}
