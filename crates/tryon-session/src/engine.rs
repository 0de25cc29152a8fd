//! Tracker thread and its single-flight handle.
//!
//! Inference runs on a dedicated OS thread fed through a capacity-1 channel.
//! The handle keeps at most one request outstanding: a frame submitted while
//! the tracker is busy is dropped, never queued.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tryon_core::{FrameLandmarks, LandmarkDetector, TrackerError};
use tryon_hw::Frame;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),
    #[error("failed to spawn tracker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("tracker thread exited")]
    ChannelClosed,
    #[error("tracker is busy with another frame")]
    Busy,
    #[error("tracker has been disposed")]
    Disposed,
}

/// Shared cancellation flag checked by the tracker thread around each frame.
#[derive(Debug, Clone, Default)]
struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type DetectReply = oneshot::Sender<Result<Option<FrameLandmarks>, TrackerError>>;

enum TrackerRequest {
    Detect { frame: Arc<Frame>, reply: DetectReply },
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted,
    /// The tracker was busy; the frame was discarded.
    Dropped,
}

/// Result of one completed submission.
#[derive(Debug, Clone)]
pub struct TrackerOutput {
    pub sequence: u32,
    /// `None` when no face was found or inference failed.
    pub landmarks: Option<FrameLandmarks>,
    pub failed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub submitted: u64,
    pub dropped: u64,
    pub faces: u64,
    pub empty: u64,
    pub failures: u64,
    pub dark_frames: u64,
}

struct InFlight {
    sequence: u32,
    rx: oneshot::Receiver<Result<Option<FrameLandmarks>, TrackerError>>,
}

pub struct TrackerHandle {
    tx: Option<mpsc::Sender<TrackerRequest>>,
    in_flight: Option<InFlight>,
    cancel: CancelToken,
    stats: TrackerStats,
}

/// Move `detector` onto a dedicated tracker thread.
pub fn spawn_tracker(
    mut detector: Box<dyn LandmarkDetector>,
) -> Result<TrackerHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<TrackerRequest>(1);
    let cancel = CancelToken::default();
    let worker_cancel = cancel.clone();

    std::thread::Builder::new()
        .name("tryon-tracker".into())
        .spawn(move || {
            tracing::debug!("tracker thread started");
            while let Some(req) = rx.blocking_recv() {
                if worker_cancel.is_cancelled() {
                    break;
                }
                match req {
                    TrackerRequest::Detect { frame, reply } => {
                        let result = detector.detect(&frame.data, frame.width, frame.height);
                        if worker_cancel.is_cancelled() {
                            break;
                        }
                        // The handle may have stopped waiting; nothing to do then.
                        let _ = reply.send(result);
                    }
                    TrackerRequest::Reset => detector.reset(),
                }
            }
            tracing::debug!("tracker thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    tracing::info!("tracker spawned");
    Ok(TrackerHandle {
        tx: Some(tx),
        in_flight: None,
        cancel,
        stats: TrackerStats::default(),
    })
}

impl TrackerHandle {
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.tx.is_none()
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    /// Hand a frame to the tracker unless one is already in flight.
    pub fn try_submit(&mut self, frame: Arc<Frame>) -> Result<SubmitOutcome, EngineError> {
        let tx = self.tx.as_ref().ok_or(EngineError::Disposed)?;
        if self.in_flight.is_some() {
            self.stats.dropped += 1;
            tracing::debug!(sequence = frame.sequence, "tracker busy, frame dropped");
            return Ok(SubmitOutcome::Dropped);
        }

        let sequence = frame.sequence;
        let is_dark = frame.is_dark;
        let (reply, rx) = oneshot::channel();
        match tx.try_send(TrackerRequest::Detect { frame, reply }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.dropped += 1;
                return Ok(SubmitOutcome::Dropped);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(EngineError::ChannelClosed),
        }

        self.stats.submitted += 1;
        if is_dark {
            self.stats.dark_frames += 1;
        }
        self.in_flight = Some(InFlight { sequence, rx });
        Ok(SubmitOutcome::Submitted)
    }

    /// Collect the in-flight result if it has arrived. Inference failures are
    /// logged and reported as a frame without a face.
    pub fn poll(&mut self) -> Option<TrackerOutput> {
        let flight = self.in_flight.as_mut()?;
        let sequence = flight.sequence;
        let result = match flight.rx.try_recv() {
            Ok(result) => result,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.in_flight = None;
                tracing::warn!(sequence, "tracker dropped a request without replying");
                return None;
            }
        };
        self.in_flight = None;
        Some(self.record(sequence, result))
    }

    /// Wait for the in-flight result, if any.
    pub async fn wait(&mut self) -> Option<TrackerOutput> {
        let flight = self.in_flight.as_mut()?;
        let sequence = flight.sequence;
        let received = (&mut flight.rx).await;
        self.in_flight = None;
        match received {
            Ok(result) => Some(self.record(sequence, result)),
            Err(_) => {
                tracing::warn!(sequence, "tracker dropped a request without replying");
                None
            }
        }
    }

    /// Submit one frame and wait for its result.
    pub async fn process_frame(
        &mut self,
        frame: Arc<Frame>,
    ) -> Result<Option<FrameLandmarks>, EngineError> {
        if self.in_flight.is_some() {
            return Err(EngineError::Busy);
        }
        if self.try_submit(frame)? == SubmitOutcome::Dropped {
            return Err(EngineError::Busy);
        }
        let flight = self.in_flight.as_mut().ok_or(EngineError::ChannelClosed)?;
        let received = (&mut flight.rx).await;
        let sequence = flight.sequence;
        self.in_flight = None;

        let result = received.map_err(|_| EngineError::ChannelClosed)?;
        match result {
            Ok(lms) => {
                self.record(sequence, Ok(lms.clone()));
                Ok(lms)
            }
            Err(e) => {
                self.stats.failures += 1;
                Err(e.into())
            }
        }
    }

    /// Ask the detector to forget per-frame tracking state.
    pub fn reset(&mut self) {
        if let Some(tx) = &self.tx {
            if tx.try_send(TrackerRequest::Reset).is_err() {
                tracing::debug!("tracker reset skipped, channel full");
            }
        }
    }

    /// Stop the tracker. Any in-flight result is discarded; the thread exits
    /// once its current frame completes. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        self.cancel.cancel();
        self.in_flight = None;
        if self.tx.take().is_some() {
            tracing::info!(
                submitted = self.stats.submitted,
                dropped = self.stats.dropped,
                "tracker disposed"
            );
        }
    }

    fn record(
        &mut self,
        sequence: u32,
        result: Result<Option<FrameLandmarks>, TrackerError>,
    ) -> TrackerOutput {
        match result {
            Ok(Some(lms)) => {
                self.stats.faces += 1;
                TrackerOutput {
                    sequence,
                    landmarks: Some(lms),
                    failed: false,
                }
            }
            Ok(None) => {
                self.stats.empty += 1;
                TrackerOutput {
                    sequence,
                    landmarks: None,
                    failed: false,
                }
            }
            Err(e) => {
                self.stats.failures += 1;
                tracing::warn!(
                    sequence,
                    error = %e,
                    "landmark inference failed; treating as no face"
                );
                TrackerOutput {
                    sequence,
                    landmarks: None,
                    failed: true,
                }
            }
        }
    }
}

impl Drop for TrackerHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    fn frame(seq: u32) -> Arc<Frame> {
        Arc::new(Frame::from_rgb(vec![128; 4 * 4 * 3], 4, 4, seq).unwrap())
    }

    /// Blocks each detection until the test opens the gate.
    struct GatedDetector {
        gate: std_mpsc::Receiver<()>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    impl LandmarkDetector for GatedDetector {
        fn detect(
            &mut self,
            _rgb: &[u8],
            _w: u32,
            _h: u32,
        ) -> Result<Option<FrameLandmarks>, TrackerError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.gate.recv();
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    struct FailingDetector;

    impl LandmarkDetector for FailingDetector {
        fn detect(
            &mut self,
            _rgb: &[u8],
            _w: u32,
            _h: u32,
        ) -> Result<Option<FrameLandmarks>, TrackerError> {
            Err(TrackerError::InferenceFailed("boom".into()))
        }
    }

    struct Gated {
        gate: std_mpsc::Sender<()>,
        max_active: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    fn gated() -> (GatedDetector, Gated) {
        let (tx, rx) = std_mpsc::channel();
        let max_active = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        (
            GatedDetector {
                gate: rx,
                active: Arc::new(AtomicUsize::new(0)),
                max_active: max_active.clone(),
                calls: calls.clone(),
            },
            Gated {
                gate: tx,
                max_active,
                calls,
            },
        )
    }

    async fn wait_for(handle: &mut TrackerHandle) -> TrackerOutput {
        for _ in 0..500 {
            if let Some(out) = handle.poll() {
                return out;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("tracker never completed");
    }

    #[tokio::test]
    async fn test_single_flight_drops_while_busy() {
        let (detector, ctl) = gated();
        let mut handle = spawn_tracker(Box::new(detector)).unwrap();

        assert_eq!(handle.try_submit(frame(0)).unwrap(), SubmitOutcome::Submitted);
        for seq in 1..10 {
            assert_eq!(handle.try_submit(frame(seq)).unwrap(), SubmitOutcome::Dropped);
        }
        assert!(handle.is_busy());
        assert!(handle.poll().is_none());

        ctl.gate.send(()).unwrap();
        let out = wait_for(&mut handle).await;
        assert_eq!(out.sequence, 0);
        assert!(!handle.is_busy());

        assert_eq!(ctl.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.calls.load(Ordering::SeqCst), 1);
        let stats = handle.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.dropped, 9);
        assert_eq!(stats.empty, 1);

        // Free again: the next frame goes through.
        assert_eq!(handle.try_submit(frame(10)).unwrap(), SubmitOutcome::Submitted);
        ctl.gate.send(()).unwrap();
        assert_eq!(wait_for(&mut handle).await.sequence, 10);
    }

    #[tokio::test]
    async fn test_failure_reads_as_no_face() {
        let mut handle = spawn_tracker(Box::new(FailingDetector)).unwrap();
        handle.try_submit(frame(3)).unwrap();
        let out = wait_for(&mut handle).await;
        assert!(out.failed);
        assert!(out.landmarks.is_none());
        assert_eq!(handle.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_process_frame_round_trip() {
        let (detector, ctl) = gated();
        let mut handle = spawn_tracker(Box::new(detector)).unwrap();
        ctl.gate.send(()).unwrap();
        let lms = handle.process_frame(frame(1)).await.unwrap();
        assert!(lms.is_none());
        assert!(!handle.is_busy());
    }

    #[tokio::test]
    async fn test_process_frame_propagates_failure() {
        let mut handle = spawn_tracker(Box::new(FailingDetector)).unwrap();
        let err = handle.process_frame(frame(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::Tracker(TrackerError::InferenceFailed(_))));
    }

    #[tokio::test]
    async fn test_late_result_after_dispose_is_ignored() {
        let (detector, ctl) = gated();
        let mut handle = spawn_tracker(Box::new(detector)).unwrap();
        handle.try_submit(frame(0)).unwrap();

        // Wait until the worker is inside detect().
        for _ in 0..500 {
            if ctl.calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        handle.dispose();
        handle.dispose();
        assert!(handle.is_disposed());
        assert!(!handle.is_busy());

        // Completion after teardown has nowhere to land.
        let _ = ctl.gate.send(());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.poll().is_none());
        assert!(matches!(handle.try_submit(frame(1)), Err(EngineError::Disposed)));
    }

    #[tokio::test]
    async fn test_dark_frames_counted() {
        let mut handle = spawn_tracker(Box::new(FailingDetector)).unwrap();
        let dark = Arc::new(Frame::from_rgb(vec![0; 4 * 4 * 3], 4, 4, 0).unwrap());
        assert!(dark.is_dark);
        handle.try_submit(dark).unwrap();
        wait_for(&mut handle).await;
        assert_eq!(handle.stats().dark_frames, 1);
    }
}
