//! Worker → session delivery channel.
//!
//! Frames travel on a bounded queue; a full queue drops the new frame at the
//! source instead of blocking the worker. Control events (revocation, faults)
//! travel on a separate unbounded queue so a backlog of frames can never hide
//! them, and [`FrameStream::recv`] always yields control events first.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use stillcap_core::Frame;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;

// MARK: - SourceEvent

/// Message pushed by a frame source into its session.
#[derive(Debug)]
pub enum SourceEvent {
    Frame(Frame),
    /// The platform ended the capture on its own (grant revoked, stream EOS).
    Stopped { reason: String },
    /// Acquiring or decoding a frame failed irrecoverably.
    Fault { detail: String },
}

/// Result of [`FrameSink::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The session has not consumed the previous frames yet.
    DroppedBusy,
    /// The source was released; the frame is discarded.
    DroppedReleased,
}

/// Create a connected sink/stream pair with room for `depth` pending frames.
pub fn channel(depth: usize) -> (FrameSink, FrameStream) {
    let (frame_tx, frame_rx) = mpsc::channel(depth.max(1));
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let released = Arc::new(AtomicBool::new(false));

    let sink = FrameSink {
        frame_tx,
        control_tx,
        released: Arc::clone(&released),
        sequence: Arc::new(AtomicU64::new(0)),
    };
    let stream = FrameStream { frame_rx, control_rx, released };
    (sink, stream)
}

// MARK: - FrameSink

/// Producer half, held by the frame source's worker. Cheap to clone.
#[derive(Clone)]
pub struct FrameSink {
    frame_tx:   mpsc::Sender<Frame>,
    control_tx: mpsc::UnboundedSender<SourceEvent>,
    released:   Arc<AtomicBool>,
    sequence:   Arc<AtomicU64>,
}

impl FrameSink {
    /// Hand a frame to the session without blocking. Assigns its sequence number.
    pub fn deliver(&self, frame: Frame) -> Delivery {
        if self.is_released() {
            return Delivery::DroppedReleased;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        match self.frame_tx.try_send(frame.with_sequence(sequence)) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                trace!("frame #{} dropped: session busy", sequence);
                Delivery::DroppedBusy
            }
            Err(TrySendError::Closed(_)) => Delivery::DroppedReleased,
        }
    }

    /// Report that the platform stopped the capture.
    pub fn stopped(&self, reason: impl Into<String>) {
        if !self.is_released() {
            let _ = self.control_tx.send(SourceEvent::Stopped { reason: reason.into() });
        }
    }

    /// Report an irrecoverable acquisition/decoding failure.
    pub fn fault(&self, detail: impl Into<String>) {
        if !self.is_released() {
            let _ = self.control_tx.send(SourceEvent::Fault { detail: detail.into() });
        }
    }

    /// Called by the source when it is released; later deliveries are discarded.
    pub fn mark_released(&self) {
        self.released.store(true, Ordering::Release);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

// MARK: - FrameStream

/// Consumer half, owned by exactly one capture session.
pub struct FrameStream {
    frame_rx:   mpsc::Receiver<Frame>,
    control_rx: mpsc::UnboundedReceiver<SourceEvent>,
    released:   Arc<AtomicBool>,
}

impl FrameStream {
    /// Next event, control events first. `None` once every sink is gone.
    pub async fn recv(&mut self) -> Option<SourceEvent> {
        tokio::select! {
            biased;
            Some(event) = self.control_rx.recv() => Some(event),
            Some(frame) = self.frame_rx.recv() => Some(SourceEvent::Frame(frame)),
            else => None,
        }
    }

    /// Stop accepting events and discard anything still queued.
    pub fn close(&mut self) {
        self.released.store(true, Ordering::Release);
        self.frame_rx.close();
        self.control_rx.close();
        let mut discarded = 0usize;
        while self.frame_rx.try_recv().is_ok() {
            discarded += 1;
        }
        while self.control_rx.try_recv().is_ok() {}
        if discarded > 0 {
            trace!("discarded {} queued frame(s) on close", discarded);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}
