//! In-process frame source that plays back a script.
//!
//! Used by the demo binary and by session tests. Once subscribed, a tokio task
//! (the source's worker context) walks the script, sleeping the given delay
//! before each step, then optionally keeps repeating a frame until released.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use stillcap_core::{AcquireError, CaptureGrant, Frame, PixelFormat, SourceError, TargetGeometry};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::sink::{Delivery, FrameSink};
use crate::{FrameSource, LiveSource};

// ── Script ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Step {
    Frame(Frame),
    /// Several frames pushed back-to-back with no delay in between.
    Burst(Vec<Frame>),
    Revoke(String),
    Fault(String),
}

// ── SourceProbe ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counters {
    opens:         AtomicUsize,
    subscriptions: AtomicUsize,
    releases:      AtomicUsize,
    live_surfaces: AtomicUsize,
    live_subscriptions: AtomicUsize,
    delivered:     AtomicUsize,
    dropped:       AtomicUsize,
}

/// Shared view of what a [`ScriptedSource`] was asked to do.
#[derive(Debug, Clone, Default)]
pub struct SourceProbe(Arc<Counters>);

/// Point-in-time copy of a [`SourceProbe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeSnapshot {
    /// Successful redemptions.
    pub opens:         usize,
    pub subscriptions: usize,
    pub releases:      usize,
    /// Surfaces opened and not yet released.
    pub live_surfaces: usize,
    /// Subscriptions started and not yet released.
    pub live_subscriptions: usize,
    /// Frames queued for the session.
    pub delivered:     usize,
    /// Frames discarded by the sink (busy or released).
    pub dropped:       usize,
}

impl SourceProbe {
    pub fn snapshot(&self) -> ProbeSnapshot {
        let c = &self.0;
        ProbeSnapshot {
            opens:         c.opens.load(Ordering::SeqCst),
            subscriptions: c.subscriptions.load(Ordering::SeqCst),
            releases:      c.releases.load(Ordering::SeqCst),
            live_surfaces: c.live_surfaces.load(Ordering::SeqCst),
            live_subscriptions: c.live_subscriptions.load(Ordering::SeqCst),
            delivered:     c.delivered.load(Ordering::SeqCst),
            dropped:       c.dropped.load(Ordering::SeqCst),
        }
    }

    fn record(&self, delivery: Delivery) {
        match delivery {
            Delivery::Queued => self.0.delivered.fetch_add(1, Ordering::SeqCst),
            _ => self.0.dropped.fetch_add(1, Ordering::SeqCst),
        };
    }
}

// ── ScriptedSource ────────────────────────────────────────────────────────────

/// A [`FrameSource`] driven by a fixed script.
///
/// ```rust,no_run
/// # use std::time::Duration;
/// use stillcap_capture::{scripted::frames, ScriptedSource};
///
/// let source = ScriptedSource::new()
///     .frame_after(Duration::from_millis(100), frames::solid(64, 64, [240, 240, 240, 255]))
///     .repeat_every(Duration::from_millis(100), frames::checkerboard(64, 64, 8));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    redemption_error: Option<AcquireError>,
    steps:  Vec<(Duration, Step)>,
    repeat: Option<(Duration, Frame)>,
    probe:  SourceProbe,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every redemption fail with `error`.
    pub fn fail_redemption(mut self, error: AcquireError) -> Self {
        self.redemption_error = Some(error);
        self
    }

    pub fn frame_after(mut self, delay: Duration, frame: Frame) -> Self {
        self.steps.push((delay, Step::Frame(frame)));
        self
    }

    pub fn burst_after(mut self, delay: Duration, frames: Vec<Frame>) -> Self {
        self.steps.push((delay, Step::Burst(frames)));
        self
    }

    pub fn revoke_after(mut self, delay: Duration, reason: impl Into<String>) -> Self {
        self.steps.push((delay, Step::Revoke(reason.into())));
        self
    }

    pub fn fault_after(mut self, delay: Duration, detail: impl Into<String>) -> Self {
        self.steps.push((delay, Step::Fault(detail.into())));
        self
    }

    /// After the script ends, deliver `frame` every `period` until released.
    pub fn repeat_every(mut self, period: Duration, frame: Frame) -> Self {
        self.repeat = Some((period, frame));
        self
    }

    pub fn probe(&self) -> SourceProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn open(
        &self,
        grant: &CaptureGrant,
        geometry: TargetGeometry,
        sink: FrameSink,
    ) -> Result<Box<dyn LiveSource>, AcquireError> {
        if let Some(error) = &self.redemption_error {
            info!("Scripted source refusing grant {}: {}", grant.id(), error);
            return Err(error.clone());
        }

        self.probe.0.opens.fetch_add(1, Ordering::SeqCst);
        self.probe.0.live_surfaces.fetch_add(1, Ordering::SeqCst);
        debug!("Scripted source opened for {} ({} step(s))", geometry, self.steps.len());

        Ok(Box::new(ScriptedLive {
            steps:  self.steps.clone(),
            repeat: self.repeat.clone(),
            sink,
            probe:  self.probe.clone(),
            worker: None,
            released: false,
        }))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ── ScriptedLive ──────────────────────────────────────────────────────────────

struct ScriptedLive {
    steps:    Vec<(Duration, Step)>,
    repeat:   Option<(Duration, Frame)>,
    sink:     FrameSink,
    probe:    SourceProbe,
    worker:   Option<JoinHandle<()>>,
    released: bool,
}

impl LiveSource for ScriptedLive {
    fn subscribe(&mut self) -> Result<(), SourceError> {
        if self.released {
            return Err(SourceError::Released);
        }
        if self.worker.is_some() {
            return Err(SourceError::AlreadySubscribed);
        }

        self.probe.0.subscriptions.fetch_add(1, Ordering::SeqCst);
        self.probe.0.live_subscriptions.fetch_add(1, Ordering::SeqCst);

        let steps  = std::mem::take(&mut self.steps);
        let repeat = self.repeat.take();
        let sink   = self.sink.clone();
        let probe  = self.probe.clone();

        self.worker = Some(tokio::spawn(async move {
            for (delay, step) in steps {
                tokio::time::sleep(delay).await;
                match step {
                    Step::Frame(frame) => probe.record(sink.deliver(frame)),
                    Step::Burst(frames) => {
                        for frame in frames {
                            probe.record(sink.deliver(frame));
                        }
                    }
                    Step::Revoke(reason) => sink.stopped(reason),
                    Step::Fault(detail) => sink.fault(detail),
                }
            }
            if let Some((period, frame)) = repeat {
                loop {
                    tokio::time::sleep(period).await;
                    if sink.is_released() {
                        break;
                    }
                    probe.record(sink.deliver(frame.clone()));
                }
            }
        }));
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.sink.mark_released();
        if let Some(worker) = self.worker.take() {
            worker.abort();
            self.probe.0.live_subscriptions.fetch_sub(1, Ordering::SeqCst);
        }
        self.probe.0.live_surfaces.fetch_sub(1, Ordering::SeqCst);
        self.probe.0.releases.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for ScriptedLive {
    fn drop(&mut self) {
        self.release();
    }
}

// ── Frame helpers ─────────────────────────────────────────────────────────────

/// Synthetic RGBA frames for scripts.
pub mod frames {
    use super::*;

    /// A single flat colour, the way a permission dialog card looks up close.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Frame {
        let data: Vec<u8> = rgba.iter().copied().cycle().take(width as usize * height as usize * 4).collect();
        packed(data, width, height)
    }

    /// Black/white squares of `cell` px: high local contrast, like real content.
    pub fn checkerboard(width: u32, height: u32, cell: u32) -> Frame {
        let cell = cell.max(1);
        let mut data = Vec::with_capacity(width as usize * height as usize * 4);
        for y in 0..height {
            for x in 0..width {
                let v = if (x / cell + y / cell) % 2 == 0 { 0 } else { 255 };
                data.extend_from_slice(&[v, v, v, 255]);
            }
        }
        packed(data, width, height)
    }

    fn packed(data: Vec<u8>, width: u32, height: u32) -> Frame {
        // Layout is consistent by construction.
        Frame::packed(Bytes::from(data), width.max(1), height.max(1), PixelFormat::Rgba8888)
            .unwrap_or_else(|e| panic!("synthetic frame layout: {e}"))
    }
}
