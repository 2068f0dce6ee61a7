//! `CaptureSession`: one grant → one accepted frame.
//!
//! ```text
//! Idle → AwaitingGrant → Settling → Capturing → Validating ─┬─► Accepted ──┐
//!                                      ▲                    ├─► Exhausted ─┼─► Released
//!                                      └──── Retrying ◄─────┘              │
//!              (any live state) ──────────► Aborted ───────────────────────┘
//! ```
//!
//! The session runs as a single task. Frame deliveries, platform stop
//! signals, timer expiries and the caller's stop request are all wake-ups of
//! one `select!` loop, so the attempt counter and the accepting flag have a
//! single writer. The only timer is a local of that loop: leaving the loop
//! for any reason cancels it.

use std::future::pending;
use std::sync::Arc;

use stillcap_capture::{sink, FrameSource, FrameStream, LiveSource, SourceEvent};
use stillcap_core::{
    CaptureGrant, CaptureOutcome, ErrorKind, Frame, SessionConfig, SessionId, TargetGeometry,
};
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::classifier::classify;
use crate::state::{IllegalTransition, Machine, SessionState, Step};
use crate::writer::FrameWriter;

// ── Wake-ups ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    /// Settling delay before the first subscription.
    Settle,
    /// Inter-attempt wait.
    Retry,
    /// No delivery arrived in time after entering `Capturing`.
    FrameTimeout,
}

enum Wake {
    Stop,
    Source(Option<SourceEvent>),
    Timer,
}

// ── CaptureSession ────────────────────────────────────────────────────────────

pub struct CaptureSession {
    id:       SessionId,
    machine:  Machine,
    config:   Arc<SessionConfig>,
    geometry: TargetGeometry,
    grant:    CaptureGrant,
    source:   Arc<dyn FrameSource>,
    writer:   Arc<dyn FrameWriter>,
    live:     Option<Box<dyn LiveSource>>,
    stream:   Option<FrameStream>,
    /// Every sink is gone; stop polling the stream.
    source_gone: bool,
    released: bool,
}

impl CaptureSession {
    pub fn new(
        id: SessionId,
        grant: CaptureGrant,
        geometry: TargetGeometry,
        config: Arc<SessionConfig>,
        source: Arc<dyn FrameSource>,
        writer: Arc<dyn FrameWriter>,
    ) -> Self {
        let machine = Machine::new(config.max_attempts, config.exhaustion_policy);
        Self {
            id,
            machine,
            config,
            geometry,
            grant,
            source,
            writer,
            live: None,
            stream: None,
            source_gone: false,
            released: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// Drive the session to its terminal outcome, then release everything.
    ///
    /// `stop_rx` resolving (or its sender going away) cancels the session.
    /// Once an outcome is decided the receiver is closed, so a late
    /// `send` on the paired sender fails.
    pub async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) -> CaptureOutcome {
        info!("Session[{}] starting: {} via {}", self.id, self.geometry, self.source.name());
        let outcome = self.drive(&mut stop_rx).await;
        // Terminal: later stop requests are refused at the sender.
        stop_rx.close();
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(illegal) => {
                error!("Session[{}] {}", self.id, illegal);
                self.machine.abort();
                CaptureOutcome::failed(ErrorKind::InternalError, illegal.to_string())
            }
        };
        self.release();
        outcome
    }

    async fn drive(&mut self, stop_rx: &mut oneshot::Receiver<()>) -> Result<CaptureOutcome, IllegalTransition> {
        // ── AwaitingGrant: redeem the grant ──────────────────────────────────
        self.machine.transition(SessionState::AwaitingGrant)?;
        self.grant.consume();

        let (frame_sink, stream) = sink::channel(self.config.frame_queue_depth);
        self.stream = Some(stream);

        let source = Arc::clone(&self.source);
        let grant = self.grant.clone();
        let redeemed = tokio::select! {
            biased;
            _ = &mut *stop_rx => None,
            result = source.open(&grant, self.geometry, frame_sink) => Some(result),
        };
        match redeemed {
            None => return Ok(self.cancel()),
            Some(Err(e)) => {
                warn!("Session[{}] grant redemption failed: {}", self.id, e);
                return Ok(self.abort(e.kind(), e.to_string()));
            }
            Some(Ok(live)) => self.live = Some(live),
        }

        // ── Settling ─────────────────────────────────────────────────────────
        self.machine.transition(SessionState::Settling)?;
        debug!("Session[{}] settling for {:?}", self.id, self.config.settle_delay());
        let mut timer = Some((Timer::Settle, Instant::now() + self.config.settle_delay()));

        loop {
            let deadline = timer.map(|(_, at)| at);
            let wake = tokio::select! {
                biased;
                _ = &mut *stop_rx => Wake::Stop,
                event = next_event(&mut self.stream), if !self.source_gone => Wake::Source(event),
                _ = sleep_until_opt(deadline) => Wake::Timer,
            };

            match wake {
                Wake::Stop => return Ok(self.cancel()),

                Wake::Timer => match timer.take() {
                    Some((Timer::Settle, _)) => {
                        self.machine.transition(SessionState::Capturing)?;
                        if let Err(e) = self.subscribe() {
                            return Ok(self.abort(e.kind(), e.to_string()));
                        }
                        timer = Some(self.frame_timeout());
                    }
                    Some((Timer::Retry, _)) => {
                        self.machine.resume_capturing()?;
                        debug!("Session[{}] capturing attempt {}", self.id, self.machine.attempt() + 1);
                        timer = Some(self.frame_timeout());
                    }
                    Some((Timer::FrameTimeout, _)) => {
                        return Ok(self.abort(
                            ErrorKind::Timeout,
                            format!("no frame delivered within {:?}", self.config.frame_timeout()),
                        ));
                    }
                    None => {}
                },

                Wake::Source(None) => {
                    warn!("Session[{}] frame source went away without a stop signal", self.id);
                    self.source_gone = true;
                }
                Wake::Source(Some(SourceEvent::Stopped { reason })) => {
                    return Ok(self.abort(ErrorKind::UnexpectedStop, reason));
                }
                Wake::Source(Some(SourceEvent::Fault { detail })) => {
                    return Ok(self.abort(ErrorKind::InternalError, detail));
                }
                Wake::Source(Some(SourceEvent::Frame(frame))) => {
                    if !self.machine.begin_validation() {
                        debug!(
                            "Session[{}] dropped frame #{} in {:?}",
                            self.id, frame.sequence(), self.machine.state()
                        );
                        continue;
                    }

                    match self.validate(&frame)? {
                        Step::Retry { attempt } => {
                            timer = Some((Timer::Retry, Instant::now() + self.config.retry_interval()));
                            info!(
                                "Session[{}] frame #{} looks occluded, retry {}/{}",
                                self.id, frame.sequence(), attempt + 1, self.config.max_attempts
                            );
                        }
                        Step::Exhaust => {
                            return Ok(self.finish(CaptureOutcome::failed(
                                ErrorKind::Exhausted,
                                format!("all {} attempts looked occluded", self.config.max_attempts),
                            )));
                        }
                        Step::Accept { best_effort } => {
                            // From here on a stop can no longer be sent; one that
                            // raced classification still wins over acceptance.
                            stop_rx.close();
                            if matches!(stop_rx.try_recv(), Ok(())) {
                                return Ok(self.cancel());
                            }
                            if best_effort {
                                warn!(
                                    "Session[{}] attempts exhausted, accepting frame #{} as best effort",
                                    self.id, frame.sequence()
                                );
                            }
                            return Ok(self.encode(frame).await);
                        }
                    }
                }
            }
        }
    }

    fn validate(&mut self, frame: &Frame) -> Result<Step, IllegalTransition> {
        let c = classify(frame, &self.config.classifier);
        debug!(
            "Session[{}] frame #{} {:?}: {}/{} uniform samples",
            self.id, frame.sequence(), c.verdict, c.uniform, c.samples
        );
        self.machine.on_verdict(c.verdict)
    }

    fn subscribe(&mut self) -> Result<(), stillcap_core::SourceError> {
        match self.live.as_mut() {
            Some(live) => live.subscribe(),
            None => Err(stillcap_core::SourceError::Released),
        }
    }

    fn frame_timeout(&self) -> (Timer, Instant) {
        (Timer::FrameTimeout, Instant::now() + self.config.frame_timeout())
    }

    async fn encode(&mut self, frame: Frame) -> CaptureOutcome {
        let writer = Arc::clone(&self.writer);
        let sequence = frame.sequence();
        // The frame moves into the blocking task and is dropped there.
        let written = tokio::task::spawn_blocking(move || writer.write(&frame)).await;
        let outcome = match written {
            Ok(Ok(path)) => CaptureOutcome::Accepted { path },
            Ok(Err(e)) => {
                warn!("Session[{}] encoding frame #{} failed: {}", self.id, sequence, e);
                CaptureOutcome::failed(e.kind(), e.to_string())
            }
            Err(e) => CaptureOutcome::failed(ErrorKind::InternalError, format!("encoder task: {e}")),
        };
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: CaptureOutcome) -> CaptureOutcome {
        debug!("Session[{}] terminal in {:?}", self.id, self.machine.state());
        outcome
    }

    fn abort(&mut self, kind: ErrorKind, detail: impl Into<String>) -> CaptureOutcome {
        let detail = detail.into();
        self.machine.abort();
        warn!("Session[{}] aborted ({}): {}", self.id, kind, detail);
        CaptureOutcome::failed(kind, detail)
    }

    fn cancel(&mut self) -> CaptureOutcome {
        info!("Session[{}] cancelled in {:?}", self.id, self.state());
        self.machine.abort();
        CaptureOutcome::Cancelled
    }

    /// Release the surface, the subscription and the grant. Runs once.
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(mut live) = self.live.take() {
            live.release();
        }
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        self.grant.consume();
        if let Err(e) = self.machine.release() {
            warn!("Session[{}] forced release: {}", self.id, e);
        }
        info!("Session[{}] released", self.id);
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.release();
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn next_event(stream: &mut Option<FrameStream>) -> Option<SourceEvent> {
    match stream.as_mut() {
        Some(stream) => stream.recv().await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}
