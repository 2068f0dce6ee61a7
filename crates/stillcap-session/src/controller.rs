//! `CaptureController` — Start Capture / Stop Capture.
//!
//! Holds at most one live session. The slot is freed only after the
//! session's Release step, so two sessions never fight over one surface.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use stillcap_capture::FrameSource;
use stillcap_core::{CaptureGrant, ConfigError, RequestError, SessionConfig, SessionId, TargetGeometry};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::dispatcher::{OutcomeSink, ResultDispatcher};
use crate::session::CaptureSession;
use crate::writer::FrameWriter;

struct ActiveSession {
    id:      SessionId,
    stop_tx: Option<oneshot::Sender<()>>,
}

type Slot = Arc<Mutex<Option<ActiveSession>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<ActiveSession>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Frees the slot when the session task ends, panics included.
struct SlotGuard {
    slot: Slot,
    id:   SessionId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slot = lock(&self.slot);
        if slot.as_ref().map(|a| a.id) == Some(self.id) {
            *slot = None;
        }
    }
}

// ── CaptureController ─────────────────────────────────────────────────────────

/// Entry point for callers. Must be used inside a tokio runtime.
pub struct CaptureController {
    source: Arc<dyn FrameSource>,
    writer: Arc<dyn FrameWriter>,
    config: Arc<SessionConfig>,
    slot:   Slot,
}

impl CaptureController {
    /// Fails when `config` does not pass [`SessionConfig::validate`].
    pub fn new(
        source: Arc<dyn FrameSource>,
        writer: Arc<dyn FrameWriter>,
        config: SessionConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            source,
            writer,
            config: Arc::new(config),
            slot: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start a session and return immediately.
    ///
    /// The terminal outcome arrives later through `sink`, exactly once.
    /// Invalid geometry, an unusable grant or a still-active session are
    /// rejected here, before anything is allocated.
    pub fn start_capture(
        &self,
        grant: CaptureGrant,
        geometry: TargetGeometry,
        sink: Arc<dyn OutcomeSink>,
    ) -> Result<SessionId, RequestError> {
        geometry.validate()?;
        grant.check_redeemable()?;

        let id = SessionId::new();
        let (stop_tx, stop_rx) = oneshot::channel();
        {
            let mut slot = lock(&self.slot);
            if let Some(active) = slot.as_ref() {
                return Err(RequestError::SessionActive(active.id));
            }
            *slot = Some(ActiveSession { id, stop_tx: Some(stop_tx) });
        }

        let session = CaptureSession::new(
            id,
            grant,
            geometry,
            Arc::clone(&self.config),
            Arc::clone(&self.source),
            Arc::clone(&self.writer),
        );
        let dispatcher = ResultDispatcher::new(id, sink);
        let guard = SlotGuard { slot: Arc::clone(&self.slot), id };

        tokio::spawn(async move {
            let outcome = session.run(stop_rx).await;
            // Released has completed: let the next session in before the caller hears back.
            drop(guard);
            dispatcher.dispatch(outcome);
        });

        info!("Session[{}] accepted start request ({})", id, geometry);
        Ok(id)
    }

    /// Cancel the active session. Idempotent; returns `true` only when this
    /// call delivered the stop before the session committed to an outcome.
    /// A session that is already encoding its accepted frame refuses it.
    pub fn stop_capture(&self) -> bool {
        let mut slot = lock(&self.slot);
        let Some(active) = slot.as_mut() else {
            debug!("stop_capture: no active session");
            return false;
        };
        match active.stop_tx.take() {
            Some(tx) => {
                info!("Session[{}] stop requested", active.id);
                tx.send(()).is_ok()
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.slot).is_some()
    }

    pub fn active_session(&self) -> Option<SessionId> {
        lock(&self.slot).as_ref().map(|a| a.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use stillcap_capture::scripted::frames;
    use stillcap_capture::{ScriptedSource, SourceProbe};
    use stillcap_core::{
        AcquireError, CaptureEvent, CaptureOutcome, EncodeError, ErrorKind, ExhaustionPolicy, Frame,
    };
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::dispatcher::ChannelSink;
    use crate::writer::PngFileWriter;

    /// Records which delivery it was asked to encode.
    #[derive(Default)]
    struct RecordingWriter {
        written: Mutex<Vec<u64>>,
        fail: bool,
    }

    impl RecordingWriter {
        fn failing() -> Self {
            Self { fail: true, ..Default::default() }
        }

        fn written(&self) -> Vec<u64> {
            self.written.lock().unwrap().clone()
        }
    }

    impl FrameWriter for RecordingWriter {
        fn write(&self, frame: &Frame) -> Result<PathBuf, EncodeError> {
            if self.fail {
                return Err(EncodeError::Encoding("disk full".into()));
            }
            self.written.lock().unwrap().push(frame.sequence());
            Ok(PathBuf::from(format!("/captures/frame_{}.png", frame.sequence())))
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn geometry() -> TargetGeometry {
        TargetGeometry::new(200, 400, 420)
    }

    fn dialog() -> Frame {
        frames::solid(200, 400, [245, 245, 245, 255])
    }

    fn content() -> Frame {
        frames::checkerboard(200, 400, 10)
    }

    fn grant() -> CaptureGrant {
        CaptureGrant::new(&b"grant"[..])
    }

    fn setup(
        source: ScriptedSource,
        writer: Arc<dyn FrameWriter>,
        config: SessionConfig,
    ) -> (CaptureController, SourceProbe) {
        let probe = source.probe();
        (CaptureController::new(Arc::new(source), writer, config).unwrap(), probe)
    }

    /// Wait for the outcome, then make sure nothing else ever follows it.
    async fn single_event(rx: &mut UnboundedReceiver<CaptureEvent>) -> CaptureEvent {
        let event = rx.recv().await.expect("one capture event");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err(), "a second outcome was dispatched");
        event
    }

    fn assert_fully_released(probe: &SourceProbe) {
        let snap = probe.snapshot();
        assert_eq!(snap.live_surfaces, 0, "{snap:?}");
        assert_eq!(snap.live_subscriptions, 0, "{snap:?}");
        assert_eq!(snap.releases, snap.opens, "{snap:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new().frame_after(ms(200), frames::checkerboard(1080, 2400, 10));
        let (controller, probe) = setup(
            source,
            Arc::new(PngFileWriter::new(dir.path())),
            SessionConfig::default(),
        );
        let (sink, mut rx) = ChannelSink::new();
        let grant = grant();

        let started = tokio::time::Instant::now();
        let id = controller
            .start_capture(grant.clone(), TargetGeometry::new(1080, 2400, 420), sink)
            .unwrap();
        let event = single_event(&mut rx).await;

        assert_eq!(event.session_id, id);
        let path = event.outcome.path().expect("accepted outcome").to_path_buf();
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("png"));
        assert!(path.exists());
        assert!(started.elapsed() >= ms(1_700));

        assert_fully_released(&probe);
        assert!(grant.is_consumed());
        assert!(!controller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn dialog_then_content_accepts_third_frame() {
        let source = ScriptedSource::new()
            .frame_after(ms(200), dialog())
            .frame_after(ms(700), dialog())
            .frame_after(ms(700), content());
        let writer = Arc::new(RecordingWriter::default());
        let (controller, probe) = setup(source, writer.clone(), SessionConfig::default());
        let (sink, mut rx) = ChannelSink::new();

        controller.start_capture(grant(), geometry(), sink).unwrap();
        let event = single_event(&mut rx).await;

        assert_eq!(event.outcome, CaptureOutcome::Accepted { path: "/captures/frame_3.png".into() });
        assert_eq!(writer.written(), vec![3]);
        assert_eq!(probe.snapshot().subscriptions, 1);
        assert_fully_released(&probe);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_accept_last_frame() {
        let source = ScriptedSource::new()
            .frame_after(ms(200), dialog())
            .frame_after(ms(700), dialog())
            .frame_after(ms(700), dialog())
            .frame_after(ms(700), content());
        let writer = Arc::new(RecordingWriter::default());
        let (controller, probe) = setup(source, writer.clone(), SessionConfig::default());
        let (sink, mut rx) = ChannelSink::new();

        controller.start_capture(grant(), geometry(), sink).unwrap();
        let event = single_event(&mut rx).await;

        assert!(event.outcome.is_accepted(), "{:?}", event.outcome);
        assert_eq!(writer.written(), vec![3], "must accept on attempt 3, not wait for content");
        assert_fully_released(&probe);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_policy_reports_exhaustion() {
        let source = ScriptedSource::new()
            .frame_after(ms(200), dialog())
            .frame_after(ms(700), dialog());
        let writer = Arc::new(RecordingWriter::default());
        let config = SessionConfig {
            max_attempts: 2,
            exhaustion_policy: ExhaustionPolicy::Fail,
            ..Default::default()
        };
        let (controller, probe) = setup(source, writer.clone(), config);
        let (sink, mut rx) = ChannelSink::new();

        controller.start_capture(grant(), geometry(), sink).unwrap();
        let event = single_event(&mut rx).await;

        assert_eq!(event.outcome.error_kind(), Some(ErrorKind::Exhausted));
        assert!(writer.written().is_empty());
        assert_fully_released(&probe);
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_deliveries_yield_one_outcome() {
        let source = ScriptedSource::new().burst_after(ms(200), vec![content(), content()]);
        let writer = Arc::new(RecordingWriter::default());
        let (controller, probe) = setup(source, writer.clone(), SessionConfig::default());
        let (sink, mut rx) = ChannelSink::new();

        controller.start_capture(grant(), geometry(), sink).unwrap();
        let event = single_event(&mut rx).await;

        assert!(event.outcome.is_accepted());
        assert_eq!(writer.written(), vec![1]);
        assert_eq!(probe.snapshot().delivered, 2);
        assert_fully_released(&probe);
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_during_retry_wait_is_dropped() {
        // Frame 2 arrives while frame 1's retry wait is running: never classified.
        let source = ScriptedSource::new()
            .burst_after(ms(200), vec![dialog(), content()])
            .frame_after(ms(800), content());
        let writer = Arc::new(RecordingWriter::default());
        let (controller, _probe) = setup(source, writer.clone(), SessionConfig::default());
        let (sink, mut rx) = ChannelSink::new();

        controller.start_capture(grant(), geometry(), sink).unwrap();
        let event = single_event(&mut rx).await;

        assert!(event.outcome.is_accepted());
        assert_eq!(writer.written(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_grant_never_subscribes() {
        let source = ScriptedSource::new()
            .fail_redemption(AcquireError::SecurityDenied { reason: "user declined".into() })
            .frame_after(ms(200), content());
        let writer = Arc::new(RecordingWriter::default());
        let (controller, probe) = setup(source, writer.clone(), SessionConfig::default());
        let (sink, mut rx) = ChannelSink::new();
        let grant = grant();

        controller.start_capture(grant.clone(), geometry(), sink).unwrap();
        let event = single_event(&mut rx).await;

        assert_eq!(event.outcome.error_kind(), Some(ErrorKind::SecurityDenied));
        assert_eq!(probe.snapshot().subscriptions, 0);
        assert!(writer.written().is_empty());
        assert!(grant.is_consumed());
    }

    #[tokio::test(start_paused = true)]
    async fn redemption_errors_keep_their_kind() {
        for (error, kind) in [
            (AcquireError::Rejected { reason: "stale".into() }, ErrorKind::GrantRedemptionFailed),
            (AcquireError::Unavailable { reason: "no portal".into() }, ErrorKind::SourceUnavailable),
        ] {
            let source = ScriptedSource::new().fail_redemption(error);
            let (controller, _probe) = setup(source, Arc::new(RecordingWriter::default()), SessionConfig::default());
            let (sink, mut rx) = ChannelSink::new();

            controller.start_capture(grant(), geometry(), sink).unwrap();
            assert_eq!(single_event(&mut rx).await.outcome.error_kind(), Some(kind));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_settling_cancels() {
        let source = ScriptedSource::new().frame_after(ms(200), content());
        let writer = Arc::new(RecordingWriter::default());
        let (controller, probe) = setup(source, writer.clone(), SessionConfig::default());
        let (sink, mut rx) = ChannelSink::new();

        controller.start_capture(grant(), geometry(), sink).unwrap();
        tokio::time::sleep(ms(500)).await;
        assert!(controller.stop_capture());
        assert!(!controller.stop_capture(), "second stop must be a no-op");

        let event = single_event(&mut rx).await;
        assert_eq!(event.outcome, CaptureOutcome::Cancelled);
        assert_eq!(probe.snapshot().subscriptions, 0);
        assert!(writer.written().is_empty());
        assert_fully_released(&probe);
        assert!(!controller.stop_capture());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_retry_wait_cancels() {
        let source = ScriptedSource::new()
            .frame_after(ms(200), dialog())
            .repeat_every(ms(100), content());
        let writer = Arc::new(RecordingWriter::default());
        let (controller, probe) = setup(source, writer.clone(), SessionConfig::default());
        let (sink, mut rx) = ChannelSink::new();

        controller.start_capture(grant(), geometry(), sink).unwrap();
        // Subscribed at 1500 ms, suspect frame at 1700 ms, retry wait until 2200 ms.
        tokio::time::sleep(ms(2_000)).await;
        assert!(controller.stop_capture());

        assert_eq!(single_event(&mut rx).await.outcome, CaptureOutcome::Cancelled);
        assert!(writer.written().is_empty());
        assert_fully_released(&probe);
    }

    #[tokio::test(start_paused = true)]
    async fn platform_revocation_is_an_unexpected_stop() {
        let source = ScriptedSource::new().revoke_after(ms(100), "permission revoked from quick settings");
        let (controller, probe) = setup(source, Arc::new(RecordingWriter::default()), SessionConfig::default());
        let (sink, mut rx) = ChannelSink::new();

        controller.start_capture(grant(), geometry(), sink).unwrap();
        let event = single_event(&mut rx).await;

        assert_eq!(event.outcome.error_kind(), Some(ErrorKind::UnexpectedStop));
        assert_fully_released(&probe);
    }

    #[tokio::test(start_paused = true)]
    async fn source_fault_is_an_internal_error() {
        let source = ScriptedSource::new().fault_after(ms(100), "buffer mapping failed");
        let (controller, _probe) = setup(source, Arc::new(RecordingWriter::default()), SessionConfig::default());
        let (sink, mut rx) = ChannelSink::new();

        controller.start_capture(grant(), geometry(), sink).unwrap();
        assert_eq!(single_event(&mut rx).await.outcome.error_kind(), Some(ErrorKind::InternalError));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_source_times_out() {
        let (controller, probe) = setup(
            ScriptedSource::new(),
            Arc::new(RecordingWriter::default()),
            SessionConfig::default(),
        );
        let (sink, mut rx) = ChannelSink::new();

        let started = tokio::time::Instant::now();
        controller.start_capture(grant(), geometry(), sink).unwrap();
        let event = rx.recv().await.expect("timeout outcome");

        assert_eq!(event.outcome.error_kind(), Some(ErrorKind::Timeout));
        assert!(started.elapsed() >= ms(6_500));
        assert_fully_released(&probe);
    }

    #[tokio::test(start_paused = true)]
    async fn encode_failure_is_reported() {
        let source = ScriptedSource::new().frame_after(ms(200), content());
        let (controller, probe) = setup(source, Arc::new(RecordingWriter::failing()), SessionConfig::default());
        let (sink, mut rx) = ChannelSink::new();

        controller.start_capture(grant(), geometry(), sink).unwrap();
        let event = single_event(&mut rx).await;

        assert_eq!(event.outcome.error_kind(), Some(ErrorKind::EncodeFailed));
        assert_fully_released(&probe);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_requests_are_rejected_synchronously() {
        let (controller, probe) = setup(
            ScriptedSource::new().frame_after(ms(200), content()),
            Arc::new(RecordingWriter::default()),
            SessionConfig::default(),
        );
        let (sink, mut rx) = ChannelSink::new();

        let err = controller
            .start_capture(grant(), TargetGeometry::new(0, 2400, 420), sink.clone())
            .unwrap_err();
        assert_eq!(err, RequestError::InvalidGeometry { width: 0, height: 2400 });
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        let used = grant();
        used.consume();
        assert_eq!(
            controller.start_capture(used.clone(), geometry(), sink.clone()),
            Err(RequestError::GrantConsumed(used.id()))
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(probe.snapshot().opens, 0);
        assert!(rx.try_recv().is_err());
        assert!(!controller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn one_session_at_a_time() {
        let source = ScriptedSource::new().frame_after(ms(200), content());
        let (controller, probe) = setup(source, Arc::new(RecordingWriter::default()), SessionConfig::default());
        let (sink, mut rx) = ChannelSink::new();

        let first = controller.start_capture(grant(), geometry(), sink.clone()).unwrap();
        assert_eq!(controller.active_session(), Some(first));
        assert_eq!(
            controller.start_capture(grant(), geometry(), sink.clone()),
            Err(RequestError::SessionActive(first))
        );

        assert!(rx.recv().await.unwrap().outcome.is_accepted());
        // The slot is free as soon as the outcome is visible.
        let second = controller.start_capture(grant(), geometry(), sink).unwrap();
        assert_ne!(first, second);
        assert!(rx.recv().await.unwrap().outcome.is_accepted());

        assert_eq!(probe.snapshot().opens, 2);
        assert_fully_released(&probe);
    }

    #[tokio::test(start_paused = true)]
    async fn frame_timeout_rearms_after_retry() {
        let source = ScriptedSource::new().frame_after(ms(200), dialog());
        let writer = Arc::new(RecordingWriter::default());
        let (controller, probe) = setup(source, writer.clone(), SessionConfig::default());
        let (sink, mut rx) = ChannelSink::new();

        let started = tokio::time::Instant::now();
        controller.start_capture(grant(), geometry(), sink).unwrap();
        let event = rx.recv().await.expect("timeout outcome");

        // settle 1500 + delivery 200 + retry wait 500 + frame timeout 5000
        assert_eq!(event.outcome.error_kind(), Some(ErrorKind::Timeout));
        let elapsed = started.elapsed();
        assert!(elapsed >= ms(7_200) && elapsed < ms(7_300), "{elapsed:?}");
        assert!(writer.written().is_empty());
        assert_fully_released(&probe);
    }

    /// Blocks inside `write` until the test lets it go.
    struct GatedWriter {
        entered: Mutex<Option<oneshot::Sender<()>>>,
        proceed: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl FrameWriter for GatedWriter {
        fn write(&self, frame: &Frame) -> Result<PathBuf, EncodeError> {
            if let Some(tx) = self.entered.lock().unwrap().take() {
                let _ = tx.send(());
            }
            let _ = self.proceed.lock().unwrap().recv();
            Ok(PathBuf::from(format!("/captures/frame_{}.png", frame.sequence())))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_encoding_is_refused() {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (proceed_tx, proceed_rx) = std::sync::mpsc::channel();
        let writer = Arc::new(GatedWriter {
            entered: Mutex::new(Some(entered_tx)),
            proceed: Mutex::new(proceed_rx),
        });
        let source = ScriptedSource::new().frame_after(ms(200), content());
        let (controller, probe) = setup(source, writer, SessionConfig::default());
        let (sink, mut rx) = ChannelSink::new();

        controller.start_capture(grant(), geometry(), sink).unwrap();
        entered_rx.await.unwrap();

        assert!(controller.is_active());
        assert!(!controller.stop_capture(), "accepted session must refuse the stop");
        proceed_tx.send(()).unwrap();

        let event = single_event(&mut rx).await;
        assert_eq!(event.outcome, CaptureOutcome::Accepted { path: "/captures/frame_1.png".into() });
        assert_fully_released(&probe);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SessionConfig { max_attempts: 0, ..Default::default() };
        let result = CaptureController::new(
            Arc::new(ScriptedSource::new()),
            Arc::new(RecordingWriter::default()),
            config,
        );
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));

        let mut config = SessionConfig::default();
        config.classifier.suspect_ratio = f64::NAN;
        assert!(CaptureController::new(
            Arc::new(ScriptedSource::new()),
            Arc::new(RecordingWriter::default()),
            config,
        )
        .is_err());
    }

    #[tokio::test]
    async fn stop_without_session_is_a_no_op() {
        let (controller, _probe) = setup(
            ScriptedSource::new(),
            Arc::new(RecordingWriter::default()),
            SessionConfig::default(),
        );
        assert!(!controller.stop_capture());
        assert!(!controller.stop_capture());
        assert!(!controller.is_active());
    }
}
