//! PipeWire screen capture through the XDG desktop portal.
//!
//! ```text
//! ashpd ScreenCast portal ──► PipeWire node_id + remote fd     (open)
//!                                    │
//!                                    ▼
//!                      pipewiresrc(fd=X, path=Y)
//!                                    │
//!              videoconvert ! videoscale ! videorate
//!                                    │
//!                        video/x-raw,format=BGRx,WxH
//!                                    │
//!                                 appsink ──► FrameSink           (subscribe)
//! ```
//!
//! Redeeming the grant is what shows the portal's permission dialog, which is
//! exactly why the first frames after `subscribe` are not trusted.
//!
//! The portal session and the PipeWire remote fd belong to the live source
//! and are given back in `release()`.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use ashpd::desktop::screencast::{CursorMode, Screencast, SourceType};
use ashpd::desktop::{PersistMode, Session};
use async_trait::async_trait;
use bytes::Bytes;
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSinkCallbacks};
use stillcap_core::{AcquireError, CaptureGrant, Frame, PixelFormat, SourceError, TargetGeometry};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::sink::{Delivery, FrameSink};
use crate::{FrameSource, LiveSource};

// ── PortalSource ──────────────────────────────────────────────────────────────

/// Frame source backed by the ScreenCast portal and GStreamer.
#[derive(Debug, Clone)]
pub struct PortalSource {
    /// Which of the portal's returned streams to capture.
    pub display_index: u8,
    pub fps: u32,
}

impl Default for PortalSource {
    fn default() -> Self {
        Self { display_index: 0, fps: 30 }
    }
}

#[async_trait]
impl FrameSource for PortalSource {
    async fn open(
        &self,
        grant: &CaptureGrant,
        geometry: TargetGeometry,
        sink: FrameSink,
    ) -> Result<Box<dyn LiveSource>, AcquireError> {
        gstreamer::init().map_err(|e| AcquireError::Unavailable { reason: format!("GStreamer init: {e}") })?;

        // A non-empty UTF-8 payload is a portal restore token from an earlier session.
        let restore_token = std::str::from_utf8(grant.payload()).ok().filter(|t| !t.is_empty());
        let portal = negotiate_portal(self.display_index, restore_token).await?;
        info!(
            "PipeWire portal ok: node_id={} fd={} (display={}, grant={})",
            portal.node_id, portal.fd.as_raw_fd(), self.display_index, grant.id()
        );

        let pipeline = match build_pipeline(geometry, self.fps, &portal.fd, portal.node_id, sink.clone()) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                if let Err(close) = portal.session.close().await {
                    warn!("Closing ScreenCast session: {}", close);
                }
                // `portal.fd` drops here and closes the remote.
                return Err(AcquireError::Unavailable { reason: format!("{e:#}") });
            }
        };

        Ok(Box::new(PortalLive {
            pipeline,
            sink,
            session: Some(portal.session),
            fd: Some(portal.fd),
            watcher: None,
            watcher_stop: Arc::new(AtomicBool::new(false)),
            released: false,
        }))
    }

    fn name(&self) -> &str {
        "pipewire-portal"
    }
}

// ── Portal negotiation ────────────────────────────────────────────────────────

type PortalSession = Session<'static, Screencast<'static>>;

struct PortalStream {
    session: PortalSession,
    node_id: u32,
    fd:      OwnedFd,
}

/// Ask the desktop portal for a PipeWire screen-cast stream.
async fn negotiate_portal(
    display_index: u8,
    restore_token: Option<&str>,
) -> Result<PortalStream, AcquireError> {
    let unavailable = |what: &str, e: ashpd::Error| AcquireError::Unavailable { reason: format!("{what}: {e}") };
    let rejected = |what: &str, e: ashpd::Error| AcquireError::Rejected { reason: format!("{what}: {e}") };

    let proxy = Screencast::new().await.map_err(|e| unavailable("ScreenCast portal", e))?;

    let session = proxy
        .create_session()
        .await
        .map_err(|e| rejected("create_session", e))?;

    proxy
        .select_sources(
            &session,
            CursorMode::Embedded,
            SourceType::Monitor.into(),
            false,
            restore_token,
            PersistMode::DoNot,
        )
        .await
        .map_err(|e| rejected("select_sources", e))?;

    let started = async {
        let response = proxy
            .start(&session, None)
            .await
            .map_err(|e| rejected("portal start", e))?
            .response()
            .map_err(|e| AcquireError::SecurityDenied { reason: format!("portal denied: {e}") })?;

        let streams = response.streams();
        let stream = streams
            .get(display_index as usize)
            .or_else(|| streams.first())
            .ok_or_else(|| AcquireError::Unavailable { reason: "No PipeWire streams returned by portal".into() })?;
        let node_id = stream.pipe_wire_node_id();

        let fd = proxy
            .open_pipe_wire_remote(&session)
            .await
            .map_err(|e| rejected("open_pipe_wire_remote", e))?;
        Ok::<_, AcquireError>((node_id, fd))
    }
    .await;

    match started {
        Ok((node_id, fd)) => Ok(PortalStream { session, node_id, fd }),
        Err(e) => {
            if let Err(close) = session.close().await {
                warn!("Closing ScreenCast session: {}", close);
            }
            Err(e)
        }
    }
}

/// Close the portal session from a sync context. Needs a tokio runtime.
fn close_session(session: PortalSession) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = session.close().await {
                    warn!("Closing ScreenCast session: {}", e);
                }
            });
        }
        Err(_) => warn!("No runtime to close the ScreenCast session; the portal reaps it on disconnect"),
    }
}

// ── GStreamer pipeline ────────────────────────────────────────────────────────

/// The monitor's native size and rate rarely match the target, so scale and
/// rate-convert before the caps filter.
fn pipeline_description(geometry: TargetGeometry, fps: u32, fd: RawFd, node_id: u32) -> String {
    let TargetGeometry { width, height, .. } = geometry;
    format!(
        "pipewiresrc fd={fd} path={node_id} do-timestamp=true \
         ! videoconvert \
         ! videoscale \
         ! videorate \
         ! video/x-raw,format=BGRx,width={width},height={height},framerate={fps}/1 \
         ! appsink name=sink max-buffers=1 drop=true sync=false emit-signals=false"
    )
}

fn build_pipeline(
    geometry: TargetGeometry,
    fps: u32,
    fd: &OwnedFd,
    node_id: u32,
    sink: FrameSink,
) -> anyhow::Result<gstreamer::Pipeline> {
    let (w, h) = (geometry.width, geometry.height);
    // pipewiresrc dups the fd; the original stays owned by the caller.
    let desc = pipeline_description(geometry, fps, fd.as_raw_fd(), node_id);
    debug!("GStreamer pipeline: {}", desc);

    let pipeline = gstreamer::parse::launch(&desc)
        .context("Parsing GStreamer pipeline")?
        .downcast::<gstreamer::Pipeline>()
        .map_err(|_| anyhow::anyhow!("Expected Pipeline element"))?;

    let appsink: AppSink = pipeline
        .by_name("sink")
        .context("Finding appsink 'sink'")?
        .downcast::<AppSink>()
        .map_err(|_| anyhow::anyhow!("Expected AppSink"))?;

    appsink.set_callbacks(
        AppSinkCallbacks::builder()
            .new_sample(move |appsink| {
                let sample = appsink.pull_sample().map_err(|_| gstreamer::FlowError::Eos)?;
                let buffer = sample.buffer().ok_or(gstreamer::FlowError::Error)?;
                let map = buffer.map_readable().map_err(|_| gstreamer::FlowError::Error)?;

                let frame = match Frame::packed(Bytes::copy_from_slice(map.as_slice()), w, h, PixelFormat::Bgrx8888) {
                    Ok(frame) => frame,
                    Err(e) => {
                        sink.fault(format!("PipeWire buffer: {e}"));
                        return Err(gstreamer::FlowError::Error);
                    }
                };

                match sink.deliver(frame) {
                    Delivery::DroppedReleased => Err(gstreamer::FlowError::Flushing),
                    _ => Ok(gstreamer::FlowSuccess::Ok),
                }
            })
            .build(),
    );

    Ok(pipeline)
}

// ── PortalLive ────────────────────────────────────────────────────────────────

struct PortalLive {
    pipeline:     gstreamer::Pipeline,
    sink:         FrameSink,
    session:      Option<PortalSession>,
    fd:           Option<OwnedFd>,
    watcher:      Option<JoinHandle<()>>,
    watcher_stop: Arc<AtomicBool>,
    released:     bool,
}

impl LiveSource for PortalLive {
    fn subscribe(&mut self) -> Result<(), SourceError> {
        if self.released {
            return Err(SourceError::Released);
        }
        if self.watcher.is_some() {
            return Err(SourceError::AlreadySubscribed);
        }

        self.pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| SourceError::Platform { reason: format!("GStreamer set Playing: {e}") })?;

        // Watch the bus for EOS / errors on a blocking thread.
        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| SourceError::Platform { reason: "pipeline has no bus".into() })?;
        let sink = self.sink.clone();
        let stop = Arc::clone(&self.watcher_stop);
        self.watcher = Some(tokio::task::spawn_blocking(move || {
            while !stop.load(Ordering::Acquire) {
                let Some(msg) = bus.timed_pop(gstreamer::ClockTime::from_mseconds(250)) else {
                    continue;
                };
                match msg.view() {
                    gstreamer::MessageView::Eos(_) => {
                        info!("GStreamer pipeline EOS");
                        sink.stopped("PipeWire stream ended");
                        break;
                    }
                    gstreamer::MessageView::Error(e) => {
                        error!("GStreamer error: {}", e.error());
                        sink.fault(format!("GStreamer error: {}", e.error()));
                        break;
                    }
                    _ => {}
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
        self.watcher_stop.store(true, Ordering::Release);
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            warn!("GStreamer set Null on release: {}", e);
        }
        // The watcher exits within one bus poll; no need to join it here.
        self.watcher.take();
        self.fd.take();
        if let Some(session) = self.session.take() {
            close_session(session);
        }
        debug!("PipeWire capture released");
    }
}

impl Drop for PortalLive {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::sink;

    #[test]
    fn pipeline_scales_to_target_geometry() {
        let desc = pipeline_description(TargetGeometry::new(1080, 2400, 420), 30, 42, 7);
        assert!(desc.contains("pipewiresrc fd=42 path=7"));
        let scale = desc.find("videoscale").expect("videoscale in pipeline");
        let caps = desc.find("width=1080,height=2400").expect("target caps");
        assert!(scale < caps, "videoscale must come before the caps filter: {desc}");
        assert!(desc.contains("framerate=30/1"));
    }

    #[test]
    fn release_closes_remote_fd() {
        gstreamer::init().unwrap();
        let fd: OwnedFd = std::fs::File::open("/dev/null").unwrap().into();
        let raw = fd.as_raw_fd();
        let proc_entry = format!("/proc/self/fd/{raw}");
        assert_eq!(std::fs::read_link(&proc_entry).unwrap(), Path::new("/dev/null"));

        let (frame_sink, _stream) = sink::channel(1);
        let mut live = PortalLive {
            pipeline: gstreamer::Pipeline::new(),
            sink: frame_sink.clone(),
            session: None,
            fd: Some(fd),
            watcher: None,
            watcher_stop: Arc::new(AtomicBool::new(false)),
            released: false,
        };
        live.release();

        assert!(live.fd.is_none());
        assert!(frame_sink.is_released());
        // The number may already be reused by another test's runtime, but not for /dev/null.
        let target = std::fs::read_link(&proc_entry).ok();
        assert_ne!(target.as_deref(), Some(Path::new("/dev/null")), "remote fd {raw} still open after release");
        live.release();
    }
}
