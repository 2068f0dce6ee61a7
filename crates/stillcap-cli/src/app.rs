use std::path::PathBuf;
use std::sync::Arc;
#[cfg(not(all(target_os = "linux", feature = "pipewire")))]
use std::time::Duration;

use anyhow::{bail, Context, Result};
use stillcap_capture::FrameSource;
use stillcap_core::{CaptureGrant, CaptureOutcome, SessionConfig, TargetGeometry};
use stillcap_session::{CaptureController, ChannelSink, PngFileWriter};
use tracing::{info, warn};

const DEFAULT_GEOMETRY: TargetGeometry = TargetGeometry { width: 1080, height: 2400, density: 420 };
const DEFAULT_DENSITY: u32 = 160;

/// One capture, start to finish.
///
/// Ctrl-C while the session is running turns into Stop Capture; the
/// outcome is still printed (as `cancelled`).
pub async fn run() -> Result<()> {
    let geometry = match std::env::args().nth(1) {
        Some(arg) => parse_geometry(&arg)?,
        None => DEFAULT_GEOMETRY,
    };

    let config = match std::env::var_os("STILLCAP_CONFIG") {
        Some(path) => SessionConfig::from_json_file(&path)
            .with_context(|| format!("loading {}", PathBuf::from(&path).display()))?,
        None => SessionConfig::default(),
    };
    info!(
        "Session config: settle {}ms, retry {}ms, {} attempt(s), {:?} on exhaustion",
        config.settle_delay_ms, config.retry_interval_ms, config.max_attempts, config.exhaustion_policy
    );

    let output_dir = std::env::var_os("STILLCAP_OUTPUT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("stillcap"));

    let controller = CaptureController::new(
        frame_source(geometry),
        Arc::new(PngFileWriter::new(output_dir.clone())),
        config,
    )?;

    let token = std::env::var("STILLCAP_RESTORE_TOKEN").unwrap_or_default();
    let (sink, mut events) = ChannelSink::new();
    let id = controller.start_capture(CaptureGrant::new(token.into_bytes()), geometry, sink)?;
    info!("Session[{}] started, writing to {}", id, output_dir.display());

    let event = tokio::select! {
        event = events.recv() => event,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping capture");
            controller.stop_capture();
            events.recv().await
        }
    };
    let event = event.context("session ended without an outcome")?;

    println!("{}", serde_json::to_string_pretty(&event)?);

    match event.outcome {
        CaptureOutcome::Accepted { path } => {
            info!("Saved {}", path.display());
            Ok(())
        }
        CaptureOutcome::Cancelled => Ok(()),
        CaptureOutcome::Failed { kind, detail } => bail!("capture failed ({}): {}", kind, detail),
    }
}

#[cfg(all(target_os = "linux", feature = "pipewire"))]
fn frame_source(_geometry: TargetGeometry) -> Arc<dyn FrameSource> {
    Arc::new(stillcap_capture::PortalSource::default())
}

/// Dialog-coloured frames for the first second, then content.
#[cfg(not(all(target_os = "linux", feature = "pipewire")))]
fn frame_source(geometry: TargetGeometry) -> Arc<dyn FrameSource> {
    use stillcap_capture::scripted::frames;
    use stillcap_capture::ScriptedSource;

    let TargetGeometry { width, height, .. } = geometry;
    let dialog = frames::solid(width, height, [242, 242, 242, 255]);
    Arc::new(
        ScriptedSource::new()
            .frame_after(Duration::from_millis(100), dialog.clone())
            .frame_after(Duration::from_millis(600), dialog)
            .repeat_every(Duration::from_millis(250), frames::checkerboard(width, height, 10)),
    )
}

/// `WIDTHxHEIGHT` or `WIDTHxHEIGHT@DPI`.
fn parse_geometry(arg: &str) -> Result<TargetGeometry> {
    let (size, density) = match arg.split_once('@') {
        Some((size, dpi)) => (size, dpi.parse().with_context(|| format!("bad density in {arg:?}"))?),
        None => (arg, DEFAULT_DENSITY),
    };
    let Some((w, h)) = size.split_once(|c: char| c == 'x' || c == 'X') else {
        bail!("expected WIDTHxHEIGHT[@DPI], got {arg:?}");
    };
    let geometry = TargetGeometry::new(
        w.parse().with_context(|| format!("bad width in {arg:?}"))?,
        h.parse().with_context(|| format!("bad height in {arg:?}"))?,
        density,
    );
    geometry.validate()?;
    Ok(geometry)
}
