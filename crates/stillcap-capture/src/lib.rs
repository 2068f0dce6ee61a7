//! stillcap-capture — frame source adapters.
//!
//! A frame source turns a [`CaptureGrant`] and a [`TargetGeometry`] into a
//! live stream of raw frames. Frames are pushed from the source's own worker
//! context (a GStreamer streaming thread, a tokio task, …) into a
//! [`FrameSink`]; the capture session reads them back from the paired
//! [`FrameStream`].
//!
//! # Backends
//!
//! | Backend | Source | Feature |
//! |---------|--------|---------|
//! | [`ScriptedSource`] | In-process script (demo, tests) | always |
//! | `PortalSource` | XDG ScreenCast portal + GStreamer `pipewiresrc` | `pipewire` (Linux) |
//!
//! # Lifecycle
//!
//! ```text
//! FrameSource::open(grant, geometry, sink) ──► Box<dyn LiveSource>
//!                                                 │ subscribe()   (once)
//!                                                 ▼
//!                         worker ──► FrameSink ──► FrameStream ──► session
//!                                                 │ release()     (any time, idempotent)
//!                                                 ▼
//!                                   surface freed, late frames discarded
//! ```

use async_trait::async_trait;
use stillcap_core::{AcquireError, CaptureGrant, SourceError, TargetGeometry};

pub mod scripted;
pub mod sink;

#[cfg(all(target_os = "linux", feature = "pipewire"))]
pub mod portal;

pub use scripted::{ProbeSnapshot, ScriptedSource, SourceProbe};
pub use sink::{Delivery, FrameSink, FrameStream, SourceEvent};

#[cfg(all(target_os = "linux", feature = "pipewire"))]
pub use portal::PortalSource;

// MARK: - FrameSource

/// Platform capability that redeems a grant for a live frame source.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Redeem `grant` for a source producing `geometry`-sized frames into `sink`.
    ///
    /// Delivery must not start before [`LiveSource::subscribe`]. Control
    /// events (revocation, faults) may be reported through `sink` at any time
    /// after this returns.
    async fn open(
        &self,
        grant: &CaptureGrant,
        geometry: TargetGeometry,
        sink: FrameSink,
    ) -> Result<Box<dyn LiveSource>, AcquireError>;

    /// Short backend name for logs.
    fn name(&self) -> &str;
}

// MARK: - LiveSource

/// An acquired frame source together with its backing surface.
pub trait LiveSource: Send {
    /// Start frame delivery. A source has at most one subscription.
    fn subscribe(&mut self) -> Result<(), SourceError>;

    /// Stop delivery and free the surface.
    ///
    /// Safe to call at any time, repeatedly, and concurrently with an
    /// in-flight delivery; frames produced afterwards are discarded.
    fn release(&mut self);
}
