//! stillcap-session — capture-session orchestration.
//!
//! Captures one still frame of a display while guarding against the
//! permission dialog still being on screen right after the grant:
//!
//! 1. redeem the grant for a live frame source,
//! 2. wait out a settling delay,
//! 3. classify deliveries with a centre-uniformity heuristic,
//! 4. retry a bounded number of times, then
//! 5. encode the accepted frame and report exactly one outcome.
//!
//! ```rust,no_run
//! # async fn example() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use stillcap_capture::ScriptedSource;
//! use stillcap_core::{CaptureGrant, SessionConfig, TargetGeometry};
//! use stillcap_session::{CaptureController, ChannelSink, PngFileWriter};
//!
//! let controller = CaptureController::new(
//!     Arc::new(ScriptedSource::new()),
//!     Arc::new(PngFileWriter::new(std::env::temp_dir())),
//!     SessionConfig::default(),
//! )?;
//! let (sink, mut events) = ChannelSink::new();
//! controller.start_capture(CaptureGrant::new(&b""[..]), TargetGeometry::new(1080, 2400, 420), sink)?;
//! let event = events.recv().await;
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod controller;
pub mod dispatcher;
pub mod session;
pub mod state;
pub mod writer;

pub use classifier::{classify, Classification, Verdict};
pub use controller::CaptureController;
pub use dispatcher::{ChannelSink, FnSink, OutcomeSink, ResultDispatcher};
pub use session::CaptureSession;
pub use state::SessionState;
pub use writer::{FrameWriter, PngFileWriter};
