//! Stillcap — grab one still frame of a display, after the permission
//! dialog has had time to go away.
//!
//! ```text
//! stillcap [WIDTHxHEIGHT[@DPI]]
//!
//!   STILLCAP_CONFIG        JSON session config (optional)
//!   STILLCAP_OUTPUT_DIR    where PNGs go (default: $TMPDIR/stillcap)
//!   STILLCAP_RESTORE_TOKEN portal restore token (pipewire builds)
//! ```
//!
//! Without the `pipewire` feature the binary drives a scripted source that
//! shows a flat "dialog" frame first and real content afterwards.

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG=stillcap_session=debug shows every state transition.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    info!("Stillcap v{}", env!("CARGO_PKG_VERSION"));

    match app::run().await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Fatal error: {:#}", e);
            Err(e)
        }
    }
}
