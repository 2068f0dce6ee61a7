pub mod config;
pub mod errors;
pub mod grant;
pub mod outcome;
pub mod types;

pub use config::{ClassifierConfig, ExhaustionPolicy, SessionConfig};
pub use errors::{AcquireError, ConfigError, EncodeError, ErrorKind, FrameError, RequestError, SourceError};
pub use grant::{CaptureGrant, GrantId};
pub use outcome::{CaptureEvent, CaptureOutcome};
pub use types::*;
