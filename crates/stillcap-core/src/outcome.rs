use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;
use crate::types::SessionId;

// MARK: - CaptureOutcome

/// The single terminal result of a capture session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaptureOutcome {
    /// Accepted frame, encoded and written to `path`.
    Accepted { path: PathBuf },
    Failed { kind: ErrorKind, detail: String },
    Cancelled,
}

impl CaptureOutcome {
    pub fn failed(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::Failed { kind, detail: detail.into() }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Accepted { path } => Some(path),
            _ => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

// MARK: - CaptureEvent

/// Outcome tagged with the session that produced it, as handed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureEvent {
    pub session_id: SessionId,
    pub outcome: CaptureOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_serializes_with_wire_code() {
        let outcome = CaptureOutcome::failed(ErrorKind::SecurityDenied, "user said no");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "SECURITY_DENIED");
        assert_eq!(json["detail"], "user said no");
    }

    #[test]
    fn cancelled_has_no_payload() {
        let json = serde_json::to_string(&CaptureOutcome::Cancelled).unwrap();
        assert_eq!(json, r#"{"status":"cancelled"}"#);
    }

    #[test]
    fn accepted_parses_back() {
        let json = r#"{"status":"accepted","path":"/tmp/screenshot_1.png"}"#;
        let outcome: CaptureOutcome = serde_json::from_str(json).expect("valid accepted outcome");
        assert_eq!(outcome.path(), Some(Path::new("/tmp/screenshot_1.png")));
    }
}
