//! One-time capture authorisation handed over by the host permission flow.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::RequestError;

// MARK: - GrantId

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantId(Uuid);

impl fmt::Display for GrantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// MARK: - CaptureGrant

/// Opaque proof that the user authorised a single capture.
///
/// The payload is whatever the platform needs to redeem the grant (a portal
/// restore token, a serialized permission intent, …); the core never looks
/// inside. Clones share one consumed flag, so a grant stays single-use no
/// matter how many handles exist.
#[derive(Clone)]
pub struct CaptureGrant {
    id: GrantId,
    payload: Bytes,
    issued_at: Instant,
    valid_for: Duration,
    consumed: Arc<AtomicBool>,
}

impl CaptureGrant {
    pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(60);

    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: GrantId(Uuid::new_v4()),
            payload: payload.into(),
            issued_at: Instant::now(),
            valid_for: Self::DEFAULT_VALIDITY,
            consumed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_validity(mut self, valid_for: Duration) -> Self {
        self.valid_for = valid_for;
        self
    }

    pub fn id(&self) -> GrantId {
        self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::Acquire)
    }

    pub fn is_expired(&self) -> bool {
        self.issued_at.elapsed() > self.valid_for
    }

    /// Checks the grant can still start a session.
    pub fn check_redeemable(&self) -> Result<(), RequestError> {
        if self.is_consumed() {
            return Err(RequestError::GrantConsumed(self.id));
        }
        if self.is_expired() {
            return Err(RequestError::GrantExpired(self.id));
        }
        Ok(())
    }

    /// Marks the grant used. Returns `true` only for the call that flipped it.
    pub fn consume(&self) -> bool {
        !self.consumed.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for CaptureGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureGrant")
            .field("id", &self.id)
            .field("payload_len", &self.payload.len())
            .field("valid_for", &self.valid_for)
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumption_is_shared_between_clones() {
        let grant = CaptureGrant::new(&b"token"[..]);
        let other = grant.clone();
        assert!(grant.check_redeemable().is_ok());

        assert!(other.consume());
        assert!(!grant.consume(), "second consume must report already used");
        assert_eq!(grant.check_redeemable(), Err(RequestError::GrantConsumed(grant.id())));
    }

    #[test]
    fn zero_validity_expires() {
        let grant = CaptureGrant::new(Bytes::new()).with_validity(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(grant.check_redeemable(), Err(RequestError::GrantExpired(grant.id())));
    }
}
