//! Advisory state locking.
//!
//! A lock document records who runs against a stack. Expired locks may be
//! taken over; live ones make a second run fail fast.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StateError;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300;

/// Information about a state lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// What the holder is doing, e.g. `apply`.
    #[serde(default)]
    pub operation: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock for a holder, generating a holder id when empty.
    #[must_use]
    pub fn new(holder: &str, operation: &str) -> Self {
        let now = Utc::now();
        let holder = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder,
            operation: operation.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }

    /// Returns the conflict error reported to a competing holder.
    #[must_use]
    pub fn conflict(&self) -> StateError {
        StateError::LockedByOther {
            holder: self.holder.clone(),
            since: self.acquired_at.to_rfc3339(),
        }
    }
}

/// Fails when `existing` is a live lock.
///
/// # Errors
///
/// Returns [`StateError::LockedByOther`] for an unexpired lock.
pub fn ensure_available(existing: Option<&LockInfo>) -> Result<(), StateError> {
    match existing {
        Some(lock) if !lock.is_expired() => Err(lock.conflict()),
        Some(lock) => {
            tracing::debug!("Expired lock held by {} found, taking over", lock.holder);
            Ok(())
        }
        None => Ok(()),
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());
    let pid = std::process::id();
    let uuid = Uuid::new_v4().simple().to_string();

    format!("{hostname}-{pid}-{}", &uuid[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_creation() {
        let lock = LockInfo::new("ci-runner", "apply");
        assert_eq!(lock.holder, "ci-runner");
        assert_eq!(lock.operation, "apply");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > 0);
    }

    #[test]
    fn test_empty_holder_is_generated() {
        let lock = LockInfo::new("", "apply");
        assert!(lock.holder.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_expired_lock_can_be_taken_over() {
        let mut lock = LockInfo::new("old", "apply");
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(ensure_available(Some(&lock)).is_ok());

        let live = LockInfo::new("other", "destroy");
        assert!(matches!(
            ensure_available(Some(&live)),
            Err(StateError::LockedByOther { .. })
        ));
    }

    #[test]
    fn test_holder_id_generation() {
        assert_ne!(generate_holder_id(), generate_holder_id());
    }
}
