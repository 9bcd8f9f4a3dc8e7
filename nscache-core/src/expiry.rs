//! Item expiry in memcached terms.
//!
//! Expiry is given in seconds. Zero means the item never expires. Values up
//! to thirty days are relative to the time of the write; anything larger is
//! read as an absolute Unix timestamp.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Largest expiry still treated as relative (30 days).
pub const MAX_RELATIVE_EXPIRY_SECS: u32 = 60 * 60 * 24 * 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Expiry(u32);

impl Expiry {
    /// Never expires.
    pub const NEVER: Expiry = Expiry(0);

    pub const fn from_secs(secs: u32) -> Self {
        Self(secs)
    }

    pub const fn as_secs(self) -> u32 {
        self.0
    }

    pub const fn is_never(self) -> bool {
        self.0 == 0
    }

    /// Resolve to an absolute deadline relative to `now`.
    ///
    /// Returns `None` when the item never expires.
    pub fn deadline(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.0 {
            0 => None,
            secs if secs <= MAX_RELATIVE_EXPIRY_SECS => Some(now + Duration::seconds(secs as i64)),
            secs => Some(DateTime::from_timestamp(secs as i64, 0).unwrap_or(now)),
        }
    }
}

impl From<u32> for Expiry {
    fn from(secs: u32) -> Self {
        Self(secs)
    }
}

impl From<std::time::Duration> for Expiry {
    /// Relative durations longer than thirty days are clamped to thirty days,
    /// since larger values would be read as timestamps.
    fn from(duration: std::time::Duration) -> Self {
        let secs = duration.as_secs().min(MAX_RELATIVE_EXPIRY_SECS as u64) as u32;
        Self(secs)
    }
}

/// True if an item with this deadline is expired at `now`.
pub fn is_expired(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    deadline.is_some_and(|d| d <= now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never() {
        let now = Utc::now();
        assert_eq!(Expiry::NEVER.deadline(now), None);
        assert!(Expiry::default().is_never());
    }

    #[test]
    fn test_relative() {
        let now = Utc::now();
        assert_eq!(
            Expiry::from_secs(1).deadline(now),
            Some(now + Duration::seconds(1))
        );
        assert_eq!(
            Expiry::from_secs(MAX_RELATIVE_EXPIRY_SECS).deadline(now),
            Some(now + Duration::seconds(MAX_RELATIVE_EXPIRY_SECS as i64))
        );
    }

    #[test]
    fn test_absolute_timestamp() {
        let now = Utc::now();
        let ts = MAX_RELATIVE_EXPIRY_SECS + 1;
        let deadline = Expiry::from_secs(ts).deadline(now).unwrap();
        assert_eq!(deadline.timestamp(), ts as i64);
        // A timestamp in 1970 is already in the past.
        assert!(is_expired(Some(deadline), now));
    }

    #[test]
    fn test_from_duration_clamps() {
        let e = Expiry::from(std::time::Duration::from_secs(5));
        assert_eq!(e.as_secs(), 5);
        let e = Expiry::from(std::time::Duration::from_secs(90 * 24 * 3600));
        assert_eq!(e.as_secs(), MAX_RELATIVE_EXPIRY_SECS);
    }

    #[test]
    fn test_is_expired() {
        let now = Utc::now();
        assert!(!is_expired(None, now));
        assert!(is_expired(Some(now), now));
        assert!(!is_expired(Some(now + Duration::seconds(1)), now));
    }
}
