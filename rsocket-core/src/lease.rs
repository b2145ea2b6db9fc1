//! Lease accounting.
//!
//! When leasing is negotiated in SETUP, a requester may only start a stream
//! while it holds an unexpired lease with requests left. The same tracker is
//! used on the responder side to enforce the leases it has granted.

use crate::error::RSocketError;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct LeaseTracker {
    expires_at: Option<Instant>,
    granted: u32,
    remaining: u32,
}

impl LeaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current lease.
    pub fn grant(&mut self, ttl: Duration, request_count: u32) {
        self.expires_at = Some(Instant::now() + ttl);
        self.granted = request_count;
        self.remaining = request_count;
    }

    /// Returns whether a lease is held, unexpired and not used up.
    pub fn is_valid(&self) -> bool {
        self.remaining > 0 && self.expires_at.map_or(false, |at| Instant::now() < at)
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Spends one request from the lease.
    pub fn try_acquire(&mut self) -> Result<(), RSocketError> {
        let Some(expires_at) = self.expires_at else {
            return Err(RSocketError::Rejected("no lease received".to_string()));
        };
        if Instant::now() >= expires_at {
            return Err(RSocketError::Rejected("lease expired".to_string()));
        }
        if self.remaining == 0 {
            return Err(RSocketError::Rejected("lease exhausted".to_string()));
        }
        self.remaining -= 1;
        Ok(())
    }

    /// Fraction of the granted requests still available, 0.0 once expired.
    pub fn availability(&self) -> f64 {
        if !self.is_valid() || self.granted == 0 {
            return 0.0;
        }
        f64::from(self.remaining) / f64::from(self.granted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_lease_rejects() {
        let mut lease = LeaseTracker::new();
        assert!(!lease.is_valid());
        assert_eq!(
            lease.try_acquire(),
            Err(RSocketError::Rejected("no lease received".to_string()))
        );
        assert_eq!(lease.availability(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_counts_down() {
        let mut lease = LeaseTracker::new();
        lease.grant(Duration::from_secs(10), 2);
        assert_eq!(lease.availability(), 1.0);
        lease.try_acquire().unwrap();
        assert_eq!(lease.availability(), 0.5);
        lease.try_acquire().unwrap();
        assert!(matches!(lease.try_acquire(), Err(RSocketError::Rejected(_))));
        assert!(!lease.is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires() {
        let mut lease = LeaseTracker::new();
        lease.grant(Duration::from_secs(1), 100);
        assert!(lease.is_valid());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(
            lease.try_acquire(),
            Err(RSocketError::Rejected("lease expired".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_lease_replaces_old() {
        let mut lease = LeaseTracker::new();
        lease.grant(Duration::from_secs(1), 1);
        lease.try_acquire().unwrap();
        lease.grant(Duration::from_secs(1), 3);
        assert_eq!(lease.remaining(), 3);
    }
}
