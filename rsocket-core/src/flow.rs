//! Request-n flow control.
//!
//! Each stream direction has its own counter. The receiver grants credit
//! with REQUEST_N (or the initial count on REQUEST_STREAM/REQUEST_CHANNEL);
//! the sender spends one unit per PAYLOAD with NEXT. A balance of
//! `MAX_REQUEST_N` means "unbounded" and is never decremented.

use rsocket_protocol::MAX_REQUEST_N;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Raised when an item is emitted or received without credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("flow control credit exhausted")]
pub struct CreditExhausted;

/// A per-direction request-n counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Credit {
    available: u32,
}

impl Credit {
    pub fn new(initial: u32) -> Self {
        Self {
            available: initial.min(MAX_REQUEST_N),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(MAX_REQUEST_N)
    }

    pub fn available(&self) -> u32 {
        self.available
    }

    pub fn is_unbounded(&self) -> bool {
        self.available == MAX_REQUEST_N
    }

    pub fn has_credit(&self) -> bool {
        self.available > 0
    }

    /// Adds `n` units, saturating at unbounded.
    pub fn grant(&mut self, n: u32) {
        self.available = self.available.saturating_add(n).min(MAX_REQUEST_N);
    }

    /// Spends one unit.
    pub fn consume(&mut self) -> Result<(), CreditExhausted> {
        if self.is_unbounded() {
            return Ok(());
        }
        if self.available == 0 {
            return Err(CreditExhausted);
        }
        self.available -= 1;
        Ok(())
    }
}

/// Converts a request-n grant into semaphore permits.
pub(crate) fn permits(n: u32) -> usize {
    if n >= MAX_REQUEST_N {
        Semaphore::MAX_PERMITS
    } else {
        n as usize
    }
}

/// Adds `n` units of credit to a producer semaphore without overflowing it.
pub(crate) fn add_permits(semaphore: &Arc<Semaphore>, n: u32) {
    let room = Semaphore::MAX_PERMITS - semaphore.available_permits();
    semaphore.add_permits(permits(n).min(room));
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_consume_until_exhausted() {
        let mut credit = Credit::new(2);
        assert!(credit.consume().is_ok());
        assert!(credit.consume().is_ok());
        assert_eq!(credit.consume(), Err(CreditExhausted));
        credit.grant(1);
        assert!(credit.consume().is_ok());
    }

    #[test]
    fn test_grant_saturates() {
        let mut credit = Credit::new(MAX_REQUEST_N - 1);
        credit.grant(10);
        assert!(credit.is_unbounded());
        credit.grant(u32::MAX);
        assert_eq!(credit.available(), MAX_REQUEST_N);
    }

    #[test]
    fn test_unbounded_never_decrements() {
        let mut credit = Credit::unbounded();
        for _ in 0..1000 {
            credit.consume().unwrap();
        }
        assert!(credit.is_unbounded());
    }

    #[test]
    fn test_permits() {
        assert_eq!(permits(5), 5);
        assert_eq!(permits(MAX_REQUEST_N), Semaphore::MAX_PERMITS);

        let semaphore = Arc::new(Semaphore::new(Semaphore::MAX_PERMITS));
        add_permits(&semaphore, 10);
        assert_eq!(semaphore.available_permits(), Semaphore::MAX_PERMITS);
    }

    proptest! {
        #[test]
        fn prop_deliveries_never_exceed_grants(ops in proptest::collection::vec((any::<bool>(), 1u32..100), 0..200)) {
            let mut credit = Credit::new(0);
            let mut granted: u64 = 0;
            let mut delivered: u64 = 0;
            for (is_grant, n) in ops {
                if is_grant {
                    credit.grant(n);
                    granted += u64::from(n);
                } else if credit.consume().is_ok() {
                    delivered += 1;
                }
                prop_assert!(delivered <= granted);
                prop_assert_eq!(u64::from(credit.available()), granted - delivered);
            }
        }
    }
}
