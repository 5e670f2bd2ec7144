//! Pending service lookups
//!
//! A `FIND_SERVICE` for a service provided by another domain is answered
//! asynchronously: init sends `REQUEST_EP(token)` to the provider and parks
//! the requester here until the matching `DELIVER_EP(status, token)` arrives
//! or the deadline passes.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::time::Duration;

use tern_ipc::{ChannelId, CorrelationId, ServiceId};

/// A lookup waiting for its provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingLookup {
    /// Channel the `FIND_SERVICE` arrived on
    pub requester: ChannelId,
    pub service: ServiceId,
    /// Kernel time after which the requester gets `Timeout`
    pub deadline: Duration,
}

#[derive(Debug)]
pub struct Router {
    pending: BTreeMap<CorrelationId, PendingLookup>,
    next_token: usize,
}

impl Default for Router {
    fn default() -> Self {
        Self { pending: BTreeMap::new(), next_token: 1 }
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a lookup and hand out the token the provider must echo
    pub fn begin(&mut self, requester: ChannelId, service: ServiceId, deadline: Duration) -> CorrelationId {
        let mut token = CorrelationId(self.next_token);
        while token.0 == 0 || self.pending.contains_key(&token) {
            token = CorrelationId(token.0.wrapping_add(1));
        }
        self.next_token = token.0.wrapping_add(1);
        self.pending.insert(token, PendingLookup { requester, service, deadline });
        token
    }

    /// Remove and return the lookup `token` answers
    pub fn complete(&mut self, token: CorrelationId) -> Option<PendingLookup> {
        self.pending.remove(&token)
    }

    /// Remove every lookup whose deadline is at or before `now`
    pub fn expire(&mut self, now: Duration) -> Vec<(CorrelationId, PendingLookup)> {
        let expired: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(token, _)| *token)
            .collect();
        expired
            .into_iter()
            .filter_map(|token| self.pending.remove(&token).map(|p| (token, p)))
            .collect()
    }

    /// Forget lookups made over `chan`; their answers will be dropped
    pub fn drop_requester(&mut self, chan: ChannelId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.requester != chan);
        before - self.pending.len()
    }

    /// Earliest deadline of any pending lookup
    pub fn next_deadline(&self) -> Option<Duration> {
        self.pending.values().map(|p| p.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_deliver_removes_entry() {
        let mut router = Router::new();
        let token = router.begin(4, ServiceId::TEST, ms(100));
        assert_eq!(router.len(), 1);

        let pending = router.complete(token).unwrap();
        assert_eq!(pending.requester, 4);
        assert_eq!(pending.service, ServiceId::TEST);
        // A second delivery with the same token is unknown
        assert_eq!(router.complete(token), None);
        assert!(router.is_empty());
    }

    #[test]
    fn test_tokens_are_distinct() {
        let mut router = Router::new();
        let a = router.begin(1, ServiceId::TEST, ms(10));
        let b = router.begin(1, ServiceId::TEST, ms(10));
        let c = router.begin(2, ServiceId::FILESYSTEM, ms(10));
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a.0, 0);
    }

    #[test]
    fn test_token_wrap_skips_live_entries() {
        let mut router = Router::new();
        let first = router.begin(1, ServiceId::TEST, ms(10));
        router.next_token = usize::MAX;
        let last = router.begin(1, ServiceId::TEST, ms(10));
        assert_eq!(last, CorrelationId(usize::MAX));
        // Wraps past 0 and past the live token 1
        let wrapped = router.begin(1, ServiceId::TEST, ms(10));
        assert_eq!(first, CorrelationId(1));
        assert_eq!(wrapped, CorrelationId(2));
    }

    #[test]
    fn test_expire_by_deadline() {
        let mut router = Router::new();
        let early = router.begin(1, ServiceId::TEST, ms(10));
        let late = router.begin(2, ServiceId::TEST, ms(50));
        assert_eq!(router.next_deadline(), Some(ms(10)));

        assert!(router.expire(ms(5)).is_empty());
        let expired = router.expire(ms(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, early);
        assert_eq!(expired[0].1.requester, 1);

        assert_eq!(router.next_deadline(), Some(ms(50)));
        assert!(router.complete(late).is_some());
        assert_eq!(router.next_deadline(), None);
    }

    #[test]
    fn test_drop_requester() {
        let mut router = Router::new();
        router.begin(1, ServiceId::TEST, ms(10));
        router.begin(1, ServiceId::FILESYSTEM, ms(10));
        let kept = router.begin(2, ServiceId::TEST, ms(10));
        assert_eq!(router.drop_requester(1), 2);
        assert_eq!(router.complete(kept).map(|p| p.requester), Some(2));
    }
}
