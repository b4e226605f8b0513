//! ICE candidate buffering
//!
//! Candidates routinely arrive from the signaling relay before the remote
//! session description they belong to. The peer connection rejects candidates
//! applied in that window, so they are buffered here and handed back, in
//! arrival order, once a remote description has been applied. The queue is
//! per-session and dropped with the session; candidates never carry over.

use std::collections::{HashSet, VecDeque};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Counters for observing queue behavior
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateQueueStats {
    /// Candidates handed out for application to the peer connection
    pub admitted: usize,
    /// Candidates dropped because the same path was already seen
    pub duplicates: usize,
}

/// Ordered buffer of remote ICE candidates awaiting a remote description
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    pending: VecDeque<RTCIceCandidateInit>,
    seen: HashSet<String>,
    remote_description_set: bool,
    stats: CandidateQueueStats,
}

impl IceCandidateQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a newly received candidate.
    ///
    /// Returns `Some(candidate)` when the remote description is already
    /// applied and the candidate should go straight to the peer connection.
    /// Returns `None` when the candidate was buffered, or when it duplicates
    /// a candidate seen earlier (duplicates are a no-op, not an error).
    pub fn offer(&mut self, candidate: RTCIceCandidateInit) -> Option<RTCIceCandidateInit> {
        if !self.seen.insert(Self::key(&candidate)) {
            self.stats.duplicates += 1;
            tracing::debug!(candidate = %candidate.candidate, "Duplicate ICE candidate ignored");
            return None;
        }

        if self.remote_description_set {
            self.stats.admitted += 1;
            Some(candidate)
        } else {
            tracing::trace!(
                candidate = %candidate.candidate,
                buffered = self.pending.len() + 1,
                "Buffering ICE candidate until remote description is applied"
            );
            self.pending.push_back(candidate);
            None
        }
    }

    /// Record that a remote description has been applied and drain the buffer.
    ///
    /// Returns the buffered candidates in their original arrival order; the
    /// caller must apply every one of them before producing an answer, so
    /// that no discovered path is silently dropped.
    pub fn mark_remote_description(&mut self) -> Vec<RTCIceCandidateInit> {
        self.remote_description_set = true;
        let drained: Vec<_> = self.pending.drain(..).collect();
        self.stats.admitted += drained.len();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Draining buffered ICE candidates");
        }
        drained
    }

    /// Whether a remote description has been applied
    #[must_use]
    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    /// Number of candidates still buffered
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Snapshot of the queue counters
    #[must_use]
    pub fn stats(&self) -> CandidateQueueStats {
        self.stats
    }

    fn key(candidate: &RTCIceCandidateInit) -> String {
        format!(
            "{}|{}|{:?}",
            candidate.candidate,
            candidate.sdp_mid.as_deref().unwrap_or(""),
            candidate.sdp_mline_index
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn candidate(n: usize) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 50{n:03} typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn test_buffers_before_remote_description() {
        let mut queue = IceCandidateQueue::new();
        assert!(queue.offer(candidate(1)).is_none());
        assert!(queue.offer(candidate(2)).is_none());
        assert_eq!(queue.pending(), 2);
        assert_eq!(queue.stats().admitted, 0);
    }

    #[test]
    fn test_drain_preserves_arrival_order() {
        let mut queue = IceCandidateQueue::new();
        for n in 0..5 {
            assert!(queue.offer(candidate(n)).is_none());
        }

        let drained = queue.mark_remote_description();
        let order: Vec<String> = drained.into_iter().map(|c| c.candidate).collect();
        let expected: Vec<String> = (0..5).map(|n| candidate(n).candidate).collect();
        assert_eq!(order, expected);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_applies_directly_after_remote_description() {
        let mut queue = IceCandidateQueue::new();
        queue.mark_remote_description();

        let out = queue.offer(candidate(7));
        assert_eq!(out.unwrap().candidate, candidate(7).candidate);
        assert_eq!(queue.stats().admitted, 1);
    }

    #[test]
    fn test_duplicate_is_a_noop() {
        let mut queue = IceCandidateQueue::new();
        queue.mark_remote_description();

        assert!(queue.offer(candidate(3)).is_some());
        assert!(queue.offer(candidate(3)).is_none());

        let stats = queue.stats();
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn test_duplicate_detected_across_buffer_and_drain() {
        let mut queue = IceCandidateQueue::new();
        assert!(queue.offer(candidate(1)).is_none());
        let drained = queue.mark_remote_description();
        assert_eq!(drained.len(), 1);

        // Same candidate redelivered after the drain: still a no-op.
        assert!(queue.offer(candidate(1)).is_none());
        assert_eq!(queue.stats().duplicates, 1);
    }

    proptest! {
        /// For any split of candidate arrivals around the remote description,
        /// every candidate is admitted exactly once and in arrival order.
        #[test]
        fn prop_fifo_order_and_at_most_once(total in 0usize..24, split_seed in 0usize..24) {
            let split = if total == 0 { 0 } else { split_seed % (total + 1) };
            let mut queue = IceCandidateQueue::new();
            let mut admitted = Vec::new();

            for n in 0..split {
                prop_assert!(queue.offer(candidate(n)).is_none());
            }
            admitted.extend(queue.mark_remote_description().into_iter().map(|c| c.candidate));
            for n in split..total {
                if let Some(c) = queue.offer(candidate(n)) {
                    admitted.push(c.candidate);
                }
            }

            // Redeliver everything; nothing may be admitted twice.
            for n in 0..total {
                prop_assert!(queue.offer(candidate(n)).is_none());
            }

            let expected: Vec<String> = (0..total).map(|n| candidate(n).candidate).collect();
            prop_assert_eq!(admitted, expected);
            prop_assert_eq!(queue.stats().admitted, total);
            prop_assert_eq!(queue.stats().duplicates, total);
        }
    }
}
