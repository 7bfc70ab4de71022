//! Opportunistic prefetch hook for remote block stores.
//!
//! When a log is replicated, a point lookup that misses the local cache can
//! tell connected peers which key it is resolving so they can push the
//! blocks on the lookup path ahead of the sequential fetches. The tree fires
//! the hint at most once per lookup, on the first block it has to fetch from
//! the log. Peer traffic uses [`crate::ExtensionMessage`].

/// Receiver for prefetch hints.
pub trait Extension {
    /// Called with the seq of the block publishing the lookup's root and the
    /// encoded key being resolved. Purely advisory; implementations must not
    /// block.
    fn get(&self, head_seq: u64, key: &[u8]);
}
