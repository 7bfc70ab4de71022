//! # Append-only B-tree over an append-only log
//!
//! `beetree` turns an append-only, sequence-numbered block log into a sorted
//! key/value store with point lookups, range scans and time-travel queries.
//! Every mutation appends exactly one block containing a compact re-indexing
//! of the B-tree nodes it touched; unchanged subtrees keep their original
//! `(seq, offset)` addresses in earlier blocks. Because history is never
//! rewritten, any previous version of the map stays addressable through
//! [`Tree::checkout`].
//!
//! This is helpful if you
//!
//! - need a sorted index on top of a single-writer log you cannot mutate in
//!   place (replicated feeds, write-ahead logs, content-addressed storage),
//! - want cheap snapshots and historical reads without copying data, and
//! - want range scans over raw byte keys while the log keeps growing.
//!
//! Because of its storage model, it is therefore **not possible to**
//!
//! - compact or garbage-collect superseded blocks (the log is append-only by
//!   design), or
//! - write from more than one handle at a time (the log is single-writer).
//!
//! # Example
//!
//! ```rust
//! use beetree::{Error, MemoryLog, Tree, TreeConfig};
//!
//! fn main() -> std::result::Result<(), Error> {
//!     let mut tree = Tree::new(MemoryLog::new(), TreeConfig::default());
//!     tree.put(b"b", b"2")?;
//!     tree.put(b"a", b"1")?;
//!
//!     let hit = tree.get(b"a")?;
//!     assert_eq!(b"1", &hit.unwrap().value[..]);
//!
//!     tree.del(b"a")?;
//!     assert!(tree.get(b"a")?.is_none());
//!
//!     for entry in tree.range(Default::default())? {
//!         let kv = entry?;
//!         dbg!(kv.seq, kv.key, kv.value);
//!     }
//!     Ok(())
//! }
//! ```
mod encoding;
mod error;
mod extension;
mod log;
mod tree;
mod wire;

pub use encoding::{Encoding, Raw, Utf8};
pub use error::{Error, Result};
pub use extension::Extension;
pub use log::{BlockLog, MemoryLog};
pub use tree::{
    Batch, HistoryEntry, HistoryIter, HistoryKind, HistoryOptions, KeyValue, RangeIter,
    RangeOptions, Tree, TreeConfig,
};
pub use wire::{CacheHint, ExtensionMessage, GetHint, Header, Level, Metadata, NodeBlock, YoloIndex};

/// Protocol string stored in the header block at seq 0.
pub const PROTOCOL: &str = "hyperbee";

/// B-tree branching constant.
pub(crate) const T: usize = 5;
/// Minimum number of keys in a non-root node.
pub(crate) const MIN_KEYS: usize = T - 1;
/// A node holding this many keys (or more) must be split.
pub(crate) const MAX_CHILDREN: usize = 2 * T;
