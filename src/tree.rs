//! The public tree handle.
//!
//! A [`Tree`] wraps a [`BlockLog`] and exposes the sorted map on top of it.
//! All state lives in the log (plus per-batch caches); handles are cheap and
//! [`Tree::checkout`]/[`Tree::snapshot`] share the same log between them.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bytes::Bytes;
use tracing::debug;

use crate::encoding::Encoding;
use crate::error::{Error, Result};
use crate::extension::Extension;
use crate::log::BlockLog;
use crate::tree::node::BlockRef;
use crate::wire::{Header, Metadata};
use crate::PROTOCOL;

mod batch;
mod iter;
mod node;

pub use batch::Batch;
pub use iter::{
    HistoryEntry, HistoryIter, HistoryKind, HistoryOptions, RangeIter, RangeOptions,
};

/// One resolved entry: the seq of the block that produced it plus the
/// decoded key and value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub seq: u64,
    pub key: Bytes,
    pub value: Bytes,
}

/// Configuration for a tree handle.
///
/// ```rust
/// use beetree::{MemoryLog, Tree, TreeConfig, Utf8};
///
/// let config = TreeConfig::default().key_encoding(Utf8);
/// let tree = Tree::new(MemoryLog::new(), config);
/// # let _ = tree;
/// ```
#[derive(Default)]
pub struct TreeConfig {
    key_encoding: Option<Rc<dyn Encoding>>,
    value_encoding: Option<Rc<dyn Encoding>>,
    extension: Option<Rc<dyn Extension>>,
    content_feed: Option<Bytes>,
    checkout: Option<u64>,
}

impl TreeConfig {
    /// Codec applied to keys at the public boundary.
    pub fn key_encoding(mut self, encoding: impl Encoding + 'static) -> TreeConfig {
        self.key_encoding = Some(Rc::new(encoding));
        self
    }

    /// Codec applied to values at the public boundary.
    pub fn value_encoding(mut self, encoding: impl Encoding + 'static) -> TreeConfig {
        self.value_encoding = Some(Rc::new(encoding));
        self
    }

    /// Receiver for opportunistic prefetch hints.
    pub fn extension(mut self, extension: impl Extension + 'static) -> TreeConfig {
        self.extension = Some(Rc::new(extension));
        self
    }

    /// Content-feed id written into the header block's metadata when this
    /// handle initializes an empty log.
    pub fn content_feed(mut self, feed: impl Into<Bytes>) -> TreeConfig {
        self.content_feed = Some(feed.into());
        self
    }

    /// Open pinned at `version` instead of following the log head.
    pub fn checkout(mut self, version: u64) -> TreeConfig {
        self.checkout = Some(version.max(1));
        self
    }
}

/// Sorted key/value view over an append-only block log.
pub struct Tree<L: BlockLog> {
    pub(crate) log: Rc<RefCell<L>>,
    pub(crate) checkout: Option<u64>,
    pub(crate) extension: Option<Rc<dyn Extension>>,
    key_encoding: Option<Rc<dyn Encoding>>,
    value_encoding: Option<Rc<dyn Encoding>>,
    content_feed: Option<Bytes>,
    opened: Cell<bool>,
}

impl<L: BlockLog> Tree<L> {
    pub fn new(log: L, config: TreeConfig) -> Tree<L> {
        Tree {
            log: Rc::new(RefCell::new(log)),
            checkout: config.checkout,
            extension: config.extension,
            key_encoding: config.key_encoding,
            value_encoding: config.value_encoding,
            content_feed: config.content_feed,
            opened: Cell::new(false),
        }
    }

    /// Open the log; a writable empty log gets the header block appended.
    /// Idempotent, and every operation calls it implicitly.
    pub fn ready(&self) -> Result<()> {
        if self.opened.get() {
            return Ok(());
        }
        let mut log = self.log.borrow_mut();
        log.ready()?;
        if log.len() == 0 {
            if log.writable() {
                let header = Header {
                    protocol: PROTOCOL.to_owned(),
                    metadata: self.content_feed.clone().map(|content_feed| Metadata {
                        content_feed: Some(content_feed),
                    }),
                };
                log.append(&[header.encode()])?;
                debug!("wrote header block");
            }
        } else {
            let header = Header::decode(&log.get(0)?)?;
            if header.protocol != PROTOCOL {
                return Err(Error::Corrupt(format!(
                    "unexpected protocol in header block: {:?}",
                    header.protocol
                )));
            }
        }
        self.opened.set(true);
        Ok(())
    }

    /// Current version: the checked-out version, or the log length. Always
    /// at least 1.
    pub fn version(&self) -> u64 {
        self.checkout
            .unwrap_or_else(|| self.log.borrow().len())
            .max(1)
    }

    /// Best-effort refresh of the log view. Returns whether new blocks
    /// became visible.
    pub fn update(&self) -> Result<bool> {
        self.log.borrow_mut().update()
    }

    /// Look up `key`; `None` when it is not in the tree.
    pub fn get(&self, key: &[u8]) -> Result<Option<KeyValue>> {
        Batch::new(self, true).get(key)
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert or replace `key`, appending one block.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        Batch::new(self, true).put(key, value)
    }

    /// Delete `key`, appending one tombstone block; deleting an absent key
    /// appends nothing.
    pub fn del(&mut self, key: &[u8]) -> Result<()> {
        Batch::new(self, true).del(key)
    }

    /// Start an explicit batch. Mutations are staged in memory and become
    /// visible to other handles only when [`Batch::flush`] appends them in
    /// one atomic call.
    pub fn batch(&self) -> Batch<'_, L> {
        Batch::new(self, false)
    }

    /// A read-only handle pinned at `version`, sharing this handle's log,
    /// codecs and extension.
    pub fn checkout(&self, version: u64) -> Tree<L> {
        Tree {
            log: self.log.clone(),
            checkout: Some(version.max(1)),
            extension: self.extension.clone(),
            key_encoding: self.key_encoding.clone(),
            value_encoding: self.value_encoding.clone(),
            content_feed: self.content_feed.clone(),
            opened: Cell::new(self.opened.get()),
        }
    }

    /// A checkout of the current version.
    pub fn snapshot(&self) -> Tree<L> {
        self.checkout(self.version())
    }

    /// Whether the tree holds no entries at its version.
    pub fn is_empty(&self) -> Result<bool> {
        let mut batch = Batch::new(self, true);
        match batch.get_root()? {
            Some(root) => Ok(root.borrow().keys.is_empty()),
            None => Ok(true),
        }
    }

    /// Decode the header block, if the log has one.
    pub fn header(&self) -> Result<Option<Header>> {
        self.ready()?;
        if self.log.borrow().len() == 0 {
            return Ok(None);
        }
        let raw = self.log.borrow().get(0)?;
        Ok(Some(Header::decode(&raw)?))
    }

    /// Ordered scan over the keys selected by `options`.
    pub fn range(&self, options: RangeOptions) -> Result<RangeIter<'_, L>> {
        RangeIter::new(self, options)
    }

    /// Scan of the raw mutation history below this handle's version.
    pub fn history(&self, options: HistoryOptions) -> Result<HistoryIter<'_, L>> {
        HistoryIter::new(self, options)
    }

    pub(crate) fn encode_key(&self, key: &[u8]) -> Result<Bytes> {
        match &self.key_encoding {
            Some(encoding) => encoding.encode(key),
            None => Ok(Bytes::copy_from_slice(key)),
        }
    }

    pub(crate) fn decode_key(&self, key: &[u8]) -> Result<Bytes> {
        match &self.key_encoding {
            Some(encoding) => encoding.decode(key),
            None => Ok(Bytes::copy_from_slice(key)),
        }
    }

    pub(crate) fn encode_value(&self, value: &[u8]) -> Result<Bytes> {
        match &self.value_encoding {
            Some(encoding) => encoding.encode(value),
            None => Ok(Bytes::copy_from_slice(value)),
        }
    }

    pub(crate) fn decode_value(&self, value: &[u8]) -> Result<Bytes> {
        match &self.value_encoding {
            Some(encoding) => encoding.decode(value),
            None => Ok(Bytes::copy_from_slice(value)),
        }
    }

    /// Decode a block's own key/value pair into the public form.
    pub(crate) fn final_key_value(&self, block: &BlockRef) -> Result<KeyValue> {
        let value = block
            .value()
            .ok_or(Error::Invariant("index references a deletion block"))?;
        Ok(KeyValue {
            seq: block.seq(),
            key: self.decode_key(&block.key_bytes())?,
            value: self.decode_value(&value)?,
        })
    }
}
