use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::rc::Rc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::wire::{Level, NodeBlock, YoloIndex};
use crate::MAX_CHILDREN;

pub(crate) type NodeRc = Rc<RefCell<TreeNode>>;

/// Resolves blocks for lazy key and child dereferencing. Implemented by the
/// batch, which caches every block it has hydrated.
pub(crate) trait BlockSource {
    fn block(&self, seq: u64) -> Result<BlockRef>;

    /// Raw key bytes carried by the block at `seq`.
    fn key_bytes(&self, seq: u64) -> Result<Bytes>;
}

pub(crate) enum SearchResult {
    Found(usize),
    NotFound(usize),
}

/// Reference to the block whose own `key` field holds this key's bytes.
/// The bytes themselves are loaded lazily and cached write-once.
#[derive(Debug, Clone)]
pub(crate) struct Key {
    pub seq: u64,
    pub value: Option<Bytes>,
}

impl Key {
    pub fn new(seq: u64, value: Option<Bytes>) -> Key {
        Key { seq, value }
    }
}

/// Reference to a tree node: the block hosting it plus the node's offset in
/// that block's index levels. `node` caches the hydrated form.
#[derive(Clone)]
pub(crate) struct Child {
    pub seq: u64,
    pub offset: u64,
    pub node: Option<NodeRc>,
}

impl Child {
    pub fn stored(seq: u64, offset: u64) -> Child {
        Child {
            seq,
            offset,
            node: None,
        }
    }

    /// A freshly created, not-yet-homed child. `seq == 0` is strictly an
    /// in-memory marker; it must never survive into an encoded index.
    pub fn pending(node: NodeRc) -> Child {
        Child {
            seq: 0,
            offset: 0,
            node: Some(node),
        }
    }

    /// Current address of the referenced node. A hydrated node knows its own
    /// home, which flush-time compaction may have moved; the plain
    /// `(seq, offset)` pair is only authoritative while nothing is cached.
    pub fn address(&self) -> (u64, u64) {
        if let Some(node) = &self.node {
            if let Some(home) = node.borrow().home {
                return home;
            }
        }
        (self.seq, self.offset)
    }
}

/// An in-memory B-tree node resolved from a block (or created by a batch).
/// Leaves have no children; internal nodes hold `keys.len() + 1` children.
pub(crate) struct TreeNode {
    /// `(seq, offset)` this node is addressable at, once it has a home.
    pub home: Option<(u64, u64)>,
    pub keys: Vec<Key>,
    pub children: Vec<Child>,
    pub changed: bool,
}

impl TreeNode {
    pub fn new_rc() -> NodeRc {
        Rc::new(RefCell::new(TreeNode {
            home: None,
            keys: Vec::new(),
            children: Vec::new(),
            changed: false,
        }))
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Standard midpoint binary search over the keys, loading key bytes on
    /// demand. Returns the match or the insertion index.
    pub fn binary_search(&mut self, key: &[u8], src: &dyn BlockSource) -> Result<SearchResult> {
        let mut size = self.keys.len();
        let mut left = 0;
        let mut right = size;
        while left < right {
            let mid = left + size / 2;
            let mid_key = self.get_key(mid, src)?;
            match key.cmp(&mid_key) {
                Ordering::Greater => left = mid + 1,
                Ordering::Less => right = mid,
                Ordering::Equal => return Ok(SearchResult::Found(mid)),
            }
            size = right - left;
        }
        Ok(SearchResult::NotFound(left))
    }

    /// Insert a key reference into this node only. An equal key is replaced
    /// in place. When `child` is given it becomes the subtree to the right
    /// of the new key. Returns `true` while the node is still within bounds;
    /// `false` means the caller has to split.
    pub fn insert_key(
        &mut self,
        key: Key,
        child: Option<NodeRc>,
        src: &dyn BlockSource,
    ) -> Result<bool> {
        let bytes = match &key.value {
            Some(bytes) => bytes.clone(),
            None => src.key_bytes(key.seq)?,
        };
        self.changed = true;
        match self.binary_search(&bytes, src)? {
            SearchResult::Found(i) => {
                // Same key, same shape: only the reference moves.
                self.keys[i] = key;
                Ok(true)
            }
            SearchResult::NotFound(i) => {
                self.keys.insert(i, key);
                if let Some(child) = child {
                    self.children.insert(i + 1, Child::pending(child));
                }
                Ok(self.keys.len() < MAX_CHILDREN)
            }
        }
    }

    /// Remove `keys[index]`, and for internal nodes the child pointer to the
    /// right of it.
    pub fn remove_key(&mut self, index: usize) {
        self.keys.remove(index);
        if !self.children.is_empty() {
            self.children.remove(index + 1);
        }
        self.changed = true;
    }

    /// Split a full node in half, returning the median key and the new right
    /// sibling. The median's bytes are loaded eagerly because its home block
    /// may not become reachable from the new parent.
    pub fn split(&mut self, src: &dyn BlockSource) -> Result<(Key, NodeRc)> {
        let len = self.keys.len() >> 1;

        let right = TreeNode::new_rc();
        {
            let mut r = right.borrow_mut();
            r.keys = self.keys.split_off(self.keys.len() - len);
            if !self.children.is_empty() {
                r.children = self.children.split_off(self.children.len() - (len + 1));
            }
            r.changed = true;
        }

        self.get_key(self.keys.len() - 1, src)?;
        let median = match self.keys.pop() {
            Some(median) => median,
            None => return Err(Error::Invariant("split of a node without keys")),
        };
        self.changed = true;
        Ok((median, right))
    }

    /// Fold `sibling` into this node with `median` as the separator. Used on
    /// underflow when neither sibling can spare a key.
    pub fn merge(&mut self, sibling: &NodeRc, median: Key) {
        let mut other = sibling.borrow_mut();
        self.keys.push(median);
        self.keys.append(&mut other.keys);
        self.children.append(&mut other.children);
        self.changed = true;
    }

    /// Key bytes at `index`, fetched through `src` and cached on first use.
    pub fn get_key(&mut self, index: usize, src: &dyn BlockSource) -> Result<Bytes> {
        let len = self.keys.len();
        let key = self
            .keys
            .get_mut(index)
            .ok_or(Error::KeyIndexOutOfBounds { idx: index, len })?;
        if let Some(bytes) = &key.value {
            return Ok(bytes.clone());
        }
        let bytes = src.key_bytes(key.seq)?;
        key.value = Some(bytes.clone());
        Ok(bytes)
    }

    /// Hydrate the child node at `index`, caching it in the reference.
    pub fn get_child_node(&mut self, index: usize, src: &dyn BlockSource) -> Result<NodeRc> {
        let len = self.children.len();
        let child = self
            .children
            .get_mut(index)
            .ok_or(Error::KeyIndexOutOfBounds { idx: index, len })?;
        if let Some(node) = &child.node {
            return Ok(node.clone());
        }
        let block = src.block(child.seq)?;
        let node = block.get_tree_node(child.offset)?;
        child.node = Some(node.clone());
        Ok(node)
    }
}

/// Find `node`'s position in `parent` plus its hydrated siblings. A missing
/// entry means the tree structure itself is broken.
pub(crate) fn siblings(
    node: &NodeRc,
    parent: &NodeRc,
    src: &dyn BlockSource,
) -> Result<(Option<NodeRc>, usize, Option<NodeRc>)> {
    let index = {
        let p = parent.borrow();
        p.children
            .iter()
            .position(|c| c.node.as_ref().map_or(false, |n| Rc::ptr_eq(n, node)))
    };
    let index = index.ok_or(Error::ChildNotFound)?;

    let left = if index > 0 {
        Some(parent.borrow_mut().get_child_node(index - 1, src)?)
    } else {
        None
    };
    let right = if index + 1 < parent.borrow().children.len() {
        Some(parent.borrow_mut().get_child_node(index + 1, src)?)
    } else {
        None
    };
    Ok((left, index, right))
}

/// Serialize the changed spine below `node` into `index`, depth-first.
/// Every changed node gets a fresh `(seq, offset)` home in the block being
/// built; unchanged children keep their original addresses.
pub(crate) fn index_changes(node: &NodeRc, index: &mut Vec<Option<Child>>, seq: u64) -> u64 {
    let offset = index.len() as u64;
    index.push(None);

    let mut n = node.borrow_mut();
    n.changed = false;
    n.home = Some((seq, offset));
    for child in n.children.iter_mut() {
        let child_node = match &child.node {
            Some(child_node) => child_node.clone(),
            None => continue,
        };
        if !child_node.borrow().changed {
            continue;
        }
        child.seq = seq;
        child.offset = index_changes(&child_node, index, seq);
        index[child.offset as usize] = Some(child.clone());
    }
    offset
}

/// Turn a pending index into its wire form.
pub(crate) fn deflate(index: &[Option<Child>]) -> Result<YoloIndex> {
    let mut levels = Vec::with_capacity(index.len());
    for slot in index {
        let child = slot
            .as_ref()
            .ok_or(Error::Invariant("pending index has an unfilled slot"))?;
        let node = child
            .node
            .as_ref()
            .ok_or(Error::Invariant("pending index slot lost its node"))?;
        let node = node.borrow();

        let keys = node.keys.iter().map(|k| k.seq).collect();
        let mut children = Vec::with_capacity(node.children.len() * 2);
        for child in &node.children {
            let (seq, offset) = child.address();
            debug_assert!(seq != 0, "freed child leaked into an encoded index");
            children.push(seq);
            children.push(offset);
        }
        levels.push(Level { keys, children });
    }
    Ok(YoloIndex { levels })
}

/// Inflated form of a block's index: per level, the key references and
/// child references it serializes. Initialized once, then read-only.
pub(crate) struct Pointers {
    levels: Vec<(Vec<Key>, Vec<Child>)>,
}

impl Pointers {
    fn inflate(buf: &[u8]) -> Result<Pointers> {
        let index = YoloIndex::decode(buf)?;
        let levels = index
            .levels
            .into_iter()
            .map(|level| {
                let keys = level.keys.into_iter().map(|seq| Key::new(seq, None)).collect();
                let children = level
                    .children
                    .chunks_exact(2)
                    .map(|pair| Child::stored(pair[0], pair[1]))
                    .collect();
                (keys, children)
            })
            .collect();
        Ok(Pointers { levels })
    }
}

/// A hydrated log entry: raw key/value plus the lazily inflated index.
pub(crate) struct BlockEntry {
    pub seq: u64,
    pub key: Bytes,
    pub value: Option<Bytes>,
    index_bytes: Bytes,
    index: RefCell<Option<Pointers>>,
}

impl BlockEntry {
    pub fn new(seq: u64, block: NodeBlock) -> BlockEntry {
        BlockEntry {
            seq,
            key: block.key,
            value: block.value,
            index_bytes: block.index,
            index: RefCell::new(None),
        }
    }

    /// Materialize a fresh view of the node stored at `offset`.
    pub fn get_tree_node(&self, offset: u64) -> Result<NodeRc> {
        let mut slot = self.index.borrow_mut();
        if slot.is_none() {
            *slot = Some(Pointers::inflate(&self.index_bytes)?);
        }
        let pointers = slot.as_ref().expect("index inflated above");
        let (keys, children) = pointers
            .levels
            .get(offset as usize)
            .cloned()
            .ok_or(Error::OffsetOutOfBounds {
                offset,
                len: pointers.levels.len(),
            })?;
        Ok(Rc::new(RefCell::new(TreeNode {
            home: Some((self.seq, offset)),
            keys,
            children,
            changed: false,
        })))
    }
}

/// A staged, not-yet-appended block. Its index is the live list of child
/// cells produced by `index_changes`, so node lookups read straight from it.
pub(crate) struct PendingEntry {
    pub seq: u64,
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub index: RefCell<Vec<Option<Child>>>,
    /// Flush-time compaction must run at most once, even when a failed
    /// append makes the flush retry.
    pub compacted: Cell<bool>,
}

impl PendingEntry {
    pub fn get_tree_node(&self, offset: u64) -> Result<NodeRc> {
        let index = self.index.borrow();
        let node = index
            .get(offset as usize)
            .and_then(|slot| slot.as_ref())
            .and_then(|child| child.node.clone());
        node.ok_or(Error::OffsetOutOfBounds {
            offset,
            len: index.len(),
        })
    }
}

/// Either kind of cached block a batch can hand out.
#[derive(Clone)]
pub(crate) enum BlockRef {
    Stored(Rc<BlockEntry>),
    Pending(Rc<PendingEntry>),
}

impl BlockRef {
    pub fn seq(&self) -> u64 {
        match self {
            BlockRef::Stored(entry) => entry.seq,
            BlockRef::Pending(entry) => entry.seq,
        }
    }

    pub fn key_bytes(&self) -> Bytes {
        match self {
            BlockRef::Stored(entry) => entry.key.clone(),
            BlockRef::Pending(entry) => entry.key.clone(),
        }
    }

    pub fn value(&self) -> Option<Bytes> {
        match self {
            BlockRef::Stored(entry) => entry.value.clone(),
            BlockRef::Pending(entry) => entry.value.clone(),
        }
    }

    pub fn get_tree_node(&self, offset: u64) -> Result<NodeRc> {
        match self {
            BlockRef::Stored(entry) => entry.get_tree_node(offset),
            BlockRef::Pending(entry) => entry.get_tree_node(offset),
        }
    }
}
