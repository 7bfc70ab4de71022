use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::log::BlockLog;
use crate::tree::node::{
    deflate, index_changes, siblings, BlockEntry, BlockRef, BlockSource, Child, Key, NodeRc,
    PendingEntry, SearchResult, TreeNode,
};
use crate::tree::{KeyValue, Tree};
use crate::wire::NodeBlock;
use crate::MIN_KEYS;

/// A unit of one or more mutations sharing a view of the root.
///
/// Single-shot [`Tree::put`]/[`Tree::del`] run through an auto-flushing
/// batch that appends each block immediately. An explicit [`Tree::batch`]
/// stages its blocks in memory; [`Batch::flush`] compacts them and appends
/// them to the log in one atomic call.
pub struct Batch<'a, L: BlockLog> {
    tree: &'a Tree<L>,
    log: Rc<RefCell<L>>,
    /// Every block this batch has hydrated or staged, by seq.
    blocks: RefCell<HashMap<u64, BlockRef>>,
    /// Snapshot root, migrating as staged mutations land.
    root: Option<NodeRc>,
    /// Log length plus staged count; the seq of the next mutation.
    length: u64,
    /// Log length when the batch resolved its snapshot.
    base: u64,
    opened: bool,
    auto_flush: bool,
    /// Prefetch hint armed by a point lookup, fired on its first log fetch.
    hint: RefCell<Option<(u64, Bytes)>>,
}

impl<'a, L: BlockLog> Batch<'a, L> {
    pub(crate) fn new(tree: &'a Tree<L>, auto_flush: bool) -> Batch<'a, L> {
        Batch {
            log: tree.log.clone(),
            tree,
            blocks: RefCell::new(HashMap::new()),
            root: None,
            length: 0,
            base: 0,
            opened: false,
            auto_flush,
            hint: RefCell::new(None),
        }
    }

    pub(crate) fn tree(&self) -> &'a Tree<L> {
        self.tree
    }

    /// Resolve the snapshot this batch operates on. The first mutation or
    /// lookup pins the log length; a follower refreshes its view first.
    fn ensure_open(&mut self) -> Result<()> {
        if self.opened {
            return Ok(());
        }
        self.tree.ready()?;
        if self.tree.checkout.is_none() && !self.log.borrow().writable() {
            let _ = self.log.borrow_mut().update();
        }
        let length = match self.tree.checkout {
            Some(version) => version,
            None => self.log.borrow().len(),
        };
        self.length = length.max(1);
        self.base = self.length;
        self.opened = true;
        Ok(())
    }

    fn ensure_writable(&mut self) -> Result<()> {
        if self.tree.checkout.is_some() {
            return Err(Error::ReadOnly);
        }
        self.ensure_open()?;
        if !self.log.borrow().writable() {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Root node of the batch's snapshot; `None` for an empty tree.
    pub(crate) fn get_root(&mut self) -> Result<Option<NodeRc>> {
        if let Some(root) = &self.root {
            return Ok(Some(root.clone()));
        }
        self.ensure_open()?;
        if self.length < 2 {
            return Ok(None);
        }
        let head = self.length - 1;
        let block = self.block(head)?;
        let root = block.get_tree_node(0)?;
        self.root = Some(root.clone());
        Ok(Some(root))
    }

    /// Point lookup against the batch's snapshot (staged mutations
    /// included).
    pub fn get(&mut self, key: &[u8]) -> Result<Option<KeyValue>> {
        let key = self.tree.encode_key(key)?;
        self.ensure_open()?;
        if self.tree.extension.is_some() && self.length >= 2 {
            *self.hint.borrow_mut() = Some((self.length - 1, key.clone()));
        }
        let result = self.lookup(&key);
        *self.hint.borrow_mut() = None;
        result
    }

    fn lookup(&mut self, key: &Bytes) -> Result<Option<KeyValue>> {
        let mut node = match self.get_root()? {
            Some(node) => node,
            None => return Ok(None),
        };
        loop {
            let result = node.borrow_mut().binary_search(key, self)?;
            match result {
                SearchResult::Found(i) => {
                    let seq = node.borrow().keys[i].seq;
                    let block = self.block(seq)?;
                    return Ok(Some(self.tree.final_key_value(&block)?));
                }
                SearchResult::NotFound(i) => {
                    if node.borrow().is_leaf() {
                        return Ok(None);
                    }
                    let child = node.borrow_mut().get_child_node(i, self)?;
                    node = child;
                }
            }
        }
    }

    /// Insert or replace `key`. Emits exactly one block.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let key = self.tree.encode_key(key)?;
        let value = self.tree.encode_value(value)?;
        let seq = self.length;
        let target = Key::new(seq, Some(key.clone()));

        let root = match self.get_root()? {
            Some(node) => node,
            None => TreeNode::new_rc(),
        };

        // Descend to a leaf. Every node on the way down is part of the new
        // spine and will be re-emitted, even when the insert turns out to be
        // an in-place replace further down.
        let mut stack: Vec<NodeRc> = Vec::new();
        let mut node = root.clone();
        loop {
            stack.push(node.clone());
            node.borrow_mut().changed = true;

            let result = node.borrow_mut().binary_search(&key, self)?;
            match result {
                SearchResult::Found(i) => {
                    // Exact hit: swap the reference, the shape is untouched.
                    node.borrow_mut().keys[i] = target;
                    return self.append_root(root, seq, key, Some(value));
                }
                SearchResult::NotFound(i) => {
                    if node.borrow().is_leaf() {
                        break;
                    }
                    let child = node.borrow_mut().get_child_node(i, self)?;
                    node = child;
                }
            }
        }

        // Insert at the leaf and split up the spine while nodes overflow.
        let mut current = match stack.pop() {
            Some(node) => node,
            None => return Err(Error::Invariant("insert descent left an empty stack")),
        };
        let mut fits = current.borrow_mut().insert_key(target, None, self)?;
        while !fits {
            let (median, right) = current.borrow_mut().split(self)?;
            match stack.pop() {
                Some(parent) => {
                    fits = parent.borrow_mut().insert_key(median, Some(right), self)?;
                    current = parent;
                }
                None => {
                    // The root itself split: the tree grows by one level.
                    let new_root = TreeNode::new_rc();
                    {
                        let mut r = new_root.borrow_mut();
                        r.keys.push(median);
                        r.children.push(Child::pending(current.clone()));
                        r.children.push(Child::pending(right));
                        r.changed = true;
                    }
                    return self.append_root(new_root, seq, key, Some(value));
                }
            }
        }
        self.append_root(root, seq, key, Some(value))
    }

    /// Delete `key` if present. A hit emits one tombstone block; a miss is
    /// a silent no-op that leaves the log untouched.
    pub fn del(&mut self, key: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let key = self.tree.encode_key(key)?;
        let seq = self.length;

        let mut stack: Vec<NodeRc> = Vec::new();
        let mut node = match self.get_root()? {
            Some(node) => node,
            None => return Ok(()),
        };
        loop {
            stack.push(node.clone());
            let result = node.borrow_mut().binary_search(&key, self)?;
            match result {
                SearchResult::Found(i) => {
                    if node.borrow().is_leaf() {
                        node.borrow_mut().remove_key(i);
                    } else {
                        self.set_key_to_nearest_leaf(&node, i, &mut stack)?;
                    }
                    // Only a hit rewrites history.
                    for n in &stack {
                        n.borrow_mut().changed = true;
                    }
                    let root = self.rebalance(&mut stack)?;
                    return self.append_root(root, seq, key, None);
                }
                SearchResult::NotFound(i) => {
                    if node.borrow().is_leaf() {
                        return Ok(());
                    }
                    let child = node.borrow_mut().get_child_node(i, self)?;
                    node = child;
                }
            }
        }
    }

    /// Replace the separator at `node.keys[index]` with its neighbour from
    /// the nearest leaf, taking from the larger of the two candidate leaves
    /// (ties go right), and remove that key from the leaf. The descended
    /// path is pushed onto `stack` so rebalancing can fix the leaf up.
    fn set_key_to_nearest_leaf(
        &self,
        node: &NodeRc,
        index: usize,
        stack: &mut Vec<NodeRc>,
    ) -> Result<()> {
        let left = node.borrow_mut().get_child_node(index, self)?;
        let right = node.borrow_mut().get_child_node(index + 1, self)?;
        let left_size = self.leaf_size(&left, true)?;
        let right_size = self.leaf_size(&right, false)?;

        let (mut leaf, descend_right) = if right_size < left_size {
            (left, true)
        } else {
            (right, false)
        };
        stack.push(leaf.clone());
        loop {
            let next = {
                let n = leaf.borrow();
                if n.is_leaf() {
                    None
                } else if descend_right {
                    Some(n.children.len() - 1)
                } else {
                    Some(0)
                }
            };
            match next {
                None => break,
                Some(i) => {
                    let child = leaf.borrow_mut().get_child_node(i, self)?;
                    stack.push(child.clone());
                    leaf = child;
                }
            }
        }

        let replacement = {
            let mut l = leaf.borrow_mut();
            if l.keys.is_empty() {
                return Err(Error::Invariant("substitution leaf has no keys"));
            }
            if descend_right {
                let last = l.keys.len() - 1;
                l.keys.remove(last)
            } else {
                l.keys.remove(0)
            }
        };
        node.borrow_mut().keys[index] = replacement;
        Ok(())
    }

    /// Size of the leaf at the far right (or left) edge of `node`'s subtree.
    fn leaf_size(&self, node: &NodeRc, go_right: bool) -> Result<usize> {
        let mut current = node.clone();
        loop {
            let next = {
                let n = current.borrow();
                if n.is_leaf() {
                    return Ok(n.keys.len());
                }
                if go_right {
                    n.children.len() - 1
                } else {
                    0
                }
            };
            let child = current.borrow_mut().get_child_node(next, self)?;
            current = child;
        }
    }

    /// Fix up under-full nodes bottom-up after a delete: borrow from a
    /// sibling when one can spare a key, merge otherwise, and shrink the
    /// root when it ends up empty with a single child. Returns the root to
    /// publish.
    fn rebalance(&self, stack: &mut Vec<NodeRc>) -> Result<NodeRc> {
        let root = match stack.first() {
            Some(root) => root.clone(),
            None => return Err(Error::Invariant("delete left an empty stack")),
        };

        while stack.len() > 1 {
            let node = match stack.pop() {
                Some(node) => node,
                None => break,
            };
            if node.borrow().keys.len() >= MIN_KEYS {
                return Ok(root);
            }
            let parent = match stack.last() {
                Some(parent) => parent.clone(),
                None => break,
            };
            let (left, index, right) = siblings(&node, &parent, self)?;

            if let Some(left) = &left {
                if left.borrow().keys.len() > MIN_KEYS {
                    // Rotate right through the parent separator.
                    let mut n = node.borrow_mut();
                    let mut l = left.borrow_mut();
                    let mut p = parent.borrow_mut();
                    n.keys.insert(0, p.keys[index - 1].clone());
                    if let Some(child) = l.children.pop() {
                        n.children.insert(0, child);
                    }
                    p.keys[index - 1] = match l.keys.pop() {
                        Some(key) => key,
                        None => return Err(Error::Invariant("left sibling ran out of keys")),
                    };
                    l.changed = true;
                    return Ok(root);
                }
            }
            if let Some(right) = &right {
                if right.borrow().keys.len() > MIN_KEYS {
                    // Rotate left through the parent separator.
                    let mut n = node.borrow_mut();
                    let mut r = right.borrow_mut();
                    let mut p = parent.borrow_mut();
                    n.keys.push(p.keys[index].clone());
                    if !r.children.is_empty() {
                        n.children.push(r.children.remove(0));
                    }
                    p.keys[index] = r.keys.remove(0);
                    r.changed = true;
                    return Ok(root);
                }
            }

            // Neither sibling can spare a key: merge, preferring the left.
            if let Some(left) = left {
                let median = parent.borrow().keys[index - 1].clone();
                left.borrow_mut().merge(&node, median);
                parent.borrow_mut().remove_key(index - 1);
            } else if let Some(right) = right {
                let median = parent.borrow().keys[index].clone();
                node.borrow_mut().merge(&right, median);
                parent.borrow_mut().remove_key(index);
            } else {
                return Err(Error::ChildNotFound);
            }
            // The parent lost a separator and may underflow in turn.
        }

        let shrink = {
            let r = root.borrow();
            r.keys.is_empty() && r.children.len() == 1
        };
        if shrink {
            let child = root.borrow_mut().get_child_node(0, self)?;
            return Ok(child);
        }
        Ok(root)
    }

    /// Publish `root` as the block at `seq`: serialize the changed spine,
    /// pin the root at offset 0, then either append immediately or stage the
    /// block for [`Batch::flush`].
    fn append_root(&mut self, root: NodeRc, seq: u64, key: Bytes, value: Option<Bytes>) -> Result<()> {
        let mut index: Vec<Option<Child>> = Vec::new();
        index_changes(&root, &mut index, seq);
        index[0] = Some(Child {
            seq,
            offset: 0,
            node: Some(root.clone()),
        });

        if self.auto_flush {
            let block = NodeBlock {
                index: deflate(&index)?.encode(),
                key,
                value,
            };
            self.log.borrow_mut().append(&[block.encode()])?;
            debug!(seq, "appended tree block");
        } else {
            let entry = PendingEntry {
                seq,
                key,
                value,
                index: RefCell::new(index),
                compacted: Cell::new(false),
            };
            self.blocks
                .borrow_mut()
                .insert(seq, BlockRef::Pending(Rc::new(entry)));
        }
        self.root = Some(root);
        self.length += 1;
        Ok(())
    }

    /// Encode all staged blocks and append them in one atomic log call.
    /// Intermediate blocks are compacted first: their superseded roots are
    /// dropped and the surviving nodes renumbered. On failure the staged
    /// state is kept so the flush can be retried.
    pub fn flush(&mut self) -> Result<()> {
        if !self.opened || self.length == self.base {
            return Ok(());
        }
        let staged = (self.length - self.base) as usize;
        let mut batch: Vec<Bytes> = Vec::with_capacity(staged);
        for i in 0..staged {
            let seq = self.base + i as u64;
            let entry = match self.blocks.borrow().get(&seq) {
                Some(BlockRef::Pending(entry)) => entry.clone(),
                _ => return Err(Error::Invariant("staged block missing from the batch cache")),
            };
            if i < staged - 1 {
                compact_pending(&entry, seq);
            }
            let block = NodeBlock {
                index: deflate(&entry.index.borrow())?.encode(),
                key: entry.key.clone(),
                value: entry.value.clone(),
            };
            batch.push(block.encode());
        }
        self.log.borrow_mut().append(&batch)?;
        debug!(blocks = staged, "flushed batch");

        self.root = None;
        self.blocks.borrow_mut().clear();
        self.length = 0;
        self.base = 0;
        self.opened = false;
        Ok(())
    }
}

impl<L: BlockLog> BlockSource for Batch<'_, L> {
    fn block(&self, seq: u64) -> Result<BlockRef> {
        if let Some(block) = self.blocks.borrow().get(&seq) {
            return Ok(block.clone());
        }
        if let Some(extension) = &self.tree.extension {
            if let Some((head, key)) = self.hint.borrow_mut().take() {
                extension.get(head, &key);
            }
        }
        trace!(seq, "fetching block from the log");
        let raw = self.log.borrow().get(seq)?;
        let block = BlockRef::Stored(Rc::new(BlockEntry::new(seq, NodeBlock::decode(&raw)?)));
        self.blocks.borrow_mut().insert(seq, block.clone());
        Ok(block)
    }

    fn key_bytes(&self, seq: u64) -> Result<Bytes> {
        Ok(self.block(seq)?.key_bytes())
    }
}

/// Strip an intermediate staged block down to the nodes that still live in
/// it. The stale root cell at offset 0 goes away, nodes that later
/// mutations re-homed are swap-popped out, and the survivors are renumbered
/// to their compact positions.
fn compact_pending(entry: &PendingEntry, seq: u64) {
    if entry.compacted.replace(true) {
        return;
    }
    let mut index = entry.index.borrow_mut();
    if let Some(first) = index.first_mut() {
        *first = None;
    }
    let mut j = 0;
    while j < index.len() {
        let keep = match &index[j] {
            Some(child) => child
                .node
                .as_ref()
                .and_then(|node| node.borrow().home)
                .map_or(false, |home| home.0 == seq),
            None => false,
        };
        if keep {
            if let Some(child) = &mut index[j] {
                child.offset = j as u64;
                if let Some(node) = &child.node {
                    node.borrow_mut().home = Some((seq, j as u64));
                }
            }
            j += 1;
            continue;
        }
        if j == index.len() - 1 {
            index.pop();
        } else if let Some(last) = index.pop() {
            index[j] = last;
        }
    }
}
