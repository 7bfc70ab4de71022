use bytes::Bytes;

use crate::error::Result;
use crate::log::BlockLog;
use crate::tree::batch::Batch;
use crate::tree::node::{BlockSource, NodeRc, SearchResult};
use crate::tree::{KeyValue, Tree};
use crate::wire::NodeBlock;

/// Key bounds and paging for a range scan. Bounds compare against the raw
/// (post-encoding) key bytes; `gt`/`lt` win over `gte`/`lte` when both are
/// set.
#[derive(Debug, Clone, Default)]
pub struct RangeOptions {
    gt: Option<Bytes>,
    gte: Option<Bytes>,
    lt: Option<Bytes>,
    lte: Option<Bytes>,
    reverse: bool,
    limit: Option<usize>,
}

impl RangeOptions {
    pub fn gt(mut self, key: impl Into<Bytes>) -> RangeOptions {
        self.gt = Some(key.into());
        self
    }

    pub fn gte(mut self, key: impl Into<Bytes>) -> RangeOptions {
        self.gte = Some(key.into());
        self
    }

    pub fn lt(mut self, key: impl Into<Bytes>) -> RangeOptions {
        self.lt = Some(key.into());
        self
    }

    pub fn lte(mut self, key: impl Into<Bytes>) -> RangeOptions {
        self.lte = Some(key.into());
        self
    }

    pub fn reverse(mut self, reverse: bool) -> RangeOptions {
        self.reverse = reverse;
        self
    }

    pub fn limit(mut self, limit: usize) -> RangeOptions {
        self.limit = Some(limit);
        self
    }

    fn lower(&self) -> Option<(&[u8], bool)> {
        if let Some(bound) = &self.gt {
            return Some((bound, false));
        }
        self.gte.as_deref().map(|bound| (bound, true))
    }

    fn upper(&self) -> Option<(&[u8], bool)> {
        if let Some(bound) = &self.lt {
            return Some((bound, false));
        }
        self.lte.as_deref().map(|bound| (bound, true))
    }
}

enum Entry {
    Child(NodeRc, usize),
    Key(NodeRc, usize),
}

enum Candidate {
    Child(usize),
    Key(usize),
}

/// Iterator over a key range in sorted (or reverse-sorted) order.
///
/// The scan is bound to the root it resolved on creation, so it observes a
/// consistent snapshot no matter what is appended while it runs.
pub struct RangeIter<'a, L: BlockLog> {
    batch: Batch<'a, L>,
    options: RangeOptions,
    stack: Vec<Entry>,
    remaining: Option<usize>,
    done: bool,
}

impl<'a, L: BlockLog> RangeIter<'a, L> {
    pub(crate) fn new(tree: &'a Tree<L>, options: RangeOptions) -> Result<RangeIter<'a, L>> {
        let mut batch = Batch::new(tree, true);
        let root = batch.get_root()?;
        let mut iter = RangeIter {
            batch,
            remaining: options.limit,
            options,
            stack: Vec::new(),
            done: false,
        };
        if let Some(root) = root {
            iter.push_node(&root)?;
        }
        Ok(iter)
    }

    fn push_node(&mut self, node: &NodeRc) -> Result<()> {
        let mut entries = self.find_range(node)?;
        // Traversal order in, pop order out.
        entries.reverse();
        self.stack.extend(entries);
        Ok(())
    }

    /// All keys and child subtrees of `node` that can intersect the range,
    /// in traversal order.
    fn find_range(&self, node: &NodeRc) -> Result<Vec<Entry>> {
        let mut n = node.borrow_mut();
        let is_leaf = n.is_leaf();
        let mut entries = Vec::with_capacity(2 * n.keys.len() + 1);

        if self.options.reverse {
            // Walk from the upper bound towards the lower one.
            let mut candidate = match self.options.upper() {
                None => {
                    if is_leaf {
                        n.keys.len().checked_sub(1).map(Candidate::Key)
                    } else {
                        Some(Candidate::Child(n.children.len() - 1))
                    }
                }
                Some((bound, inclusive)) => match n.binary_search(bound, &self.batch)? {
                    SearchResult::Found(i) => {
                        if inclusive {
                            Some(Candidate::Key(i))
                        } else if is_leaf {
                            i.checked_sub(1).map(Candidate::Key)
                        } else {
                            Some(Candidate::Child(i))
                        }
                    }
                    SearchResult::NotFound(i) => {
                        if is_leaf {
                            i.checked_sub(1).map(Candidate::Key)
                        } else {
                            Some(Candidate::Child(i))
                        }
                    }
                },
            };
            while let Some(current) = candidate {
                match current {
                    Candidate::Child(idx) => {
                        entries.push(Entry::Child(node.clone(), idx));
                        candidate = idx.checked_sub(1).map(Candidate::Key);
                    }
                    Candidate::Key(idx) => {
                        if idx >= n.keys.len() {
                            break;
                        }
                        let included = match self.options.lower() {
                            None => true,
                            Some((bound, inclusive)) => {
                                let key = n.get_key(idx, &self.batch)?;
                                if inclusive {
                                    &key[..] >= bound
                                } else {
                                    &key[..] > bound
                                }
                            }
                        };
                        if !included {
                            break;
                        }
                        entries.push(Entry::Key(node.clone(), idx));
                        candidate = if is_leaf {
                            idx.checked_sub(1).map(Candidate::Key)
                        } else {
                            Some(Candidate::Child(idx))
                        };
                    }
                }
            }
        } else {
            let mut candidate = match self.options.lower() {
                None => Some(if is_leaf {
                    Candidate::Key(0)
                } else {
                    Candidate::Child(0)
                }),
                Some((bound, inclusive)) => match n.binary_search(bound, &self.batch)? {
                    SearchResult::Found(i) => {
                        if inclusive {
                            Some(Candidate::Key(i))
                        } else if is_leaf {
                            Some(Candidate::Key(i + 1))
                        } else {
                            Some(Candidate::Child(i + 1))
                        }
                    }
                    SearchResult::NotFound(i) => Some(if is_leaf {
                        Candidate::Key(i)
                    } else {
                        Candidate::Child(i)
                    }),
                },
            };
            while let Some(current) = candidate {
                match current {
                    Candidate::Child(idx) => {
                        if idx >= n.children.len() {
                            break;
                        }
                        entries.push(Entry::Child(node.clone(), idx));
                        candidate = Some(Candidate::Key(idx));
                    }
                    Candidate::Key(idx) => {
                        if idx >= n.keys.len() {
                            break;
                        }
                        let included = match self.options.upper() {
                            None => true,
                            Some((bound, inclusive)) => {
                                let key = n.get_key(idx, &self.batch)?;
                                if inclusive {
                                    &key[..] <= bound
                                } else {
                                    &key[..] < bound
                                }
                            }
                        };
                        if !included {
                            break;
                        }
                        entries.push(Entry::Key(node.clone(), idx));
                        candidate = Some(if is_leaf {
                            Candidate::Key(idx + 1)
                        } else {
                            Candidate::Child(idx + 1)
                        });
                    }
                }
            }
        }
        Ok(entries)
    }
}

impl<'a, L: BlockLog> Iterator for RangeIter<'a, L> {
    type Item = Result<KeyValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.remaining == Some(0) {
            self.done = true;
            return None;
        }
        while let Some(entry) = self.stack.pop() {
            match entry {
                Entry::Child(parent, idx) => {
                    let child = match parent.borrow_mut().get_child_node(idx, &self.batch) {
                        Ok(child) => child,
                        Err(err) => {
                            self.done = true;
                            return Some(Err(err));
                        }
                    };
                    if let Err(err) = self.push_node(&child) {
                        self.done = true;
                        return Some(Err(err));
                    }
                }
                Entry::Key(node, idx) => {
                    let seq = node.borrow().keys[idx].seq;
                    let result = self
                        .batch
                        .block(seq)
                        .and_then(|block| self.batch.tree().final_key_value(&block));
                    match result {
                        Ok(kv) => {
                            if let Some(remaining) = &mut self.remaining {
                                *remaining -= 1;
                            }
                            return Some(Ok(kv));
                        }
                        Err(err) => {
                            self.done = true;
                            return Some(Err(err));
                        }
                    }
                }
            }
        }
        None
    }
}

/// Options for a history scan.
#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    since: u64,
    reverse: bool,
    limit: Option<usize>,
}

impl HistoryOptions {
    /// First seq to include; clamped to the first tree block.
    pub fn since(mut self, seq: u64) -> HistoryOptions {
        self.since = seq;
        self
    }

    pub fn reverse(mut self, reverse: bool) -> HistoryOptions {
        self.reverse = reverse;
        self
    }

    pub fn limit(mut self, limit: usize) -> HistoryOptions {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    Put,
    Del,
}

/// One mutation as recorded in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub kind: HistoryKind,
    pub seq: u64,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

/// Iterator over the mutation blocks below a handle's version.
pub struct HistoryIter<'a, L: BlockLog> {
    tree: &'a Tree<L>,
    front: u64,
    back: u64,
    reverse: bool,
    remaining: Option<usize>,
}

impl<'a, L: BlockLog> HistoryIter<'a, L> {
    pub(crate) fn new(tree: &'a Tree<L>, options: HistoryOptions) -> Result<HistoryIter<'a, L>> {
        tree.ready()?;
        let front = options.since.max(1);
        let back = tree.version().max(front);
        Ok(HistoryIter {
            tree,
            front,
            back,
            reverse: options.reverse,
            remaining: options.limit,
        })
    }

    fn read(&self, seq: u64) -> Result<HistoryEntry> {
        let raw = self.tree.log.borrow().get(seq)?;
        let block = NodeBlock::decode(&raw)?;
        let key = self.tree.decode_key(&block.key)?;
        let (kind, value) = match block.value {
            Some(value) => (HistoryKind::Put, Some(self.tree.decode_value(&value)?)),
            None => (HistoryKind::Del, None),
        };
        Ok(HistoryEntry {
            kind,
            seq,
            key,
            value,
        })
    }
}

impl<'a, L: BlockLog> Iterator for HistoryIter<'a, L> {
    type Item = Result<HistoryEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front >= self.back || self.remaining == Some(0) {
            return None;
        }
        if let Some(remaining) = &mut self.remaining {
            *remaining -= 1;
        }
        let seq = if self.reverse {
            self.back -= 1;
            self.back
        } else {
            let seq = self.front;
            self.front += 1;
            seq
        };
        Some(self.read(seq))
    }
}
