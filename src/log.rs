//! The append-only log contract the tree is built on.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;

use crate::error::{Error, Result};

/// An append-only, sequence-numbered block store with a single writer.
///
/// The tree treats the log as an external collaborator: it appends whole
/// blocks, reads them back by seq, and never mutates existing entries.
/// Implementations may block on I/O in [`BlockLog::get`] and
/// [`BlockLog::append`].
pub trait BlockLog {
    /// Open the log. Idempotent.
    fn ready(&mut self) -> Result<()>;

    /// Number of blocks in the log.
    fn len(&self) -> u64;

    /// Whether this handle may append.
    fn writable(&self) -> bool;

    /// Read the raw block at `seq`.
    fn get(&self, seq: u64) -> Result<Bytes>;

    /// Append one or more blocks as a single atomic operation.
    fn append(&mut self, blocks: &[Bytes]) -> Result<()>;

    /// Best-effort, non-blocking refresh of the log view (for logs that
    /// follow a remote writer). Returns whether new blocks became visible.
    fn update(&mut self) -> Result<bool>;
}

/// Lets several tree handles share one log (checkouts and snapshots do).
impl<L: BlockLog> BlockLog for Rc<RefCell<L>> {
    fn ready(&mut self) -> Result<()> {
        self.borrow_mut().ready()
    }

    fn len(&self) -> u64 {
        self.borrow().len()
    }

    fn writable(&self) -> bool {
        self.borrow().writable()
    }

    fn get(&self, seq: u64) -> Result<Bytes> {
        self.borrow().get(seq)
    }

    fn append(&mut self, blocks: &[Bytes]) -> Result<()> {
        self.borrow_mut().append(blocks)
    }

    fn update(&mut self) -> Result<bool> {
        self.borrow_mut().update()
    }
}

/// In-process log backed by a `Vec`. The stock implementation for tests,
/// examples and ephemeral indexes.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    blocks: Vec<Bytes>,
    writable: bool,
}

impl MemoryLog {
    pub fn new() -> MemoryLog {
        MemoryLog {
            blocks: Vec::new(),
            writable: true,
        }
    }

    /// A log that refuses appends, like a replica of a remote writer.
    pub fn read_only(mut self) -> MemoryLog {
        self.writable = false;
        self
    }
}

impl BlockLog for MemoryLog {
    fn ready(&mut self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> u64 {
        self.blocks.len() as u64
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn get(&self, seq: u64) -> Result<Bytes> {
        match self.blocks.get(seq as usize) {
            Some(block) => Ok(block.clone()),
            None => Err(Error::BlockOutOfBounds {
                seq,
                len: self.len(),
            }),
        }
    }

    fn append(&mut self, blocks: &[Bytes]) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        self.blocks.extend_from_slice(blocks);
        Ok(())
    }

    fn update(&mut self) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_get() {
        let mut log = MemoryLog::new();
        log.ready().unwrap();
        assert_eq!(0, log.len());

        log.append(&[Bytes::from_static(b"a"), Bytes::from_static(b"b")]).unwrap();
        assert_eq!(2, log.len());
        assert_eq!(&log.get(0).unwrap()[..], b"a");
        assert_eq!(&log.get(1).unwrap()[..], b"b");
    }

    #[test]
    fn get_out_of_bounds_fails() {
        let log = MemoryLog::new();
        assert!(matches!(
            log.get(3),
            Err(Error::BlockOutOfBounds { seq: 3, len: 0 })
        ));
    }

    #[test]
    fn read_only_rejects_appends() {
        let mut log = MemoryLog::new().read_only();
        assert!(!log.writable());
        assert!(matches!(
            log.append(&[Bytes::from_static(b"a")]),
            Err(Error::ReadOnly)
        ));
    }

    #[test]
    fn shared_handle_sees_appends() {
        let log = Rc::new(RefCell::new(MemoryLog::new()));
        let mut writer = log.clone();
        writer.append(&[Bytes::from_static(b"a")]).unwrap();
        assert_eq!(1, log.len());
        assert!(!log.clone().update().unwrap());
    }
}
