use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("corrupt block: {0}")]
    Corrupt(String),
    #[error("block {seq} out of bounds for log of length {len}")]
    BlockOutOfBounds { seq: u64, len: u64 },
    #[error("node offset {offset} out of bounds for index with {len} levels")]
    OffsetOutOfBounds { offset: u64, len: usize },
    #[error("key index {idx} out of bounds for node with {len} entries")]
    KeyIndexOutOfBounds { idx: usize, len: usize },
    #[error("tree invariant violated: {0}")]
    Invariant(&'static str),
    #[error("log is not writable")]
    ReadOnly,
    #[error("key or value codec failed: {0}")]
    Codec(String),
    #[error("child node not found in parent")]
    ChildNotFound,
}
