//! Byte codecs applied to user keys and values at the public boundary.
//!
//! Codecs never see the internal index blobs, and the tree always compares
//! keys by their post-encode bytes.

use bytes::Bytes;

use crate::error::{Error, Result};

/// A reversible transformation between user bytes and stored bytes.
pub trait Encoding {
    fn encode(&self, input: &[u8]) -> Result<Bytes>;
    fn decode(&self, stored: &[u8]) -> Result<Bytes>;
}

/// Identity codec: bytes are stored as given.
#[derive(Debug, Clone, Copy, Default)]
pub struct Raw;

impl Encoding for Raw {
    fn encode(&self, input: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(input))
    }

    fn decode(&self, stored: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(stored))
    }
}

/// Identity codec that rejects byte sequences which are not valid UTF-8.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8;

impl Utf8 {
    fn check(&self, bytes: &[u8]) -> Result<Bytes> {
        std::str::from_utf8(bytes).map_err(|err| Error::Codec(err.to_string()))?;
        Ok(Bytes::copy_from_slice(bytes))
    }
}

impl Encoding for Utf8 {
    fn encode(&self, input: &[u8]) -> Result<Bytes> {
        self.check(input)
    }

    fn decode(&self, stored: &[u8]) -> Result<Bytes> {
        self.check(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_is_identity() {
        let codec = Raw;
        assert_eq!(&codec.encode(b"a\xffb").unwrap()[..], b"a\xffb");
        assert_eq!(&codec.decode(b"a\xffb").unwrap()[..], b"a\xffb");
    }

    #[test]
    fn utf8_rejects_invalid_sequences() {
        let codec = Utf8;
        assert_eq!(&codec.encode("käse".as_bytes()).unwrap()[..], "käse".as_bytes());
        assert!(codec.encode(&[0xff, 0xfe]).is_err());
        assert!(codec.decode(&[0xc3]).is_err());
    }
}
