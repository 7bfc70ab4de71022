//! Wire codecs for everything that ends up inside a log block.
//!
//! All messages use the protobuf wire format: base-128 varints for integers
//! and tags, length-delimited fields for bytes and nested messages, packed
//! varint arrays for the index levels. Encoding is canonical (fields in
//! ascending number order, absent optional fields omitted), so encoding the
//! same logical content twice produces identical bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

const WIRE_VARINT: u8 = 0;
const WIRE_LEN: u8 = 2;

/// Number of bytes `value` occupies as a varint.
pub(crate) fn varint_len(value: u64) -> usize {
    let mut len = 1;
    let mut value = value >> 7;
    while value != 0 {
        len += 1;
        value >>= 7;
    }
    len
}

/// Append `value` as a base-128 varint.
pub(crate) fn write_varint(mut value: u64, buf: &mut BytesMut) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Decode a varint from the front of `buf`, returning `(value, bytes_read)`.
pub(crate) fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i == 10 {
            break;
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(Error::Corrupt("unterminated varint".into()))
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let (value, read) = decode_varint(&buf[*pos..])?;
    *pos += read;
    Ok(value)
}

fn read_slice<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    let len = read_varint(buf, pos)? as usize;
    if buf.len() - *pos < len {
        return Err(Error::Corrupt("length-delimited field past end of block".into()));
    }
    let out = &buf[*pos..*pos + len];
    *pos += len;
    Ok(out)
}

fn put_tag(field: u32, wire: u8, buf: &mut BytesMut) {
    write_varint(u64::from(field << 3 | u32::from(wire)), buf);
}

fn put_len_field(field: u32, data: &[u8], buf: &mut BytesMut) {
    put_tag(field, WIRE_LEN, buf);
    write_varint(data.len() as u64, buf);
    buf.put_slice(data);
}

fn put_u64_field(field: u32, value: u64, buf: &mut BytesMut) {
    put_tag(field, WIRE_VARINT, buf);
    write_varint(value, buf);
}

/// Packed repeated uint64: omitted entirely when empty.
fn put_packed_field(field: u32, values: &[u64], buf: &mut BytesMut) {
    if values.is_empty() {
        return;
    }
    let payload: usize = values.iter().map(|v| varint_len(*v)).sum();
    put_tag(field, WIRE_LEN, buf);
    write_varint(payload as u64, buf);
    for value in values {
        write_varint(*value, buf);
    }
}

fn read_packed(data: &[u8]) -> Result<Vec<u64>> {
    let mut values = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        values.push(read_varint(data, &mut pos)?);
    }
    Ok(values)
}

/// Splits `(field, wire_type)` out of a tag.
fn read_tag(buf: &[u8], pos: &mut usize) -> Result<(u32, u8)> {
    let tag = read_varint(buf, pos)?;
    Ok(((tag >> 3) as u32, (tag & 0x7) as u8))
}

fn unknown_field(message: &str, field: u32) -> Error {
    Error::Corrupt(format!("unknown field {field} in {message} message"))
}

/// Header block stored at seq 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub protocol: String,
    pub metadata: Option<Metadata>,
}

/// Optional metadata carried by the header block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub content_feed: Option<Bytes>,
}

impl Header {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_len_field(1, self.protocol.as_bytes(), &mut buf);
        if let Some(metadata) = &self.metadata {
            put_len_field(2, &metadata.encode(), &mut buf);
        }
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Header> {
        let mut protocol = None;
        let mut metadata = None;
        let mut pos = 0;
        while pos < buf.len() {
            match read_tag(buf, &mut pos)? {
                (1, WIRE_LEN) => {
                    let raw = read_slice(buf, &mut pos)?;
                    let value = std::str::from_utf8(raw)
                        .map_err(|_| Error::Corrupt("header protocol is not utf-8".into()))?;
                    protocol = Some(value.to_owned());
                }
                (2, WIRE_LEN) => {
                    metadata = Some(Metadata::decode(read_slice(buf, &mut pos)?)?);
                }
                (field, _) => return Err(unknown_field("header", field)),
            }
        }
        let protocol =
            protocol.ok_or_else(|| Error::Corrupt("header is missing the protocol field".into()))?;
        Ok(Header { protocol, metadata })
    }
}

impl Metadata {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        if let Some(content_feed) = &self.content_feed {
            put_len_field(1, content_feed, &mut buf);
        }
        buf
    }

    fn decode(buf: &[u8]) -> Result<Metadata> {
        let mut content_feed = None;
        let mut pos = 0;
        while pos < buf.len() {
            match read_tag(buf, &mut pos)? {
                (1, WIRE_LEN) => {
                    content_feed = Some(Bytes::copy_from_slice(read_slice(buf, &mut pos)?));
                }
                (field, _) => return Err(unknown_field("metadata", field)),
            }
        }
        Ok(Metadata { content_feed })
    }
}

/// Payload of every tree block: the embedded index plus the mutation's key
/// and value. An absent value is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeBlock {
    pub index: Bytes,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl NodeBlock {
    pub fn is_deletion(&self) -> bool {
        self.value.is_none()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_len_field(1, &self.index, &mut buf);
        put_len_field(2, &self.key, &mut buf);
        if let Some(value) = &self.value {
            put_len_field(3, value, &mut buf);
        }
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<NodeBlock> {
        let mut index = None;
        let mut key = None;
        let mut value = None;
        let mut pos = 0;
        while pos < buf.len() {
            match read_tag(buf, &mut pos)? {
                (1, WIRE_LEN) => index = Some(Bytes::copy_from_slice(read_slice(buf, &mut pos)?)),
                (2, WIRE_LEN) => key = Some(Bytes::copy_from_slice(read_slice(buf, &mut pos)?)),
                (3, WIRE_LEN) => value = Some(Bytes::copy_from_slice(read_slice(buf, &mut pos)?)),
                (field, _) => return Err(unknown_field("node", field)),
            }
        }
        let index = index.ok_or_else(|| Error::Corrupt("node is missing the index field".into()))?;
        let key = key.ok_or_else(|| Error::Corrupt("node is missing the key field".into()))?;
        Ok(NodeBlock { index, key, value })
    }
}

/// One serialized tree node: key seqs plus flattened `(seq, offset)` child
/// pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Level {
    pub keys: Vec<u64>,
    pub children: Vec<u64>,
}

/// The per-block index: level 0 is the root of the snapshot this block
/// publishes, the remaining levels are the nodes that changed at this seq.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct YoloIndex {
    pub levels: Vec<Level>,
}

impl Level {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        put_packed_field(1, &self.keys, &mut buf);
        put_packed_field(2, &self.children, &mut buf);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Level> {
        let mut keys = Vec::new();
        let mut children = Vec::new();
        let mut pos = 0;
        while pos < buf.len() {
            match read_tag(buf, &mut pos)? {
                (1, WIRE_LEN) => keys = read_packed(read_slice(buf, &mut pos)?)?,
                (2, WIRE_LEN) => children = read_packed(read_slice(buf, &mut pos)?)?,
                (field, _) => return Err(unknown_field("level", field)),
            }
        }
        if children.len() % 2 != 0 {
            return Err(Error::Corrupt("level has a dangling child seq".into()));
        }
        Ok(Level { keys, children })
    }
}

impl YoloIndex {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for level in &self.levels {
            put_len_field(1, &level.encode(), &mut buf);
        }
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<YoloIndex> {
        let mut levels = Vec::new();
        let mut pos = 0;
        while pos < buf.len() {
            match read_tag(buf, &mut pos)? {
                (1, WIRE_LEN) => levels.push(Level::decode(read_slice(buf, &mut pos)?)?),
                (field, _) => return Err(unknown_field("index", field)),
            }
        }
        Ok(YoloIndex { levels })
    }
}

/// Peer gossip: "I hold blocks `start..end` plus `blocks`".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheHint {
    pub start: u64,
    pub end: u64,
    pub blocks: Vec<u64>,
}

/// Peer gossip: "please warm the lookup of `key` below head `head`".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetHint {
    pub head: Option<u64>,
    pub key: Option<Bytes>,
}

/// Envelope for extension traffic between peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionMessage {
    pub cache: Option<CacheHint>,
    pub get: Option<GetHint>,
}

impl CacheHint {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        put_u64_field(1, self.start, &mut buf);
        put_u64_field(2, self.end, &mut buf);
        put_packed_field(3, &self.blocks, &mut buf);
        buf
    }

    fn decode(buf: &[u8]) -> Result<CacheHint> {
        let mut hint = CacheHint::default();
        let mut pos = 0;
        while pos < buf.len() {
            match read_tag(buf, &mut pos)? {
                (1, WIRE_VARINT) => hint.start = read_varint(buf, &mut pos)?,
                (2, WIRE_VARINT) => hint.end = read_varint(buf, &mut pos)?,
                (3, WIRE_LEN) => hint.blocks = read_packed(read_slice(buf, &mut pos)?)?,
                (field, _) => return Err(unknown_field("cache hint", field)),
            }
        }
        Ok(hint)
    }
}

impl GetHint {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        if let Some(head) = self.head {
            put_u64_field(1, head, &mut buf);
        }
        if let Some(key) = &self.key {
            put_len_field(2, key, &mut buf);
        }
        buf
    }

    fn decode(buf: &[u8]) -> Result<GetHint> {
        let mut hint = GetHint::default();
        let mut pos = 0;
        while pos < buf.len() {
            match read_tag(buf, &mut pos)? {
                (1, WIRE_VARINT) => hint.head = Some(read_varint(buf, &mut pos)?),
                (2, WIRE_LEN) => hint.key = Some(Bytes::copy_from_slice(read_slice(buf, &mut pos)?)),
                (field, _) => return Err(unknown_field("get hint", field)),
            }
        }
        Ok(hint)
    }
}

impl ExtensionMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        if let Some(cache) = &self.cache {
            put_len_field(1, &cache.encode(), &mut buf);
        }
        if let Some(get) = &self.get {
            put_len_field(2, &get.encode(), &mut buf);
        }
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<ExtensionMessage> {
        let mut message = ExtensionMessage::default();
        let mut pos = 0;
        while pos < buf.len() {
            match read_tag(buf, &mut pos)? {
                (1, WIRE_LEN) => message.cache = Some(CacheHint::decode(read_slice(buf, &mut pos)?)?),
                (2, WIRE_LEN) => message.get = Some(GetHint::decode(read_slice(buf, &mut pos)?)?),
                (field, _) => return Err(unknown_field("extension", field)),
            }
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_len_boundaries() {
        assert_eq!(1, varint_len(0));
        assert_eq!(1, varint_len(127));
        assert_eq!(2, varint_len(128));
        assert_eq!(2, varint_len(16383));
        assert_eq!(3, varint_len(16384));
        assert_eq!(10, varint_len(u64::MAX));
    }

    #[test]
    fn varint_roundtrip_boundaries() {
        let boundary_values = [
            0u64,
            1,
            127,
            128,
            300,
            16383,
            16384,
            2097151,
            2097152,
            u64::from(u32::MAX),
            u64::MAX,
        ];
        for &value in &boundary_values {
            let mut buf = BytesMut::new();
            write_varint(value, &mut buf);
            assert_eq!(varint_len(value), buf.len(), "length mismatch for {}", value);
            let (decoded, read) = decode_varint(&buf).unwrap();
            assert_eq!(value, decoded);
            assert_eq!(buf.len(), read);
        }
    }

    #[test]
    fn varint_truncated_fails() {
        assert!(decode_varint(&[]).is_err());
        assert!(decode_varint(&[0x80]).is_err());
        assert!(decode_varint(&[0xff, 0xff]).is_err());
    }

    #[test]
    fn header_roundtrip() {
        let plain = Header {
            protocol: "hyperbee".into(),
            metadata: None,
        };
        assert_eq!(plain, Header::decode(&plain.encode()).unwrap());

        let with_metadata = Header {
            protocol: "hyperbee".into(),
            metadata: Some(Metadata {
                content_feed: Some(Bytes::from_static(&[7u8; 32])),
            }),
        };
        assert_eq!(with_metadata, Header::decode(&with_metadata.encode()).unwrap());

        // Empty metadata is preserved as present-but-empty.
        let empty_metadata = Header {
            protocol: "hyperbee".into(),
            metadata: Some(Metadata::default()),
        };
        assert_eq!(empty_metadata, Header::decode(&empty_metadata.encode()).unwrap());
    }

    #[test]
    fn header_missing_protocol_fails() {
        assert!(Header::decode(&[]).is_err());
    }

    #[test]
    fn node_roundtrip() {
        let put = NodeBlock {
            index: Bytes::from_static(&[1, 2, 3]),
            key: Bytes::from_static(b"key"),
            value: Some(Bytes::from_static(b"value")),
        };
        let decoded = NodeBlock::decode(&put.encode()).unwrap();
        assert_eq!(put, decoded);
        assert!(!decoded.is_deletion());

        let tombstone = NodeBlock {
            index: Bytes::from_static(&[1]),
            key: Bytes::from_static(b"key"),
            value: None,
        };
        let decoded = NodeBlock::decode(&tombstone.encode()).unwrap();
        assert_eq!(tombstone, decoded);
        assert!(decoded.is_deletion());

        // An empty value is still a put, not a tombstone.
        let empty_value = NodeBlock {
            index: Bytes::new(),
            key: Bytes::from_static(b"key"),
            value: Some(Bytes::new()),
        };
        let decoded = NodeBlock::decode(&empty_value.encode()).unwrap();
        assert_eq!(empty_value, decoded);
        assert!(!decoded.is_deletion());
    }

    #[test]
    fn yolo_index_roundtrip() {
        let index = YoloIndex {
            levels: vec![
                Level {
                    keys: vec![4, 9, 300],
                    children: vec![1, 0, 2, 1],
                },
                Level {
                    keys: vec![5],
                    children: vec![],
                },
                // A published empty root has no keys and no children.
                Level::default(),
            ],
        };
        assert_eq!(index, YoloIndex::decode(&index.encode()).unwrap());
    }

    #[test]
    fn yolo_index_encoding_is_canonical() {
        let index = YoloIndex {
            levels: vec![Level {
                keys: vec![1, 2, 3],
                children: vec![1, 0, 1, 1, 2, 0, 2, 1],
            }],
        };
        assert_eq!(index.encode(), index.encode());
    }

    #[test]
    fn yolo_index_odd_children_fails() {
        let mut buf = BytesMut::new();
        let mut level = BytesMut::new();
        put_packed_field(2, &[1, 0, 2], &mut level);
        put_len_field(1, &level, &mut buf);
        assert!(YoloIndex::decode(&buf).is_err());
    }

    #[test]
    fn extension_message_roundtrip() {
        let message = ExtensionMessage {
            cache: Some(CacheHint {
                start: 1,
                end: 12,
                blocks: vec![14, 17],
            }),
            get: Some(GetHint {
                head: Some(12),
                key: Some(Bytes::from_static(b"key")),
            }),
        };
        assert_eq!(message, ExtensionMessage::decode(&message.encode()).unwrap());

        let empty = ExtensionMessage::default();
        assert_eq!(empty, ExtensionMessage::decode(&empty.encode()).unwrap());
    }
}
