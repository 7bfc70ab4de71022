#![no_main]
use libfuzzer_sys::fuzz_target;

use beetree::{Header, NodeBlock, YoloIndex};

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary bytes must fail cleanly, and anything that decodes
    // must survive a re-encode round trip.
    if let Ok(header) = Header::decode(data) {
        let reencoded = header.encode();
        assert_eq!(header, Header::decode(&reencoded).unwrap());
    }
    if let Ok(block) = NodeBlock::decode(data) {
        let reencoded = block.encode();
        assert_eq!(block, NodeBlock::decode(&reencoded).unwrap());
    }
    if let Ok(index) = YoloIndex::decode(data) {
        let reencoded = index.encode();
        assert_eq!(index, YoloIndex::decode(&reencoded).unwrap());
    }
});
