#![no_main]
use libfuzzer_sys::fuzz_target;
use std::collections::BTreeMap;

use beetree::{MemoryLog, RangeOptions, Tree, TreeConfig};

fuzz_target!(|data: Vec<(bool, Vec<u8>, Vec<u8>)>| {
    let mut m: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::default();
    let mut t = Tree::new(MemoryLog::new(), TreeConfig::default());

    for (is_delete, key, value) in data {
        if is_delete {
            m.remove(&key);
            t.del(&key).unwrap();
        } else {
            m.insert(key.clone(), value.clone());
            t.put(&key, &value).unwrap();
        }
    }

    // Check that the maps are equal
    let m: Vec<(Vec<u8>, Vec<u8>)> = m.into_iter().collect();
    let t: Vec<(Vec<u8>, Vec<u8>)> = t
        .range(RangeOptions::default())
        .unwrap()
        .map(|e| {
            let kv = e.unwrap();
            (kv.key.to_vec(), kv.value.to_vec())
        })
        .collect();

    assert_eq!(m, t);
});
