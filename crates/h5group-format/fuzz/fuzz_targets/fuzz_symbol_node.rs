#![no_main]
use h5group_format::codec::{Reader, Sizes};
use h5group_format::entry::SymbolEntry;
use h5group_format::group_node::SymbolNode;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for &(offset_size, length_size) in &[(4u8, 4u8), (8, 8), (2, 8)] {
        let Ok(sizes) = Sizes::new(offset_size, length_size) else {
            continue;
        };
        let _ = SymbolEntry::decode(&mut Reader::new(data, sizes));
        for leaf_k in [1usize, 4] {
            let _ = SymbolNode::decode(data, sizes, leaf_k);
        }
    }
});
