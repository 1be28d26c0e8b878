#![no_main]
use h5group_format::codec::Sizes;
use h5group_format::local_heap::LocalHeap;
use h5group_format::storage::MemStorage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let store = MemStorage::from_bytes(data.to_vec(), u64::MAX);
    for &length_size in &[4u8, 8] {
        let Ok(sizes) = Sizes::new(8, length_size) else {
            continue;
        };
        if let Ok(heap) = LocalHeap::load(&store, sizes, 0) {
            for span in heap.free_spans() {
                let _ = heap.peek_str(span.offset);
            }
            let _ = heap.peek_str(0);
        }
    }
});
