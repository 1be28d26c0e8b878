#![no_main]
use h5group_format::codec::Sizes;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for &offset_size in &[2u8, 4, 8] {
        for &length_size in &[2u8, 4, 8] {
            let Ok(sizes) = Sizes::new(offset_size, length_size) else {
                continue;
            };
            if let Ok(hdr) = h5group_format::object_header::ObjectHeader::decode(data, sizes) {
                let _ = hdr.symbol_table(sizes);
            }
        }
    }
});
