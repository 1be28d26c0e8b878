#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Signature at offset 0
    let _ = h5group_format::superblock::Superblock::decode(data);
    // After a user block
    if let Ok(offset) = h5group_format::superblock::find_signature(data) {
        let _ = h5group_format::superblock::Superblock::decode(&data[offset..]);
    }
});
