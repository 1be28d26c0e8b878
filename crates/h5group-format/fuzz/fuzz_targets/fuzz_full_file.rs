#![no_main]
use h5group_format::hierarchy::Hierarchy;
use h5group_format::property_list::FileAccessProps;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Full open: signature -> superblock -> root symbol table, then walk it
    let mut h = Hierarchy::new();
    let Ok(id) = h.open_file(data.to_vec(), &FileAccessProps::new()) else {
        return;
    };
    let Ok(root) = h.root(id) else {
        return;
    };
    if let Ok(names) = h.list(&root, "/") {
        for name in names.iter().take(16) {
            let _ = h.get_objinfo(&root, name, false);
            let _ = h.resolve(&root, name);
        }
    }
    let _ = h.validate_group(&root, "/");
});
