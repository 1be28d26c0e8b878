//! End-to-end behaviour of the group engine through `Hierarchy`, plus
//! robustness against damaged file images.

use std::collections::BTreeSet;

use h5group_format::error::ErrorKind;
use h5group_format::hierarchy::{Hierarchy, Location, Target};
use h5group_format::object_header::{HeaderMessage, MessageType};
use h5group_format::property_list::{FileAccessProps, FileCreateProps};
use h5group_format::registry::ObjectKind;
use h5group_format::superblock::{Superblock, HDF5_SIGNATURE};
use proptest::prelude::*;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_file(h: &mut Hierarchy) -> Location {
    let fcpl = FileCreateProps::new().sym_leaf_k(2).btree_k(2).heap_size_hint(32);
    let id = h.create_file(&fcpl, &FileAccessProps::new()).unwrap();
    h.root(id).unwrap()
}

fn image_of(h: &mut Hierarchy, root: &Location) -> Vec<u8> {
    h.remove_file(root.file).unwrap().into_image().unwrap()
}

#[test]
fn foo_bar_scenario() {
    init();
    let mut h = Hierarchy::new();
    let root = small_file(&mut h);

    h.create_group(&root, "/foo", 0).unwrap();
    h.create_group(&root, "/foo/bar", 0).unwrap();
    let bar = h.resolve(&root, "/foo/bar").unwrap();
    assert_eq!(h.get_type(&root, "/foo/bar").unwrap(), ObjectKind::Group);
    assert_eq!(h.get_objinfo(&root, "/foo/bar", true).unwrap().header, bar.entry.header);

    h.unlink(&root, "/foo/bar").unwrap();
    assert!(h.resolve(&root, "/foo/bar").unwrap_err().is_not_found());

    h.move_link(&root, "/foo", &root, "/baz").unwrap();
    assert!(h.resolve(&root, "/foo").unwrap_err().is_not_found());
    assert!(h.list(&root, "/baz").unwrap().is_empty());
    assert_eq!(h.list(&root, "/").unwrap(), vec!["baz"]);
}

#[test]
fn deep_tree_survives_reopen() {
    init();
    let mut h = Hierarchy::new();
    let root = small_file(&mut h);
    for i in 0..40 {
        h.create_group(&root, &format!("g{i:02}"), 0).unwrap();
        h.insert_object(
            &root,
            &format!("g{i:02}/data"),
            vec![HeaderMessage::new(MessageType::DataLayout, vec![0; 8])],
        )
        .unwrap();
    }
    h.link_soft("g07/data", &root, "latest").unwrap();
    let before = h.validate_group(&root, "/").unwrap();
    assert!(before.height() >= 2);

    let image = image_of(&mut h, &root);
    let sb = Superblock::decode(&image).unwrap();
    assert_eq!(sb.eof_address, image.len() as u64);
    assert_eq!(sb.sym_leaf_k, 2);

    let id = h.open_file(image, &FileAccessProps::new()).unwrap();
    let root = h.root(id).unwrap();
    let after = h.validate_group(&root, "/").unwrap();
    assert_eq!(after.keys.len(), before.keys.len());
    assert_eq!(h.list(&root, "/").unwrap().len(), 41);
    assert_eq!(h.get_type(&root, "latest").unwrap(), ObjectKind::Dataset);
    assert_eq!(h.get_type(&root, "g39/data").unwrap(), ObjectKind::Dataset);
}

#[test]
fn user_block_is_skipped_on_open() {
    init();
    let mut h = Hierarchy::new();
    let root = small_file(&mut h);
    h.create_group(&root, "kept", 0).unwrap();
    let image = image_of(&mut h, &root);

    let mut shifted = vec![0u8; 512];
    shifted.extend_from_slice(&image);
    assert_eq!(&shifted[512..520], &HDF5_SIGNATURE);
    let id = h.open_file(shifted, &FileAccessProps::new()).unwrap();
    let root = h.root(id).unwrap();
    assert_eq!(h.list(&root, "/").unwrap(), vec!["kept"]);
}

#[test]
fn damaged_btree_page_is_corrupt_index() {
    init();
    let mut h = Hierarchy::new();
    let root = small_file(&mut h);
    h.create_group(&root, "a", 0).unwrap();
    let (btree, heap) = root.entry.symbol_table().unwrap();
    let image = image_of(&mut h, &root);

    let mut bad = image.clone();
    bad[btree as usize..btree as usize + 4].copy_from_slice(b"XXXX");
    let id = h.open_file(bad, &FileAccessProps::new()).unwrap();
    let root2 = h.root(id).unwrap();
    let err = h.list(&root2, "/").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptIndex);

    let mut bad = image;
    bad[heap as usize] = b'Z';
    let id = h.open_file(bad, &FileAccessProps::new()).unwrap();
    let root3 = h.root(id).unwrap();
    let err = h.resolve(&root3, "a").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptIndex);
}

#[test]
fn truncated_image_is_rejected() {
    init();
    let mut h = Hierarchy::new();
    let root = small_file(&mut h);
    let image = image_of(&mut h, &root);
    let err = h
        .open_file(image[..image.len() - 1].to_vec(), &FileAccessProps::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptIndex);
}

#[test]
fn file_size_cap_reports_out_of_space() {
    init();
    let mut h = Hierarchy::new();
    let fapl = FileAccessProps::new().max_file_size(4096);
    let id = h.create_file(&FileCreateProps::new(), &fapl).unwrap();
    let root = h.root(id).unwrap();
    let mut err = None;
    for i in 0..100 {
        if let Err(e) = h.create_group(&root, &format!("g{i}"), 0) {
            err = Some(e);
            break;
        }
    }
    assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::OutOfSpace));
}

#[test]
fn out_of_space_keeps_committed_names() {
    init();
    let fcpl = FileCreateProps::new().sym_leaf_k(2).btree_k(2).heap_size_hint(32);
    for cap in (2048..8192).step_by(16) {
        let mut h = Hierarchy::new();
        let fapl = FileAccessProps::new().max_file_size(cap);
        let Ok(id) = h.create_file(&fcpl, &fapl) else {
            continue;
        };
        let root = h.root(id).unwrap();
        let mut created = Vec::new();
        let mut err = None;
        for i in 0..1000 {
            let name = format!("g{i:03}");
            let msgs = vec![HeaderMessage::new(MessageType::DataLayout, vec![0; 8])];
            match h.insert_object(&root, &name, msgs) {
                Ok(_) => created.push(name),
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::OutOfSpace), "cap {cap}");

        assert_eq!(h.list(&root, "/").unwrap(), created, "cap {cap}");
        h.validate_group(&root, "/").unwrap();
        for name in &created {
            assert!(h.resolve(&root, name).is_ok(), "cap {cap}: {name} unreachable");
        }
    }
}

#[test]
fn nofollow_flags_only_affect_last_component() {
    init();
    let mut h = Hierarchy::new();
    let root = small_file(&mut h);
    h.create_group(&root, "real", 0).unwrap();
    h.create_group(&root, "real/leaf", 0).unwrap();
    h.link_soft("real", &root, "ln").unwrap();

    let lk = h.namei(&root, "ln/leaf", Target::NO_FOLLOW_LINK).unwrap();
    assert_eq!(lk.name, "leaf");
    assert!(!lk.object.unwrap().entry.is_soft_link());
    assert_eq!(lk.lookups, 3);
}

#[derive(Debug, Clone)]
enum Op {
    Create(u8),
    Unlink(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..60).prop_map(Op::Create),
        1 => (0u8..60).prop_map(Op::Unlink),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn group_matches_model(ops in proptest::collection::vec(op(), 1..120)) {
        let mut h = Hierarchy::new();
        let root = small_file(&mut h);
        let mut model = BTreeSet::new();
        for op in ops {
            match op {
                Op::Create(n) => {
                    let name = format!("n{n:02}");
                    let res = h.create_group(&root, &name, 0);
                    if model.insert(name) {
                        prop_assert!(res.is_ok());
                    } else {
                        prop_assert_eq!(res.unwrap_err().kind(), ErrorKind::AlreadyExists);
                    }
                }
                Op::Unlink(n) => {
                    let name = format!("n{n:02}");
                    let res = h.unlink(&root, &name);
                    if model.remove(&name) {
                        prop_assert!(res.is_ok());
                    } else {
                        prop_assert_eq!(res.unwrap_err().kind(), ErrorKind::NotFound);
                    }
                }
            }
        }
        let listed = h.list(&root, "/").unwrap();
        let expected: Vec<String> = model.iter().cloned().collect();
        prop_assert_eq!(listed, expected);
        let report = h.validate_group(&root, "/").unwrap();
        prop_assert_eq!(report.nodes() > 0, true);
    }

    #[test]
    fn damaged_images_never_panic(pos in 0usize..4096, byte in any::<u8>()) {
        let mut h = Hierarchy::new();
        let root = small_file(&mut h);
        for i in 0..12 {
            h.create_group(&root, &format!("g{i}"), 0).unwrap();
        }
        h.link_soft("/g3", &root, "ln").unwrap();
        let mut image = image_of(&mut h, &root);
        let pos = pos % image.len();
        image[pos] = byte;
        if let Ok(id) = h.open_file(image, &FileAccessProps::new()) {
            let root = h.root(id).unwrap();
            let _ = h.list(&root, "/");
            let _ = h.resolve(&root, "g7");
            let _ = h.resolve(&root, "ln");
        }
    }
}
