//! Version-0 superblock: file-wide widths, group K values and the root
//! group's symbol table entry.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::codec::{Reader, Sizes, Writer};
use crate::entry::SymbolEntry;
use crate::error::FormatError;

/// The 8-byte HDF5 magic signature.
pub const HDF5_SIGNATURE: [u8; 8] = [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1A, b'\n'];

/// Bytes before the variable-width fields.
const FIXED_PREFIX: usize = 24;

/// Search for the signature at offset 0 and at powers of two from 512.
pub fn find_signature(data: &[u8]) -> Result<usize, FormatError> {
    if data.len() >= 8 && data[..8] == HDF5_SIGNATURE {
        return Ok(0);
    }
    let mut offset = 512;
    while offset + 8 <= data.len() {
        if data[offset..offset + 8] == HDF5_SIGNATURE {
            return Ok(offset);
        }
        offset *= 2;
    }
    Err(FormatError::SignatureNotFound)
}

/// Parsed version-0 superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub sizes: Sizes,
    /// Symbol table node K.
    pub sym_leaf_k: u16,
    /// Group B-tree K.
    pub btree_k: u16,
    pub consistency_flags: u32,
    pub base_address: u64,
    pub eof_address: u64,
    /// Entry of the root group.
    pub root: SymbolEntry,
}

impl Superblock {
    pub fn encoded_size(sizes: Sizes) -> usize {
        FIXED_PREFIX + 4 * sizes.os() + SymbolEntry::encoded_size(sizes)
    }

    pub fn encode(&self) -> Vec<u8> {
        let sizes = self.sizes;
        let mut w = Writer::with_capacity(sizes, Self::encoded_size(sizes));
        w.bytes(&HDF5_SIGNATURE);
        w.u8(0); // superblock version
        w.u8(0); // free-space storage version
        w.u8(0); // root group symbol table entry version
        w.u8(0);
        w.u8(0); // shared header message format version
        w.u8(sizes.offset);
        w.u8(sizes.length);
        w.u8(0);
        w.u16(self.sym_leaf_k);
        w.u16(self.btree_k);
        w.u32(self.consistency_flags);
        w.address(Some(self.base_address));
        w.address(None); // free-space info
        w.address(Some(self.eof_address));
        w.address(None); // driver info
        self.root.encode(&mut w);
        w.finish()
    }

    /// Parse the superblock whose signature starts `data`.
    pub fn decode(data: &[u8]) -> Result<Superblock, FormatError> {
        if data.len() < 9 {
            return Err(FormatError::UnexpectedEof {
                expected: 9,
                available: data.len(),
            });
        }
        if data[..8] != HDF5_SIGNATURE {
            return Err(FormatError::SignatureNotFound);
        }
        if data[8] != 0 {
            return Err(FormatError::UnsupportedVersion(data[8]));
        }
        if data.len() < FIXED_PREFIX {
            return Err(FormatError::UnexpectedEof {
                expected: FIXED_PREFIX,
                available: data.len(),
            });
        }
        let sizes = Sizes::new(data[13], data[14])?;
        let mut r = Reader::new(&data[16..], sizes);
        let sym_leaf_k = r.u16()?;
        let btree_k = r.u16()?;
        if sym_leaf_k == 0 || btree_k == 0 {
            return Err(FormatError::CorruptIndex(format!(
                "superblock K values {sym_leaf_k}/{btree_k} must be > 0"
            )));
        }
        let consistency_flags = r.u32()?;
        let base_address = r.address()?.unwrap_or(0);
        let _free_space = r.address()?;
        let eof_address = r.defined_address("end of file")?;
        let _driver_info = r.address()?;
        let root = SymbolEntry::decode(&mut r)?;
        Ok(Superblock {
            sizes,
            sym_leaf_k,
            btree_k,
            consistency_flags,
            base_address,
            eof_address,
            root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(sizes: Sizes) -> Superblock {
        Superblock {
            sizes,
            sym_leaf_k: 4,
            btree_k: 16,
            consistency_flags: 0,
            base_address: 0,
            eof_address: 0x1000,
            root: SymbolEntry::group(0x60, 0x88, 0x2A8),
        }
    }

    #[test]
    fn v0_layout() {
        let sb = sample(Sizes::default());
        let raw = sb.encode();
        assert_eq!(raw.len(), Superblock::encoded_size(Sizes::default()));
        assert_eq!(raw.len(), 96);
        assert_eq!(&raw[..8], &HDF5_SIGNATURE);
        assert_eq!(raw[13], 8);
        assert_eq!(u16::from_le_bytes([raw[16], raw[17]]), 4);
        assert_eq!(u16::from_le_bytes([raw[18], raw[19]]), 16);
        assert_eq!(&raw[32..40], &[0xFF; 8]);
        assert_eq!(Superblock::decode(&raw).unwrap(), sb);
    }

    #[test]
    fn small_widths() {
        let sb = sample(Sizes::new(4, 2).unwrap());
        assert_eq!(Superblock::decode(&sb.encode()).unwrap(), sb);
    }

    #[test]
    fn signature_search() {
        let mut data = vec![0u8; 2048];
        assert_eq!(find_signature(&data), Err(FormatError::SignatureNotFound));
        data[1024..1032].copy_from_slice(&HDF5_SIGNATURE);
        assert_eq!(find_signature(&data), Ok(1024));
        data[..8].copy_from_slice(&HDF5_SIGNATURE);
        assert_eq!(find_signature(&data), Ok(0));
    }

    #[test]
    fn rejects_other_versions_and_widths() {
        let mut raw = sample(Sizes::default()).encode();
        raw[8] = 2;
        assert_eq!(Superblock::decode(&raw), Err(FormatError::UnsupportedVersion(2)));
        raw[8] = 0;
        raw[13] = 3;
        assert_eq!(Superblock::decode(&raw), Err(FormatError::InvalidOffsetSize(3)));
        raw[13] = 8;
        assert!(matches!(
            Superblock::decode(&raw[..50]),
            Err(FormatError::UnexpectedEof { .. })
        ));
    }
}
