//! Property lists for file creation and file access.
//!
//! Creation properties are fixed for the lifetime of a file and recorded in
//! its superblock. Access properties only affect how an open file is
//! manipulated and can differ between sessions.

use crate::codec::Sizes;
use crate::error::FormatError;

/// Default symbol-table node K (a node holds up to `2K` entries).
pub const DEFAULT_SYM_LEAF_K: u16 = 4;

/// Default group B-tree K (a node holds up to `2K` children).
pub const DEFAULT_BTREE_K: u16 = 16;

/// Default initial size of a new group's local heap data segment.
pub const DEFAULT_HEAP_SIZE_HINT: u64 = 256;

/// Default number of soft links followed during one name lookup.
pub const DEFAULT_MAX_SYMLINKS: u32 = 16;

/// Fill targets for B-tree node splits: `[left, middle, right]`.
///
/// When a full node splits, `left` applies to a node without a left
/// sibling, `right` to a node without a right sibling and `middle` to all
/// others. The value is the fraction of children kept in the left half.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitRatios(pub [f64; 3]);

impl Default for SplitRatios {
    fn default() -> Self {
        SplitRatios([0.1, 0.5, 0.9])
    }
}

impl SplitRatios {
    pub fn left(&self) -> f64 {
        self.0[0]
    }

    pub fn middle(&self) -> f64 {
        self.0[1]
    }

    pub fn right(&self) -> f64 {
        self.0[2]
    }

    /// Check that every ratio lies in `[0, 1]`.
    pub fn validate(&self) -> Result<(), FormatError> {
        for r in self.0 {
            if !(0.0..=1.0).contains(&r) {
                return Err(FormatError::InvalidConfig(format!(
                    "split ratio {r} outside [0, 1]"
                )));
            }
        }
        Ok(())
    }

    /// Smallest fraction a split can leave in either half.
    pub fn min_fill(&self) -> f64 {
        let [l, m, r] = self.0;
        let mut min = l;
        for v in [m, 1.0 - m, r, 1.0 - r] {
            if v < min {
                min = v;
            }
        }
        min
    }
}

/// File creation properties.
#[derive(Debug, Clone, PartialEq)]
pub struct FileCreateProps {
    /// Size of offsets in bytes (default: 8).
    pub offset_size: u8,
    /// Size of lengths in bytes (default: 8).
    pub length_size: u8,
    /// Symbol-table node K.
    pub sym_leaf_k: u16,
    /// Group B-tree K.
    pub btree_k: u16,
    /// Initial local heap data size for new groups.
    pub heap_size_hint: u64,
}

impl Default for FileCreateProps {
    fn default() -> Self {
        Self {
            offset_size: 8,
            length_size: 8,
            sym_leaf_k: DEFAULT_SYM_LEAF_K,
            btree_k: DEFAULT_BTREE_K,
            heap_size_hint: DEFAULT_HEAP_SIZE_HINT,
        }
    }
}

impl FileCreateProps {
    /// Create default file creation properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set offset and length sizes.
    pub fn sizes(mut self, offset_size: u8, length_size: u8) -> Self {
        self.offset_size = offset_size;
        self.length_size = length_size;
        self
    }

    /// Set symbol-table node K.
    pub fn sym_leaf_k(mut self, k: u16) -> Self {
        self.sym_leaf_k = k;
        self
    }

    /// Set group B-tree K.
    pub fn btree_k(mut self, k: u16) -> Self {
        self.btree_k = k;
        self
    }

    /// Set the initial heap size for new groups.
    pub fn heap_size_hint(mut self, bytes: u64) -> Self {
        self.heap_size_hint = bytes;
        self
    }

    /// Validated widths.
    pub fn sizes_checked(&self) -> Result<Sizes, FormatError> {
        Sizes::new(self.offset_size, self.length_size)
    }

    /// Check every creation property.
    pub fn validate(&self) -> Result<(), FormatError> {
        self.sizes_checked()?;
        if self.sym_leaf_k == 0 {
            return Err(FormatError::InvalidConfig("symbol table node K must be > 0".into()));
        }
        if self.btree_k == 0 {
            return Err(FormatError::InvalidConfig("B-tree K must be > 0".into()));
        }
        // 2K children must fit the 16-bit "entries used" field.
        if self.btree_k > u16::MAX / 2 || self.sym_leaf_k > u16::MAX / 2 {
            return Err(FormatError::InvalidConfig("K too large".into()));
        }
        Ok(())
    }
}

/// File access properties.
#[derive(Debug, Clone, PartialEq)]
pub struct FileAccessProps {
    /// Soft links followed per lookup before `TooManySymlinks`.
    pub max_symlinks: u32,
    /// B-tree split fill targets.
    pub split_ratios: SplitRatios,
    /// Hard cap on the file image size; `None` allows growth up to the
    /// address width.
    pub max_file_size: Option<u64>,
}

impl Default for FileAccessProps {
    fn default() -> Self {
        Self {
            max_symlinks: DEFAULT_MAX_SYMLINKS,
            split_ratios: SplitRatios::default(),
            max_file_size: None,
        }
    }
}

impl FileAccessProps {
    /// Create default file access properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the soft-link follow limit.
    pub fn max_symlinks(mut self, n: u32) -> Self {
        self.max_symlinks = n;
        self
    }

    /// Set B-tree split ratios.
    pub fn split_ratios(mut self, left: f64, middle: f64, right: f64) -> Self {
        self.split_ratios = SplitRatios([left, middle, right]);
        self
    }

    /// Cap the file image size.
    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = Some(bytes);
        self
    }

    pub fn validate(&self) -> Result<(), FormatError> {
        self.split_ratios.validate()
    }
}
