use std::fmt::Debug;

index_vec::define_index_type! {
    /// Index of an inner node in [`Bvh::nodes`](super::Bvh).
    pub struct NodeIdx = u32;
    MAX_INDEX = NodeRef::MAX_INDEX as usize;
    IMPL_RAW_CONVERSIONS = true;
}

index_vec::define_index_type! {
    /// Index into the primitive array the hierarchy was built over.
    pub struct PrimIdx = u32;
    MAX_INDEX = NodeRef::MAX_INDEX as usize;
    IMPL_RAW_CONVERSIONS = true;
}

/// Contiguous block of primitives referenced by a leaf.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PrimRange {
    pub first: PrimIdx,
    pub count: u32,
}

impl PrimRange {
    pub fn new(first: PrimIdx, count: u32) -> PrimRange {
        PrimRange { first, count }
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn end(&self) -> usize {
        self.first.index() + self.len()
    }

    pub fn into_range(self) -> std::ops::Range<PrimIdx> {
        self.first..PrimIdx::from_usize(self.end())
    }

    pub fn iter(&self) -> impl Iterator<Item = PrimIdx> {
        (self.first.index()..self.end()).map(PrimIdx::from_usize)
    }
}

/// Tagged 32-bit reference to a node.
///
/// The low [`NodeRef::COUNT_BITS`] bits hold the primitive count of a leaf (zero for inner
/// nodes), the remaining bits hold the inner node index or the first primitive index.
/// Two index values are reserved for the empty child slot and the stack-bottom sentinel.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Inner(NodeIdx),
    Leaf(PrimRange),
    /// Unused child slot.
    Empty,
    /// Stack-bottom sentinel, never stored in a node.
    Invalid,
}

impl NodeRef {
    pub const COUNT_BITS: u32 = 4;
    const COUNT_MASK: u32 = (1 << Self::COUNT_BITS) - 1;
    const EMPTY_VALUE: u32 = u32::MAX;
    const INVALID_VALUE: u32 = (u32::MAX >> Self::COUNT_BITS) << Self::COUNT_BITS;

    pub const MAX_INDEX: u32 = (u32::MAX >> Self::COUNT_BITS) - 1;
    pub const MIN_LEAF_SIZE: u32 = 1;
    pub const MAX_LEAF_SIZE: u32 = Self::COUNT_MASK;

    pub const EMPTY: Self = Self(Self::EMPTY_VALUE);
    pub const INVALID: Self = Self(Self::INVALID_VALUE);

    /// Create a new leaf reference, panics if the index or count are out of range
    pub fn new_leaf(first: PrimIdx, count: u32) -> Self {
        assert!(count >= Self::MIN_LEAF_SIZE);
        assert!(count <= Self::MAX_LEAF_SIZE);
        assert!(first.raw() <= Self::MAX_INDEX);
        Self(first.raw() << Self::COUNT_BITS | count)
    }

    /// Create a new inner node reference, panics if the index is out of range
    pub fn new_inner(index: NodeIdx) -> Self {
        assert!(index.raw() <= Self::MAX_INDEX);
        Self(index.raw() << Self::COUNT_BITS)
    }

    pub fn kind(self) -> NodeKind {
        match self.0 {
            Self::EMPTY_VALUE => NodeKind::Empty,
            Self::INVALID_VALUE => NodeKind::Invalid,
            value => {
                let count = value & Self::COUNT_MASK;
                let index = value >> Self::COUNT_BITS;
                if count == 0 {
                    NodeKind::Inner(NodeIdx::from_raw_unchecked(index))
                } else {
                    NodeKind::Leaf(PrimRange::new(PrimIdx::from_raw_unchecked(index), count))
                }
            }
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == Self::EMPTY_VALUE
    }

    pub fn is_invalid(self) -> bool {
        self.0 == Self::INVALID_VALUE
    }

    pub fn is_leaf(self) -> bool {
        matches!(self.kind(), NodeKind::Leaf(_))
    }

    pub fn is_inner(self) -> bool {
        matches!(self.kind(), NodeKind::Inner(_))
    }

    /// Index of the inner node, panics if this is not an inner node reference.
    pub fn inner(self) -> NodeIdx {
        let NodeKind::Inner(index) = self.kind() else {
            panic!("{self:?} is not an inner node");
        };
        index
    }

    /// Primitives of the leaf, panics if this is not a leaf reference.
    pub fn leaf(self) -> PrimRange {
        let NodeKind::Leaf(range) = self.kind() else {
            panic!("{self:?} is not a leaf");
        };
        range
    }
}

impl Default for NodeRef {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Debug for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRef")
            .field("0", &self.0)
            .field("<decoded>", &self.kind())
            .finish()
    }
}
