pub mod builder;
pub mod io;
pub mod iter;

use std::convert::Infallible;

use bitvec::vec::BitVec;
use bytemuck::{Pod, Zeroable};
use crc32fast::Hasher;
use iter::Nodes;
use thiserror::Error;

use crate::math_enums::Corners3;

/// A 24-bit color.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Pod, Zeroable)]
pub struct Rgb8 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb8 {
    pub const BLACK: Self = Self::new(0, 0, 0);
    pub const WHITE: Self = Self::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub const fn to_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }

    pub const fn from_array([r, g, b]: [u8; 3]) -> Self {
        Self { r, g, b }
    }

    /// Blends towards `other` by `weight`, where `0` returns `self` and `256` returns `other`.
    pub fn blend(self, other: Self, weight: u32) -> Self {
        let weight = weight.min(256);
        let mix = |a: u8, b: u8| ((a as u32 * (256 - weight) + b as u32 * weight) >> 8) as u8;
        Self::new(
            mix(self.r, other.r),
            mix(self.g, other.g),
            mix(self.b, other.b),
        )
    }
}

/// Where the children of a node can be found.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum NodeChildren {
    /// The node has no children.
    #[default]
    Leaf,
    /// The children are stored in the block with the given index.
    Block(u32),
    /// The node repeats itself within each of its present octants.
    ///
    /// Used to encode fractal geometry; such a node is never expanded.
    SelfReference,
}

/// A single node in a [`LinearOctree`].
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct NodeEntry {
    children: NodeChildren,
    /// Bit `k` is set if octant `k` holds a child.
    mask: u8,
    /// The average color of all children.
    color: Rgb8,
}

impl NodeEntry {
    /// An absent child slot.
    pub const EMPTY: Self = Self::leaf(Rgb8::BLACK);

    /// A node without children.
    pub const fn leaf(color: Rgb8) -> Self {
        Self {
            children: NodeChildren::Leaf,
            mask: 0,
            color,
        }
    }

    /// A node with children in the octants of `mask`, stored in the given `block`.
    ///
    /// Returns a leaf if `mask` is empty.
    pub const fn parent(block: u32, mask: u8, color: Rgb8) -> Self {
        if mask == 0 {
            Self::leaf(color)
        } else {
            Self {
                children: NodeChildren::Block(block),
                mask,
                color,
            }
        }
    }

    /// A node that repeats itself in every octant of `mask`.
    ///
    /// Returns a leaf if `mask` is empty.
    pub const fn fractal(mask: u8, color: Rgb8) -> Self {
        if mask == 0 {
            Self::leaf(color)
        } else {
            Self {
                children: NodeChildren::SelfReference,
                mask,
                color,
            }
        }
    }

    pub const fn children(self) -> NodeChildren {
        self.children
    }

    /// The child mask; bit `k` is set if octant `k` holds a child.
    pub const fn mask(self) -> u8 {
        self.mask
    }

    /// The set of octants holding a child.
    pub fn octants(self) -> Corners3 {
        Corners3::from_repr(self.mask)
    }

    pub const fn color(self) -> Rgb8 {
        self.color
    }

    pub const fn is_leaf(self) -> bool {
        self.mask == 0
    }

    /// Turns the node into a leaf, keeping its color.
    pub fn make_leaf(&mut self) {
        *self = Self::leaf(self.color);
    }

    /// The decoded form of this entry, addressing child slots directly.
    pub const fn to_info(self) -> NodeInfo {
        let address = match self.children {
            NodeChildren::Leaf => 0,
            NodeChildren::Block(block) => block * 8,
            NodeChildren::SelfReference => NodeInfo::SELF_REFERENCE,
        };
        NodeInfo {
            address,
            mask: self.mask,
            color: self.color,
        }
    }
}

/// A node as it is handed to the renderer, decoded into a flat slot space.
///
/// The interpretation of [`NodeInfo::address`] depends on the [`NodeSource`] that produced it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Pod, Zeroable)]
pub struct NodeInfo {
    /// The slot of the first child, or [`NodeInfo::SELF_REFERENCE`].
    pub address: u32,
    pub mask: u8,
    pub color: Rgb8,
}

impl NodeInfo {
    /// The address of a node that repeats itself in every present octant.
    pub const SELF_REFERENCE: u32 = u32::MAX;

    /// An absent child.
    pub const EMPTY: Self = Self {
        address: 0,
        mask: 0,
        color: Rgb8::BLACK,
    };

    pub const fn is_leaf(self) -> bool {
        self.mask == 0
    }

    pub const fn is_self_reference(self) -> bool {
        self.mask != 0 && self.address == Self::SELF_REFERENCE
    }

    /// Whether the node has children that can be loaded.
    pub const fn has_children(self) -> bool {
        self.mask != 0 && self.address != Self::SELF_REFERENCE
    }
}

/// Anything the renderer can pull decoded nodes from.
pub trait NodeSource {
    /// The error returned when children cannot be loaded.
    type Error: std::error::Error;

    /// The root of the octree.
    fn root(&self) -> NodeInfo;

    /// The maximum depth of the octree, the root being at depth `0`.
    fn max_depth(&self) -> u32;

    /// Loads all eight children of `parent`; absent children are [`NodeInfo::EMPTY`].
    ///
    /// Must only be called for nodes that [`NodeInfo::has_children`].
    fn load_children(&mut self, parent: NodeInfo) -> Result<[NodeInfo; 8], Self::Error>;

    /// Called once at the start of every frame.
    fn begin_frame(&mut self) {}
}

#[derive(Debug, Error)]
pub enum OctreeError {
    #[error("failed to access octree data")]
    Io(#[from] std::io::Error),
    #[error("octree data ended after {actual} of {expected} bytes")]
    Truncated { expected: u64, actual: u64 },
    #[error("invalid octree header: {0}")]
    InvalidHeader(&'static str),
    #[error("block index {0} does not fit into 24 bits")]
    AddressOutOfRange(u32),
}

/// An immutable octree stored as a flat sequence of eight-entry blocks.
///
/// The children of a node referencing block `b` are stored at slots `8 * b..8 * b + 8`, indexed by
/// their octant. Absent children are [`NodeEntry::EMPTY`].
///
/// Every [`LinearOctree`] is sanitized on construction, i.e. each block is referenced by at most one
/// node and all references are in range. This makes every traversal finite.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinearOctree {
    root: NodeEntry,
    nodes: Vec<NodeEntry>,
    max_depth: u32,
}

impl LinearOctree {
    /// Constructs a [`LinearOctree`] from its parts, sanitizing invalid references.
    ///
    /// # Panics
    ///
    /// Panics if the number of `nodes` is not a multiple of `8`.
    pub fn new(root: NodeEntry, nodes: Vec<NodeEntry>, max_depth: u32) -> Self {
        assert!(nodes.len() % 8 == 0, "nodes should consist of whole blocks");
        let mut octree = Self {
            root,
            nodes,
            max_depth,
        };
        let fixed = octree.sanitize();
        if fixed > 0 {
            log::warn!("turned {fixed} invalid octree entries into leaves");
        }
        octree
    }

    /// A single node repeating itself in all octants of `mask`.
    pub fn fractal(mask: u8, color: Rgb8, max_depth: u32) -> Self {
        Self {
            root: NodeEntry::fractal(mask, color),
            nodes: Vec::new(),
            max_depth,
        }
    }

    pub fn root(&self) -> NodeEntry {
        self.root
    }

    /// All node slots, including absent children.
    pub fn slots(&self) -> &[NodeEntry] {
        &self.nodes
    }

    pub fn block_count(&self) -> usize {
        self.nodes.len() / 8
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// The eight child slots of `node`.
    ///
    /// Returns [`None`] for leaves and self-referencing nodes.
    pub fn children(&self, node: NodeEntry) -> Option<&[NodeEntry; 8]> {
        match node.children {
            NodeChildren::Block(block) => self.block(block),
            NodeChildren::Leaf | NodeChildren::SelfReference => None,
        }
    }

    fn block(&self, block: u32) -> Option<&[NodeEntry; 8]> {
        let start = block as usize * 8;
        self.nodes.get(start..start + 8)?.try_into().ok()
    }

    /// Iterates all present nodes in depth-first order, starting with the root.
    pub fn nodes(&self) -> Nodes {
        Nodes::new(self)
    }

    /// Identifies the content across runs: the slot count in the upper half, a CRC-32 over all
    /// entries in the lower half.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Hasher::new();
        hasher.update(&self.max_depth.to_le_bytes());
        for entry in std::iter::once(&self.root).chain(&self.nodes) {
            let info = entry.to_info();
            hasher.update(&info.address.to_le_bytes());
            hasher.update(&[info.mask]);
            hasher.update(&info.color.to_array());
        }
        (self.nodes.len() as u64) << 32 | u64::from(hasher.finalize())
    }

    /// Turns every entry that cannot be followed safely into a leaf and returns how many were
    /// changed.
    ///
    /// Only present children are followed. An entry is invalid if it references block `0` (which
    /// belongs to the root), a block past the end, or a block that some other entry already
    /// references.
    fn sanitize(&mut self) -> usize {
        let block_count = self.block_count();
        let mut visited: BitVec = BitVec::repeat(false, block_count);
        let mut pending = Vec::new();
        let mut fixed = 0;

        if let NodeChildren::Block(block) = self.root.children {
            if (block as usize) < block_count {
                visited.set(block as usize, true);
                pending.push((block as usize, self.root.mask));
            } else {
                self.root.make_leaf();
                fixed += 1;
            }
        }

        while let Some((block, mask)) = pending.pop() {
            let entries = &mut self.nodes[block * 8..block * 8 + 8];
            for (octant, entry) in entries.iter_mut().enumerate() {
                if mask & (1 << octant) == 0 {
                    continue;
                }
                let NodeChildren::Block(child) = entry.children else {
                    continue;
                };
                let child = child as usize;
                if child == 0 || child >= block_count || visited[child] {
                    entry.make_leaf();
                    fixed += 1;
                } else {
                    visited.set(child, true);
                    pending.push((child, entry.mask));
                }
            }
        }

        fixed
    }
}

impl NodeSource for LinearOctree {
    type Error = Infallible;

    fn root(&self) -> NodeInfo {
        self.root.to_info()
    }

    fn max_depth(&self) -> u32 {
        self.max_depth
    }

    fn load_children(&mut self, parent: NodeInfo) -> Result<[NodeInfo; 8], Infallible> {
        let start = parent.address as usize;
        Ok(match self.nodes.get(start..start + 8) {
            Some(block) => array_init::array_init(|octant| {
                if parent.mask & (1 << octant) != 0 {
                    block[octant].to_info()
                } else {
                    NodeInfo::EMPTY
                }
            }),
            None => [NodeInfo::EMPTY; 8],
        })
    }
}
