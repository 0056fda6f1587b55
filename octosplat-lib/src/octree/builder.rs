use std::collections::VecDeque;

use enum_map::EnumMap;
use glam::UVec3;
use itertools::iproduct;

use super::{LinearOctree, NodeEntry, Rgb8};
use crate::math_enums::{Corner3, Corners3};

/// Index of the root within [`OctreeBuilder::nodes`]; never a valid child index.
const ROOT: u32 = 0;

#[derive(Clone, Copy, Debug, Default)]
struct BuildNode {
    /// Indices into [`OctreeBuilder::nodes`], [`ROOT`] marks an absent child.
    children: EnumMap<Corner3, u32>,
    /// Sum of all colors inserted below this node, per channel.
    color_sum: [u64; 3],
    /// Number of colors inserted below this node.
    count: u64,
}

impl BuildNode {
    fn mask(&self) -> u8 {
        self.children
            .iter()
            .filter(|&(_, &child)| child != ROOT)
            .map(|(corner, _)| corner)
            .collect::<Corners3>()
            .as_repr()
    }

    fn color(&self) -> Rgb8 {
        if self.count == 0 {
            return Rgb8::BLACK;
        }
        Rgb8::from_array(self.color_sum.map(|sum| (sum / self.count) as u8))
    }
}

/// Builds a [`LinearOctree`] from colored voxels.
///
/// Voxels are addressed by integer positions within a cube of `2^depth` voxels along each axis.
/// Every node receives the average color of all voxels inserted below it.
#[derive(Clone, Debug)]
pub struct OctreeBuilder {
    depth: u32,
    /// All nodes, linked by indices, the root at [`ROOT`].
    nodes: Vec<BuildNode>,
}

impl OctreeBuilder {
    /// The deepest supported octree; positions must fit into a [`u32`].
    pub const MAX_DEPTH: u32 = 31;

    /// Constructs an empty [`OctreeBuilder`] for `2^depth` voxels along each axis.
    ///
    /// # Panics
    ///
    /// Panics if `depth` exceeds [`OctreeBuilder::MAX_DEPTH`].
    pub fn new(depth: u32) -> Self {
        assert!(depth <= Self::MAX_DEPTH, "octree depth should not exceed 31");
        Self {
            depth,
            nodes: vec![BuildNode::default()],
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// The number of voxels along each axis.
    pub fn size(&self) -> u32 {
        1 << self.depth
    }

    /// Whether no voxel has been inserted yet.
    pub fn is_empty(&self) -> bool {
        self.nodes[ROOT as usize].count == 0
    }

    /// Inserts a voxel at `position`.
    ///
    /// Inserting the same position multiple times averages the colors.
    ///
    /// # Panics
    ///
    /// Panics if `position` lies outside of the octree.
    pub fn insert(&mut self, position: UVec3, color: Rgb8) {
        assert!(
            position.max_element() < self.size(),
            "position should lie within the octree"
        );

        let mut node = ROOT;
        self.accumulate(node, color);
        for level in (0..self.depth).rev() {
            let bits = (position >> level) & UVec3::ONE;
            let octant = Corner3::from_index((bits.x | bits.y << 1 | bits.z << 2) as u8);
            let mut child = self.nodes[node as usize].children[octant];
            if child == ROOT {
                child = u32::try_from(self.nodes.len()).expect("node count should fit into u32");
                self.nodes.push(BuildNode::default());
                self.nodes[node as usize].children[octant] = child;
            }
            node = child;
            self.accumulate(node, color);
        }
    }

    /// Inserts every voxel whose center lies less than `radius` but at least `radius - thickness`
    /// away from the center of the octree.
    ///
    /// Colors follow the position, from black at the origin to white at the opposite corner.
    pub fn insert_ball(&mut self, radius: f32, thickness: f32) {
        let size = self.size();
        let center = size as f32 / 2.0;
        for (z, y, x) in iproduct!(0..size, 0..size, 0..size) {
            let position = UVec3::new(x, y, z);
            let distance = (position.as_vec3() + 0.5 - center).length();
            if distance < radius && distance >= radius - thickness {
                let gradient = position.as_u64vec3() * 255 / size as u64;
                self.insert(position, Rgb8::from_array(gradient.to_array().map(|c| c as u8)));
            }
        }
    }

    fn accumulate(&mut self, node: u32, color: Rgb8) {
        let node = &mut self.nodes[node as usize];
        for (sum, channel) in node.color_sum.iter_mut().zip(color.to_array()) {
            *sum += channel as u64;
        }
        node.count += 1;
    }

    /// Emits the [`LinearOctree`], assigning child blocks in breadth-first order.
    pub fn finish(&self) -> LinearOctree {
        let root = &self.nodes[ROOT as usize];
        let root_mask = root.mask();
        let mut slots = Vec::new();
        let mut pending = VecDeque::new();
        if root_mask != 0 {
            pending.push_back(ROOT);
        }

        let mut next_block = 1;
        while let Some(parent) = pending.pop_front() {
            for &child in self.nodes[parent as usize].children.values() {
                if child == ROOT {
                    slots.push(NodeEntry::EMPTY);
                    continue;
                }
                let node = &self.nodes[child as usize];
                let mask = node.mask();
                if mask == 0 {
                    slots.push(NodeEntry::leaf(node.color()));
                } else {
                    slots.push(NodeEntry::parent(next_block, mask, node.color()));
                    next_block += 1;
                    pending.push_back(child);
                }
            }
        }

        LinearOctree::new(
            NodeEntry::parent(0, root_mask, root.color()),
            slots,
            self.depth,
        )
    }
}

impl Extend<(UVec3, Rgb8)> for OctreeBuilder {
    fn extend<T: IntoIterator<Item = (UVec3, Rgb8)>>(&mut self, iter: T) {
        for (position, color) in iter {
            self.insert(position, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;
    use crate::octree::NodeChildren;

    #[test]
    fn single_voxel() {
        let mut builder = OctreeBuilder::new(2);
        builder.insert(UVec3::new(3, 0, 1), Rgb8::new(8, 16, 32));
        let octree = builder.finish();

        // level 1 octant: (1, 0, 0), level 2 octant: (1, 0, 1)
        assert_eq!(octree.root().mask(), 0b0000_0010);
        assert_eq!(octree.block_count(), 2);
        assert_eq!(octree.slots()[1].children(), NodeChildren::Block(1));
        assert_eq!(octree.slots()[1].mask(), 0b0010_0000);
        assert_eq!(octree.slots()[8 + 5], NodeEntry::leaf(Rgb8::new(8, 16, 32)));
    }

    #[test]
    fn colors_are_averaged() {
        let mut builder = OctreeBuilder::new(1);
        builder.extend([
            (UVec3::new(0, 0, 0), Rgb8::new(100, 0, 0)),
            (UVec3::new(1, 1, 1), Rgb8::new(0, 200, 0)),
            (UVec3::new(1, 1, 1), Rgb8::new(0, 100, 0)),
        ]);
        let octree = builder.finish();
        assert_eq!(octree.root().color(), Rgb8::new(33, 100, 0));
        assert_eq!(octree.slots()[7].color(), Rgb8::new(0, 150, 0));
        assert_eq!(octree.max_depth(), 1);
    }

    #[test]
    fn blocks_are_breadth_first() {
        let mut builder = OctreeBuilder::new(3);
        let size = builder.size();
        builder.extend(
            (0..size)
                .cartesian_product(0..size)
                .filter(|&(x, y)| x == y)
                .map(|(x, y)| (UVec3::new(x, y, 0), Rgb8::WHITE)),
        );
        let octree = builder.finish();
        let levels = octree.nodes().map(|node| node.level).collect_vec();
        assert_eq!(levels.iter().filter(|&&level| level == 3).count(), 8);
        assert_eq!(octree.block_count(), 1 + 2 + 4);
        // both level 1 parents are emitted before any level 2 parent
        let level_one_blocks = octree
            .children(octree.root())
            .unwrap()
            .iter()
            .filter_map(|entry| match entry.children() {
                NodeChildren::Block(block) => Some(block),
                _ => None,
            })
            .collect_vec();
        assert_eq!(level_one_blocks, [1u32, 2]);
    }

    #[test]
    fn ball_and_shell() {
        let mut ball = OctreeBuilder::new(3);
        ball.insert_ball(4.0, f32::INFINITY);
        let mut shell = OctreeBuilder::new(3);
        shell.insert_ball(4.0, 1.0);
        let count = |builder: &OctreeBuilder| builder.nodes[ROOT as usize].count;

        assert!(count(&shell) > 0);
        assert!(count(&shell) < count(&ball));
        assert!(count(&ball) < 8 * 8 * 8);

        let octree = ball.finish();
        // the gradient averages to gray over a symmetric ball
        let [r, g, b] = octree.root().color().to_array();
        assert_eq!((r, g), (g, b));
        assert_eq!(octree.root().mask(), 0xFF);
    }

    #[test]
    fn empty_builder() {
        let builder = OctreeBuilder::new(4);
        assert!(builder.is_empty());
        let octree = builder.finish();
        assert!(octree.root().is_leaf());
        assert_eq!(octree.block_count(), 0);
    }
}
