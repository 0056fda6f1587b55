use std::iter::FusedIterator;

use super::{LinearOctree, NodeChildren, NodeEntry};

/// A node yielded by [`Nodes`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeRef<'a> {
    /// The depth of the node; `0` for the root.
    pub level: u32,
    /// The slot of the node, [`None`] for the root.
    pub slot: Option<usize>,
    pub entry: &'a NodeEntry,
}

/// Iterates all present nodes of a [`LinearOctree`] in depth-first order.
///
/// Children are visited in octant order. Self-referencing nodes are yielded but not entered.
///
/// Created by [`LinearOctree::nodes`]; calling it again restarts iteration from the root.
#[derive(Clone, Debug)]
pub struct Nodes<'a> {
    octree: &'a LinearOctree,
    /// Nodes that still have to be yielded, the next one on top.
    pending: Vec<NodeRef<'a>>,
}

impl<'a> Nodes<'a> {
    pub(crate) fn new(octree: &'a LinearOctree) -> Self {
        Self {
            octree,
            pending: vec![NodeRef {
                level: 0,
                slot: None,
                entry: &octree.root,
            }],
        }
    }
}

impl<'a> Iterator for Nodes<'a> {
    type Item = NodeRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.pending.pop()?;
        if let NodeChildren::Block(block) = node.entry.children {
            let start = block as usize * 8;
            let children = &self.octree.nodes[start..start + 8];
            self.pending
                .extend(node.entry.octants().iter().rev().map(|corner| {
                    let slot = start + corner.index() as usize;
                    NodeRef {
                        level: node.level + 1,
                        slot: Some(slot),
                        entry: &children[corner.index() as usize],
                    }
                }));
        }
        Some(node)
    }
}

impl FusedIterator for Nodes<'_> {}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;
    use crate::octree::Rgb8;

    #[test]
    fn depth_first_in_octant_order() {
        let color = Rgb8::new(10, 20, 30);
        let mut nodes = vec![NodeEntry::EMPTY; 16];
        nodes[1] = NodeEntry::parent(1, 0b1000_0001, color);
        nodes[6] = NodeEntry::leaf(color);
        nodes[8] = NodeEntry::leaf(color);
        nodes[15] = NodeEntry::fractal(0b11, color);
        let octree = LinearOctree::new(NodeEntry::parent(0, 0b0100_0010, color), nodes, 2);

        let visited = octree
            .nodes()
            .map(|node| (node.level, node.slot))
            .collect_vec();
        assert_eq!(
            visited,
            [
                (0, None),
                (1, Some(1)),
                (2, Some(8)),
                (2, Some(15)),
                (1, Some(6)),
            ]
        );

        // restartable
        assert_eq!(octree.nodes().count(), 5);
    }
}
