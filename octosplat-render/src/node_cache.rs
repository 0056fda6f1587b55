//! Remembers decoded children along the paths traversed in the last frame.
//!
//! Every frame writes the children it decodes into fresh slots of the write buffer and links each
//! slot from the entry of its parent. In the next frame, the buffers swap and a traversal that
//! follows the same paths finds all children in the read buffer without touching the node source.

use std::collections::HashMap;

use octosplat_lib::octree::NodeInfo;

/// Reserved for links of roots, which are kept in the instance map instead.
const ROOT_PARENT: u32 = 0;
/// Receives commits once the cache is full; never linked.
const OVERFLOW: u32 = 1;
const FIRST_SLOT: u32 = 2;

const UNCACHED: i32 = -1;

/// Identifies a single draw call across frames.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct InstanceKey {
    pub instance: u64,
    pub part: u32,
    pub geometry: u32,
}

impl InstanceKey {
    pub const fn new(instance: u64, part: u32, geometry: u32) -> Self {
        Self {
            instance,
            part,
            geometry,
        }
    }
}

/// Ties a traversed node to the cache slots of its children.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheLink {
    /// The slot in the read buffer holding the children decoded last frame.
    read: Option<u32>,
    /// The write slot holding this node and its siblings, or [`ROOT_PARENT`].
    parent: u32,
    /// The octant of this node within `parent`.
    octant: u8,
}

#[derive(Clone, Debug)]
struct CacheBuffer {
    /// Per child, the slot holding its own children or [`UNCACHED`].
    index: Vec<i32>,
    /// Eight decoded children per slot.
    info: Vec<NodeInfo>,
    /// The slot of the children of each root, along with the root it was recorded for.
    roots: HashMap<InstanceKey, (NodeInfo, u32)>,
}

impl CacheBuffer {
    fn new(capacity: u32) -> Self {
        let len = capacity as usize * 8;
        Self {
            index: vec![UNCACHED; len],
            info: vec![NodeInfo::EMPTY; len],
            roots: HashMap::new(),
        }
    }

    fn children(&self, slot: u32) -> &[NodeInfo; 8] {
        let start = slot as usize * 8;
        self.info[start..start + 8]
            .try_into()
            .expect("cache slots should hold eight children")
    }
}

/// A double buffered record of the children decoded during the last frame.
#[derive(Clone, Debug)]
pub struct NodeCache {
    read: CacheBuffer,
    write: CacheBuffer,
    /// The number of slots per buffer.
    capacity: u32,
    /// The next free write slot.
    cursor: u32,
    frozen: bool,
    current: Option<(InstanceKey, NodeInfo)>,
    overflows: u64,
}

impl NodeCache {
    /// Constructs an empty [`NodeCache`] with `capacity` slots of eight children each.
    ///
    /// Two slots are reserved, so `capacity` is raised to at least three.
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(FIRST_SLOT + 1);
        Self {
            read: CacheBuffer::new(capacity),
            write: CacheBuffer::new(capacity),
            capacity,
            cursor: FIRST_SLOT,
            frozen: false,
            current: None,
            overflows: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// The number of slots written in the current frame, including the reserved ones.
    pub fn used(&self) -> u32 {
        self.cursor
    }

    /// The number of commits that did not fit into the current frame.
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Makes the children written in the last frame available for lookup.
    ///
    /// A frozen cache keeps its read buffer and ignores commits. Changing the `capacity` drops all
    /// cached data.
    pub fn begin_frame(&mut self, capacity: u32, frozen: bool) {
        self.current = None;
        self.overflows = 0;
        self.frozen = frozen;
        if frozen {
            return;
        }

        let capacity = capacity.max(FIRST_SLOT + 1);
        if capacity != self.capacity {
            log::debug!("resizing node cache to {capacity} slots");
            *self = Self::new(capacity);
            return;
        }

        std::mem::swap(&mut self.read, &mut self.write);
        self.write.roots.clear();
        self.cursor = FIRST_SLOT;
    }

    /// Starts the traversal of an instance and returns the link of its `root`.
    ///
    /// Cached children are only used if they were recorded for the very same root.
    pub fn begin_instance(&mut self, key: InstanceKey, root: NodeInfo) -> CacheLink {
        self.current = Some((key, root));
        let read = self
            .read
            .roots
            .get(&key)
            .filter(|(cached_root, _)| *cached_root == root)
            .map(|&(_, slot)| slot);
        CacheLink {
            read,
            parent: ROOT_PARENT,
            octant: 0,
        }
    }

    /// The children of the linked node as decoded last frame.
    pub fn lookup(&self, link: CacheLink) -> Option<[NodeInfo; 8]> {
        link.read.map(|slot| *self.read.children(slot))
    }

    /// Records the children of the linked node for the next frame and returns their write slot.
    pub fn commit(&mut self, link: CacheLink, children: &[NodeInfo; 8]) -> u32 {
        if self.frozen {
            return OVERFLOW;
        }

        let slot = if self.cursor < self.capacity {
            self.cursor += 1;
            self.cursor - 1
        } else {
            self.overflows += 1;
            OVERFLOW
        };

        let start = slot as usize * 8;
        self.write.info[start..start + 8].copy_from_slice(children);
        self.write.index[start..start + 8].fill(UNCACHED);

        if slot != OVERFLOW {
            match link.parent {
                ROOT_PARENT => {
                    if let Some((key, root)) = self.current {
                        self.write.roots.insert(key, (root, slot));
                    }
                }
                OVERFLOW => {}
                parent => {
                    self.write.index[parent as usize * 8 + link.octant as usize] = slot as i32;
                }
            }
        }
        slot
    }

    /// The link of child `octant` of a node whose children were committed to `written`.
    pub fn child_link(&self, parent: CacheLink, written: u32, octant: u8) -> CacheLink {
        let read = parent.read.and_then(|slot| {
            let index = self.read.index[slot as usize * 8 + octant as usize];
            u32::try_from(index).ok().filter(|&index| index >= FIRST_SLOT)
        });
        CacheLink {
            read,
            parent: written,
            octant,
        }
    }
}

impl Default for NodeCache {
    fn default() -> Self {
        Self::new(1 << 16)
    }
}
