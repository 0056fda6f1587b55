//! Pages octree nodes in and out of a single arena, one chunk at a time.

pub mod pack;

use std::{collections::VecDeque, path::Path};

use thiserror::Error;

use crate::{
    alloc::{AllocError, BlockAllocator},
    octree::{LinearOctree, NodeEntry, NodeInfo, NodeSource},
};
pub use pack::{ChildCursor, ChunkHeader, PackedOctree};

/// Arena allocations are made in units of one sibling block.
const GRANULE_SHIFT: u32 = 3;

/// Settings of a [`ChunkedOctreeStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct StoreConfig {
    /// Each chunk holds up to `1 << chunk_shift` nodes.
    pub chunk_shift: u32,
    /// Whether packed chunks are LZ4-compressed.
    pub compress: bool,
    /// The arena starts out with `1 << initial_arena_shift` nodes.
    pub initial_arena_shift: u32,
    /// The arena never grows beyond `1 << max_arena_shift` nodes.
    pub max_arena_shift: u32,
}

impl StoreConfig {
    pub const MIN_CHUNK_SHIFT: u32 = GRANULE_SHIFT;
    pub const MAX_CHUNK_SHIFT: u32 = 20;
    pub const MAX_ARENA_SHIFT: u32 = 28;

    /// Returns a copy with every setting moved into its valid range.
    pub fn clamped(self) -> Self {
        let chunk_shift = self
            .chunk_shift
            .clamp(Self::MIN_CHUNK_SHIFT, Self::MAX_CHUNK_SHIFT);
        let max_arena_shift = self.max_arena_shift.clamp(chunk_shift, Self::MAX_ARENA_SHIFT);
        Self {
            chunk_shift,
            compress: self.compress,
            initial_arena_shift: self
                .initial_arena_shift
                .clamp(GRANULE_SHIFT, max_arena_shift),
            max_arena_shift,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_shift: 12,
            compress: true,
            initial_arena_shift: 16,
            max_arena_shift: 24,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error("corrupt chunk data: {0}")]
    Corrupt(&'static str),
    #[error("failed to decompress chunk")]
    Decompress(#[from] lz4_flex::block::DecompressError),
    #[error("failed to access packed octree file")]
    Io(#[from] std::io::Error),
    #[error("packed octree was built from different data or settings")]
    Mismatch,
    #[error("not a packed octree file")]
    BadMagic,
    #[error("unsupported packed octree version {0}")]
    UnsupportedVersion(u32),
}

/// Residency of a single chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Where the chunk lives in the arena, if resident.
    allocator_offset: Option<u32>,
    /// The frame in which the chunk was last accessed.
    last_access_time: u64,
    /// The number of nodes in the chunk.
    len: u32,
}

impl ChunkInfo {
    pub fn allocator_offset(self) -> Option<u32> {
        self.allocator_offset
    }

    pub fn is_resident(self) -> bool {
        self.allocator_offset.is_some()
    }

    pub fn last_access_time(self) -> u64 {
        self.last_access_time
    }

    pub fn len(self) -> u32 {
        self.len
    }

    pub fn is_empty(self) -> bool {
        self.len == 0
    }
}

/// How decoded slots map to chunks and where children are found.
#[derive(Clone, Debug)]
enum Layout {
    /// Every chunk is a copy of a [`LinearOctree`] slot range and stays resident.
    ///
    /// Children occupy all eight slots after their parent's address.
    Blocks,
    /// Chunks are decoded on demand and can be evicted.
    ///
    /// Only present children are stored, ordered by octant.
    Packed(PackedOctree),
}

/// Counters collected by a [`ChunkedOctreeStore`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub chunks_decoded: u64,
    pub chunks_evicted: u64,
}

/// A [`NodeSource`] that keeps chunks of decoded nodes in a [`BlockAllocator`] arena.
///
/// Decoded slot `s` lives in chunk `s >> chunk_shift` at offset `s & (chunk_size - 1)`.
#[derive(Clone, Debug)]
pub struct ChunkedOctreeStore {
    layout: Layout,
    chunk_shift: u32,
    root: NodeInfo,
    max_depth: u32,
    chunks: Vec<ChunkInfo>,
    arena: BlockAllocator<NodeInfo>,
    /// Advanced once per frame.
    clock: u64,
    stats: StoreStats,
}

impl ChunkedOctreeStore {
    /// Copies all slots of `octree` into pinned chunks.
    ///
    /// Fails if the arena cannot hold the whole octree.
    pub fn from_linear(octree: &LinearOctree, config: StoreConfig) -> Result<Self, StoreError> {
        let config = config.clamped();
        let mut store = Self::empty(
            Layout::Blocks,
            octree.root().to_info(),
            octree.max_depth(),
            config,
        );

        let chunk_size = 1 << config.chunk_shift;
        for slots in octree.slots().chunks(chunk_size) {
            let offset = store.arena.allocate(slots.len())?;
            store
                .arena
                .slice_mut(offset, slots.len())
                .iter_mut()
                .zip(slots)
                .for_each(|(target, entry)| *target = entry.to_info());
            store.chunks.push(ChunkInfo {
                allocator_offset: Some(offset),
                last_access_time: 0,
                len: slots.len() as u32,
            });
        }

        log::debug!(
            "copied {} slots into {} pinned chunks",
            octree.slots().len(),
            store.chunks.len()
        );
        Ok(store)
    }

    /// Prepares a store that decodes chunks of `packed` on demand.
    pub fn from_packed(packed: PackedOctree, config: StoreConfig) -> Self {
        let config = StoreConfig {
            chunk_shift: packed.chunk_shift(),
            compress: packed.is_compressed(),
            ..config
        }
        .clamped();
        let chunks = packed
            .headers()
            .iter()
            .map(|header| ChunkInfo {
                allocator_offset: None,
                last_access_time: 0,
                len: header.node_count,
            })
            .collect();
        let (root, max_depth) = (packed.root(), packed.max_depth());
        let mut store = Self::empty(Layout::Packed(packed), root, max_depth, config);
        store.chunks = chunks;
        store
    }

    /// Packs `octree` in memory and prepares a store for it.
    pub fn pack(octree: &LinearOctree, config: StoreConfig) -> Self {
        let config = config.clamped();
        Self::from_packed(
            PackedOctree::build(octree, config.chunk_shift, config.compress),
            config,
        )
    }

    /// Loads the packed file at `path` if it matches `octree` and `config`.
    ///
    /// Otherwise packs `octree` anew and tries to replace the file; failing to write it is only
    /// logged.
    pub fn open_or_pack(path: impl AsRef<Path>, octree: &LinearOctree, config: StoreConfig) -> Self {
        let path = path.as_ref();
        let config = config.clamped();
        let loaded = PackedOctree::load(path).and_then(|packed| {
            if packed.matches(octree, &config) {
                Ok(packed)
            } else {
                Err(StoreError::Mismatch)
            }
        });

        let packed = match loaded {
            Ok(packed) => {
                log::info!("loaded packed octree from {}", path.display());
                packed
            }
            Err(error) => {
                log::warn!("repacking {}: {error}", path.display());
                let packed = PackedOctree::build(octree, config.chunk_shift, config.compress);
                if let Err(error) = packed.save(path) {
                    log::warn!("failed to save packed octree to {}: {error}", path.display());
                }
                packed
            }
        };
        Self::from_packed(packed, config)
    }

    fn empty(layout: Layout, root: NodeInfo, max_depth: u32, config: StoreConfig) -> Self {
        Self {
            layout,
            chunk_shift: config.chunk_shift,
            root,
            max_depth,
            chunks: Vec::new(),
            arena: BlockAllocator::new(
                1 << GRANULE_SHIFT,
                config.initial_arena_shift - GRANULE_SHIFT,
                config.max_arena_shift - GRANULE_SHIFT,
            ),
            clock: 0,
            stats: StoreStats::default(),
        }
    }

    pub fn chunk_shift(&self) -> u32 {
        self.chunk_shift
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_info(&self, chunk: usize) -> Option<ChunkInfo> {
        self.chunks.get(chunk).copied()
    }

    /// Whether chunks are paged in from packed data and can be evicted.
    pub fn is_packed(&self) -> bool {
        matches!(self.layout, Layout::Packed(_))
    }

    pub fn resident_chunks(&self) -> usize {
        self.chunks.iter().filter(|chunk| chunk.is_resident()).count()
    }

    /// The number of nodes the arena can currently hold.
    pub fn arena_capacity(&self) -> usize {
        self.arena.capacity()
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    /// The current frame.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Starts a new frame for the purpose of [`ChunkedOctreeStore::evict_idle`].
    pub fn advance_clock(&mut self) {
        self.clock += 1;
    }

    /// Decodes a chunk without making it resident.
    pub fn decode_chunk(&self, chunk: usize) -> Result<Vec<NodeInfo>, StoreError> {
        match &self.layout {
            Layout::Blocks => {
                let info = self
                    .chunks
                    .get(chunk)
                    .ok_or(StoreError::Corrupt("chunk index out of range"))?;
                let offset = info
                    .allocator_offset
                    .ok_or(StoreError::Corrupt("pinned chunk is not resident"))?;
                Ok(self.arena.slice(offset, info.len as usize).to_vec())
            }
            Layout::Packed(packed) => packed.decode_chunk(chunk),
        }
    }

    /// Makes sure a chunk is resident, evicting the least recently used ones if the arena is full.
    ///
    /// Returns the arena offset of the chunk.
    pub fn ensure_resident(&mut self, chunk: usize) -> Result<u32, StoreError> {
        let clock = self.clock;
        let info = self
            .chunks
            .get_mut(chunk)
            .ok_or(StoreError::Corrupt("chunk index out of range"))?;
        info.last_access_time = clock;
        if let Some(offset) = info.allocator_offset {
            return Ok(offset);
        }

        let nodes = self.decode_chunk(chunk)?;
        let offset = self.allocate_evicting(nodes.len(), chunk)?;
        self.arena
            .slice_mut(offset, nodes.len())
            .copy_from_slice(&nodes);
        self.chunks[chunk] = ChunkInfo {
            allocator_offset: Some(offset),
            last_access_time: clock,
            len: nodes.len() as u32,
        };
        self.stats.chunks_decoded += 1;
        log::trace!("chunk {chunk} resident at {offset}");
        Ok(offset)
    }

    fn allocate_evicting(&mut self, len: usize, loading: usize) -> Result<u32, StoreError> {
        loop {
            match self.arena.allocate(len) {
                Ok(offset) => return Ok(offset),
                Err(error @ AllocError::OutOfCapacity { .. }) => {
                    let victim = self
                        .chunks
                        .iter()
                        .enumerate()
                        .filter(|&(chunk, info)| chunk != loading && info.is_resident())
                        .min_by_key(|(_, info)| info.last_access_time)
                        .map(|(chunk, _)| chunk);
                    match victim {
                        Some(victim) if self.evict(victim) => {}
                        _ => return Err(error.into()),
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Releases the arena range of a packed chunk.
    ///
    /// Returns `false` if the chunk was not resident or is pinned.
    pub fn evict(&mut self, chunk: usize) -> bool {
        if !self.is_packed() {
            return false;
        }
        let Some(offset) = self.chunks.get(chunk).and_then(|info| info.allocator_offset) else {
            return false;
        };
        let released = self.arena.deallocate(offset);
        debug_assert!(released, "resident chunk should own its arena range");
        self.chunks[chunk].allocator_offset = None;
        self.stats.chunks_evicted += 1;
        log::trace!("evicted chunk {chunk}");
        true
    }

    /// Evicts every chunk that has not been accessed for more than `max_idle` frames.
    pub fn evict_idle(&mut self, max_idle: u64) -> usize {
        let idle = (0..self.chunks.len())
            .filter(|&chunk| {
                let info = self.chunks[chunk];
                info.is_resident() && self.clock - info.last_access_time > max_idle
            })
            .collect::<Vec<_>>();
        let evicted = idle.into_iter().filter(|&chunk| self.evict(chunk)).count();
        if evicted > 0 {
            log::debug!("evicted {evicted} idle chunks");
        }
        evicted
    }

    /// Rebuilds a [`LinearOctree`] with breadth-first block numbering.
    pub fn to_linear(&mut self) -> Result<LinearOctree, StoreError> {
        let mut nodes = Vec::new();
        let mut pending = VecDeque::new();
        let mut next_block = 0;
        let root = self.entry_for(self.root, &mut next_block, &mut pending);

        while let Some(parent) = pending.pop_front() {
            let children = self.load_children(parent)?;
            for child in children {
                let entry = self.entry_for(child, &mut next_block, &mut pending);
                nodes.push(entry);
            }
        }

        Ok(LinearOctree::new(root, nodes, self.max_depth))
    }

    fn entry_for(
        &self,
        info: NodeInfo,
        next_block: &mut u32,
        pending: &mut VecDeque<NodeInfo>,
    ) -> NodeEntry {
        if info.is_self_reference() {
            NodeEntry::fractal(info.mask, info.color)
        } else if info.has_children() {
            let block = *next_block;
            *next_block += 1;
            pending.push_back(info);
            NodeEntry::parent(block, info.mask, info.color)
        } else {
            NodeEntry::leaf(info.color)
        }
    }
}

impl NodeSource for ChunkedOctreeStore {
    type Error = StoreError;

    fn root(&self) -> NodeInfo {
        self.root
    }

    fn max_depth(&self) -> u32 {
        self.max_depth
    }

    fn load_children(&mut self, parent: NodeInfo) -> Result<[NodeInfo; 8], StoreError> {
        if !parent.has_children() {
            return Ok([NodeInfo::EMPTY; 8]);
        }

        let chunk = (parent.address >> self.chunk_shift) as usize;
        let offset_in_chunk = parent.address & ((1 << self.chunk_shift) - 1);
        let count = match self.layout {
            Layout::Blocks => 8,
            Layout::Packed(_) => parent.mask.count_ones(),
        };

        let base = self.ensure_resident(chunk)?;
        if offset_in_chunk + count > self.chunks[chunk].len {
            return Err(StoreError::Corrupt("sibling group exceeds its chunk"));
        }
        let group = self.arena.slice(base + offset_in_chunk, count as usize);

        let mut children = [NodeInfo::EMPTY; 8];
        match self.layout {
            Layout::Blocks => {
                for (octant, child) in children.iter_mut().enumerate() {
                    if parent.mask & (1 << octant) != 0 {
                        *child = group[octant];
                    }
                }
            }
            Layout::Packed(_) => {
                let present = (0..8).filter(|octant| parent.mask & (1 << octant) != 0);
                for (octant, &child) in present.zip(group) {
                    children[octant] = child;
                }
            }
        }
        Ok(children)
    }

    fn begin_frame(&mut self) {
        self.advance_clock();
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use itertools::Itertools;

    use super::{pack::tests::sample_octree, *};
    use crate::octree::{NodeChildren, Rgb8};

    fn node_summary(octree: &LinearOctree) -> Vec<(u32, u8, Rgb8, bool)> {
        octree
            .nodes()
            .map(|node| {
                (
                    node.level,
                    node.entry.mask(),
                    node.entry.color(),
                    node.entry.children() == NodeChildren::SelfReference,
                )
            })
            .collect_vec()
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("octosplat-{}-{name}", std::process::id()))
    }

    #[test]
    fn clamp_config() {
        let config = StoreConfig {
            chunk_shift: 40,
            compress: false,
            initial_arena_shift: 0,
            max_arena_shift: 2,
        }
        .clamped();
        assert_eq!(config.chunk_shift, StoreConfig::MAX_CHUNK_SHIFT);
        assert_eq!(config.max_arena_shift, StoreConfig::MAX_CHUNK_SHIFT);
        assert_eq!(config.initial_arena_shift, GRANULE_SHIFT);
        assert_eq!(StoreConfig::default().clamped(), StoreConfig::default());
    }

    #[test]
    fn packed_round_trip() {
        let octree = sample_octree(4);
        for compress in [false, true] {
            let config = StoreConfig {
                chunk_shift: 5,
                compress,
                ..StoreConfig::default()
            };
            let mut store = ChunkedOctreeStore::pack(&octree, config);
            assert!(store.chunk_count() > 1);
            assert_eq!(store.resident_chunks(), 0);
            let rebuilt = store.to_linear().unwrap();
            assert_eq!(node_summary(&rebuilt), node_summary(&octree));
            assert_eq!(rebuilt.fingerprint(), octree.fingerprint());
        }
    }

    #[test]
    fn linear_round_trip() {
        let octree = sample_octree(3);
        let mut store = ChunkedOctreeStore::from_linear(&octree, StoreConfig::default()).unwrap();
        assert!(!store.is_packed());
        assert_eq!(store.resident_chunks(), store.chunk_count());
        assert_eq!(store.to_linear().unwrap(), octree);
        assert!(!store.evict(0));
    }

    #[test]
    fn self_reference_round_trip() {
        let color = Rgb8::new(4, 5, 6);
        let mut nodes = vec![NodeEntry::EMPTY; 8];
        nodes[0] = NodeEntry::fractal(0b1000_0001, color);
        nodes[7] = NodeEntry::leaf(Rgb8::WHITE);
        let octree = LinearOctree::new(NodeEntry::parent(0, 0b1000_0001, color), nodes, 4);

        let mut store = ChunkedOctreeStore::pack(&octree, StoreConfig::default());
        let children = store.load_children(store.root()).unwrap();
        assert!(children[0].is_self_reference());
        assert_eq!(children[7].color, Rgb8::WHITE);
        assert_eq!(children[3], NodeInfo::EMPTY);
        assert_eq!(store.to_linear().unwrap(), octree);
    }

    #[test]
    fn decoding_twice_matches() {
        let store = ChunkedOctreeStore::pack(&sample_octree(4), StoreConfig {
            chunk_shift: 4,
            ..StoreConfig::default()
        });
        for chunk in 0..store.chunk_count() {
            assert_eq!(store.decode_chunk(chunk).unwrap(), store.decode_chunk(chunk).unwrap());
        }
    }

    #[test]
    fn idle_chunks_are_evicted() {
        let octree = sample_octree(4);
        let mut store = ChunkedOctreeStore::pack(&octree, StoreConfig {
            chunk_shift: 4,
            ..StoreConfig::default()
        });
        store.ensure_resident(0).unwrap();
        store.advance_clock();
        store.advance_clock();
        store.ensure_resident(1).unwrap();
        assert_eq!(store.resident_chunks(), 2);

        assert_eq!(store.evict_idle(1), 1);
        assert!(!store.chunk_info(0).unwrap().is_resident());
        assert!(store.chunk_info(1).unwrap().is_resident());

        // evicted chunks come back unchanged
        let before = store.decode_chunk(0).unwrap();
        let offset = store.ensure_resident(0).unwrap();
        assert_eq!(store.arena.slice(offset, before.len()), before.as_slice());
        assert_eq!(store.stats().chunks_decoded, 3);
        assert_eq!(store.stats().chunks_evicted, 1);
    }

    #[test]
    fn full_arena_evicts_least_recent() {
        let octree = sample_octree(4);
        let config = StoreConfig {
            chunk_shift: 4,
            compress: false,
            initial_arena_shift: 5,
            max_arena_shift: 5,
        };
        let mut store = ChunkedOctreeStore::pack(&octree, config);
        assert!(store.chunk_count() > 3);

        // two full chunks fill the arena
        for chunk in 0..3 {
            store.ensure_resident(chunk).unwrap();
            store.advance_clock();
        }
        assert!(store.resident_chunks() <= 2);
        assert!(!store.chunk_info(0).unwrap().is_resident());
        assert!(store.chunk_info(2).unwrap().is_resident());

        // rendering everything still works with a tiny arena
        let rebuilt = store.to_linear().unwrap();
        assert_eq!(node_summary(&rebuilt), node_summary(&octree));
    }

    #[test]
    fn corrupt_chunk_is_reported_not_resident() {
        let mut bytes = Vec::new();
        PackedOctree::build(&sample_octree(3), 4, false)
            .write_to(&mut bytes)
            .unwrap();
        bytes[40..44].copy_from_slice(&u32::MAX.to_le_bytes());
        let packed = PackedOctree::read_from(bytes.as_slice()).unwrap();

        let mut store = ChunkedOctreeStore::from_packed(packed, StoreConfig {
            chunk_shift: 4,
            compress: false,
            ..StoreConfig::default()
        });
        assert!(matches!(store.load_children(store.root()), Err(StoreError::Corrupt(_))));
        assert_eq!(store.resident_chunks(), 0);
    }

    #[test]
    fn open_or_pack_repacks_stale_files() {
        let octree = sample_octree(3);
        let config = StoreConfig::default();
        let path = temp_path("stale.ospk");

        fs::write(&path, b"garbage").unwrap();
        let mut store = ChunkedOctreeStore::open_or_pack(&path, &octree, config);
        assert_eq!(node_summary(&store.to_linear().unwrap()), node_summary(&octree));
        let written = PackedOctree::load(&path).unwrap();
        assert!(written.matches(&octree, &config));

        // a different octree invalidates the file
        let other = sample_octree(4);
        let mut store = ChunkedOctreeStore::open_or_pack(&path, &other, config);
        assert_eq!(node_summary(&store.to_linear().unwrap()), node_summary(&other));
        assert!(PackedOctree::load(&path).unwrap().matches(&other, &config));

        fs::remove_file(&path).unwrap();
    }
}
