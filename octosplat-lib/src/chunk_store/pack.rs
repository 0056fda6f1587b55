//! The packed, optionally compressed form of an octree.
//!
//! Nodes are grouped by parent and the groups are laid out breadth-first in a decoded slot space
//! that is cut into chunks of `1 << chunk_shift` slots. A group never straddles two chunks; if it
//! does not fit into the remainder of the current chunk, it starts the next one.
//!
//! Only masks and colors are stored. Child addresses are recovered while decoding a chunk by
//! placing one group per parent, in order, starting from the cursor recorded in the chunk header.

use std::{
    borrow::Cow,
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use bitvec::{order::Lsb0, slice::BitSlice, vec::BitVec};

use super::{StoreConfig, StoreError};
use crate::octree::{LinearOctree, NodeChildren, NodeEntry, NodeInfo, Rgb8};

const PACKED_MAGIC: &[u8; 4] = b"OSPK";
const PACKED_VERSION: u32 = 1;

const FLAG_COMPRESSED: u32 = 1;

/// Places sibling groups into the decoded slot space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildCursor {
    position: u32,
    chunk_shift: u32,
}

impl ChildCursor {
    pub fn new(position: u32, chunk_shift: u32) -> Self {
        Self {
            position,
            chunk_shift,
        }
    }

    /// The slot at which the next group starts, unless it has to roll over.
    pub fn position(self) -> u32 {
        self.position
    }

    /// Reserves `count` consecutive slots within one chunk and returns the first one.
    ///
    /// Returns [`None`] if the slots would run past the end of the `u32` slot space.
    pub fn place(&mut self, count: u32) -> Option<u32> {
        let chunk_mask = (1 << self.chunk_shift) - 1;
        let mut start = self.position;
        if (start & chunk_mask) + count > chunk_mask + 1 {
            // wraps to zero past the last chunk
            start = ((start >> self.chunk_shift) + 1) << self.chunk_shift;
            if start == 0 {
                return None;
            }
        }
        self.position = start.checked_add(count)?;
        Some(start)
    }
}

/// Describes where a chunk is found in the blob of a [`PackedOctree`].
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct ChunkHeader {
    /// The child cursor before the first node of the chunk places its children.
    pub start_offset: u32,
    pub byte_start: u32,
    pub byte_len: u32,
    pub node_count: u32,
}

impl ChunkHeader {
    /// The size of the chunk after decompression.
    fn raw_len(self) -> usize {
        let count = self.node_count as usize;
        count * 4 + count.div_ceil(8)
    }
}

/// An octree in packed chunk form, ready to be paged in by a
/// [`ChunkedOctreeStore`](super::ChunkedOctreeStore).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedOctree {
    chunk_shift: u32,
    compressed: bool,
    /// The [`LinearOctree::fingerprint`] of the source.
    fingerprint: u64,
    max_depth: u32,
    root: NodeInfo,
    headers: Vec<ChunkHeader>,
    blob: Vec<u8>,
}

impl PackedOctree {
    /// Packs `octree` into chunks of `1 << chunk_shift` slots, optionally LZ4-compressing each.
    ///
    /// `chunk_shift` is clamped the same way as [`StoreConfig::chunk_shift`].
    pub fn build(octree: &LinearOctree, chunk_shift: u32, compress: bool) -> Self {
        let chunk_shift = chunk_shift.clamp(StoreConfig::MIN_CHUNK_SHIFT, StoreConfig::MAX_CHUNK_SHIFT);
        let mut cursor = ChildCursor::new(0, chunk_shift);
        let mut chunks = Vec::new();

        let root = octree.root();
        let root_address = match root.children() {
            NodeChildren::Leaf => 0,
            NodeChildren::Block(_) => place_group(octree, root, &mut cursor, &mut chunks),
            NodeChildren::SelfReference => NodeInfo::SELF_REFERENCE,
        };

        let mut start_offsets = Vec::new();
        let mut chunk = 0;
        while chunk < chunks.len() {
            start_offsets.push(cursor.position());
            let mut index = 0;
            while index < chunks[chunk].len() {
                let node = chunks[chunk][index];
                if matches!(node.children(), NodeChildren::Block(_)) {
                    place_group(octree, node, &mut cursor, &mut chunks);
                }
                index += 1;
            }
            chunk += 1;
        }

        let mut headers = Vec::with_capacity(chunks.len());
        let mut blob = Vec::new();
        for (nodes, start_offset) in chunks.iter().zip(start_offsets) {
            let raw = encode_chunk(nodes);
            let bytes = if compress {
                lz4_flex::block::compress(&raw)
            } else {
                raw
            };
            headers.push(ChunkHeader {
                start_offset,
                byte_start: blob.len() as u32,
                byte_len: bytes.len() as u32,
                node_count: nodes.len() as u32,
            });
            blob.extend_from_slice(&bytes);
        }

        log::info!(
            "packed {} nodes into {} chunks, {} bytes{}",
            chunks.iter().map(Vec::len).sum::<usize>(),
            headers.len(),
            blob.len(),
            if compress { " compressed" } else { "" }
        );

        Self {
            chunk_shift,
            compressed: compress,
            fingerprint: octree.fingerprint(),
            max_depth: octree.max_depth(),
            root: NodeInfo {
                address: root_address,
                mask: root.mask(),
                color: root.color(),
            },
            headers,
            blob,
        }
    }

    pub fn chunk_shift(&self) -> u32 {
        self.chunk_shift
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn root(&self) -> NodeInfo {
        self.root
    }

    pub fn headers(&self) -> &[ChunkHeader] {
        &self.headers
    }

    pub fn chunk_count(&self) -> usize {
        self.headers.len()
    }

    /// The total size of all chunk data.
    pub fn blob_len(&self) -> usize {
        self.blob.len()
    }

    /// Whether this was packed from `octree` with the settings of `config`.
    pub fn matches(&self, octree: &LinearOctree, config: &StoreConfig) -> bool {
        self.fingerprint == octree.fingerprint()
            && self.chunk_shift == config.chunk_shift
            && self.compressed == config.compress
    }

    /// Decodes all nodes of a chunk, deriving child addresses from the masks.
    pub fn decode_chunk(&self, chunk: usize) -> Result<Vec<NodeInfo>, StoreError> {
        let header = *self
            .headers
            .get(chunk)
            .ok_or(StoreError::Corrupt("chunk index out of range"))?;
        let start = header.byte_start as usize;
        let bytes = self
            .blob
            .get(start..start + header.byte_len as usize)
            .ok_or(StoreError::Corrupt("chunk bytes out of range"))?;
        let raw_len = header.raw_len();
        let raw = if self.compressed {
            Cow::Owned(lz4_flex::block::decompress(bytes, raw_len)?)
        } else {
            Cow::Borrowed(bytes)
        };
        if raw.len() != raw_len {
            return Err(StoreError::Corrupt("chunk size does not match its node count"));
        }

        let count = header.node_count as usize;
        let (masks, rest) = raw.split_at(count);
        let (colors, flags) = rest.split_at(count * 3);
        let self_references = BitSlice::<u8, Lsb0>::from_slice(flags);

        let mut cursor = ChildCursor::new(header.start_offset, self.chunk_shift);
        masks
            .iter()
            .zip(colors.chunks_exact(3))
            .zip(self_references)
            .map(|((&mask, color), self_reference)| {
                let address = if mask == 0 {
                    0
                } else if *self_reference {
                    NodeInfo::SELF_REFERENCE
                } else {
                    cursor
                        .place(mask.count_ones())
                        .ok_or(StoreError::Corrupt("child slots run past the address space"))?
                };
                Ok(NodeInfo {
                    address,
                    mask,
                    color: Rgb8::new(color[0], color[1], color[2]),
                })
            })
            .collect()
    }

    /// Writes the packed octree to `writer`.
    pub fn write_to(&self, mut writer: impl Write) -> Result<(), StoreError> {
        writer.write_all(PACKED_MAGIC)?;
        writer.write_all(&PACKED_VERSION.to_le_bytes())?;
        writer.write_all(&self.chunk_shift.to_le_bytes())?;
        let flags = if self.compressed { FLAG_COMPRESSED } else { 0 };
        writer.write_all(&flags.to_le_bytes())?;
        writer.write_all(&self.fingerprint.to_le_bytes())?;
        writer.write_all(&self.max_depth.to_le_bytes())?;

        writer.write_all(&[self.root.mask])?;
        writer.write_all(&self.root.color.to_array())?;
        writer.write_all(&[u8::from(self.root.is_self_reference()), 0, 0, 0])?;

        writer.write_all(&(self.headers.len() as u32).to_le_bytes())?;
        for header in &self.headers {
            for field in [
                header.start_offset,
                header.byte_start,
                header.byte_len,
                header.node_count,
            ] {
                writer.write_all(&field.to_le_bytes())?;
            }
        }
        writer.write_all(&(self.blob.len() as u64).to_le_bytes())?;
        writer.write_all(&self.blob)?;
        writer.flush()?;
        Ok(())
    }

    /// Reads a packed octree from `reader`, validating its structure.
    pub fn read_from(mut reader: impl Read) -> Result<Self, StoreError> {
        let mut magic = [0; 4];
        reader.read_exact(&mut magic)?;
        if &magic != PACKED_MAGIC {
            return Err(StoreError::BadMagic);
        }
        let version = read_u32(&mut reader)?;
        if version != PACKED_VERSION {
            return Err(StoreError::UnsupportedVersion(version));
        }

        let chunk_shift = read_u32(&mut reader)?;
        if !(StoreConfig::MIN_CHUNK_SHIFT..=StoreConfig::MAX_CHUNK_SHIFT).contains(&chunk_shift) {
            return Err(StoreError::Corrupt("chunk shift out of range"));
        }
        let compressed = read_u32(&mut reader)? & FLAG_COMPRESSED != 0;
        let fingerprint = read_u64(&mut reader)?;
        let max_depth = read_u32(&mut reader)?;

        let mut root = [0; 8];
        reader.read_exact(&mut root)?;
        let root = NodeInfo {
            address: if root[4] != 0 && root[0] != 0 {
                NodeInfo::SELF_REFERENCE
            } else {
                0
            },
            mask: root[0],
            color: Rgb8::new(root[1], root[2], root[3]),
        };

        let chunk_count = read_u32(&mut reader)?;
        let mut headers = Vec::new();
        for _ in 0..chunk_count {
            headers.push(ChunkHeader {
                start_offset: read_u32(&mut reader)?,
                byte_start: read_u32(&mut reader)?,
                byte_len: read_u32(&mut reader)?,
                node_count: read_u32(&mut reader)?,
            });
        }

        let blob_len = read_u64(&mut reader)?;
        let mut blob = Vec::new();
        reader.take(blob_len).read_to_end(&mut blob)?;
        if blob.len() as u64 != blob_len {
            return Err(StoreError::Corrupt("blob is truncated"));
        }

        let chunk_size = 1 << chunk_shift;
        for header in &headers {
            let end = header.byte_start as u64 + header.byte_len as u64;
            if end > blob_len {
                return Err(StoreError::Corrupt("chunk bytes out of range"));
            }
            if header.node_count > chunk_size {
                return Err(StoreError::Corrupt("chunk holds too many nodes"));
            }
        }

        Ok(Self {
            chunk_shift,
            compressed,
            fingerprint,
            max_depth,
            root,
            headers,
            blob,
        })
    }

    /// Reads a packed octree file from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::read_from(BufReader::new(File::open(path)?))
    }

    /// Writes a packed octree file to `path`, replacing any existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        self.write_to(BufWriter::new(File::create(path)?))
    }
}

/// Places the present children of `parent` and appends them to the chunk they land in.
fn place_group(
    octree: &LinearOctree,
    parent: NodeEntry,
    cursor: &mut ChildCursor,
    chunks: &mut Vec<Vec<NodeEntry>>,
) -> u32 {
    let Some(children) = octree.children(parent) else {
        return 0;
    };
    let start = cursor
        .place(parent.mask().count_ones())
        .expect("packed slots should stay addressable like the linear slots they come from");
    let chunk = (start >> cursor.chunk_shift) as usize;
    if chunks.len() <= chunk {
        chunks.resize_with(chunk + 1, Vec::new);
    }
    chunks[chunk].extend(present_children(parent, children));
    start
}

fn present_children(
    parent: NodeEntry,
    children: &[NodeEntry; 8],
) -> impl Iterator<Item = NodeEntry> + '_ {
    parent
        .octants()
        .iter()
        .map(move |corner| children[corner.index() as usize])
}

/// Masks, then colors, then one self-reference bit per node.
fn encode_chunk(nodes: &[NodeEntry]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(nodes.len() * 4 + nodes.len().div_ceil(8));
    raw.extend(nodes.iter().map(|node| node.mask()));
    raw.extend(nodes.iter().flat_map(|node| node.color().to_array()));
    let self_references: BitVec<u8, Lsb0> = nodes
        .iter()
        .map(|node| node.children() == NodeChildren::SelfReference)
        .collect();
    raw.extend_from_slice(self_references.as_raw_slice());
    raw
}

fn read_u32(reader: &mut impl Read) -> std::io::Result<u32> {
    let mut bytes = [0; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(reader: &mut impl Read) -> std::io::Result<u64> {
    let mut bytes = [0; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}
