//! Reading and writing the flat octree file format.
//!
//! All values are little endian:
//!
//! - `block_count: i32`, `max_depth: i32`
//! - the root record
//! - `block_count * 8` node records
//!
//! Each record is an `i32` holding the child block index in its upper 24 bits and the child mask in
//! its lowest 8 bits, followed by three color bytes and one byte of padding.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use bytemuck::{Pod, Zeroable};

use super::{LinearOctree, NodeChildren, NodeEntry, OctreeError, Rgb8};

/// The block index that marks a self-referencing node.
const SELF_REFERENCE_ADDRESS: u32 = 0xFF_FFFF;

const HEADER_LEN: usize = 16;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Record {
    packed: [u8; 4],
    color: Rgb8,
    padding: u8,
}

impl Record {
    /// Decodes the record as an entry stored in block `containing_block`.
    fn decode(self, containing_block: Option<u32>) -> NodeEntry {
        let packed = u32::from_le_bytes(self.packed);
        let mask = packed as u8;
        let address = packed >> 8;
        if address == SELF_REFERENCE_ADDRESS || Some(address) == containing_block {
            NodeEntry::fractal(mask, self.color)
        } else {
            NodeEntry::parent(address, mask, self.color)
        }
    }

    fn encode(entry: NodeEntry) -> Result<Self, OctreeError> {
        let address = match entry.children() {
            NodeChildren::Leaf => 0,
            NodeChildren::Block(block) if block < SELF_REFERENCE_ADDRESS => block,
            NodeChildren::Block(block) => return Err(OctreeError::AddressOutOfRange(block)),
            NodeChildren::SelfReference => SELF_REFERENCE_ADDRESS,
        };
        Ok(Self {
            packed: (address << 8 | entry.mask() as u32).to_le_bytes(),
            color: entry.color(),
            padding: 0,
        })
    }
}

impl LinearOctree {
    /// Reads an octree from the flat file format and sanitizes it.
    pub fn read_from(mut reader: impl Read) -> Result<Self, OctreeError> {
        let mut header = [0; HEADER_LEN];
        read_exact_or_truncated(&mut reader, &mut header)?;
        let field = |index: usize| {
            i32::from_le_bytes(
                header[index * 4..index * 4 + 4]
                    .try_into()
                    .expect("header field should be four bytes"),
            )
        };

        let block_count = u32::try_from(field(0))
            .map_err(|_| OctreeError::InvalidHeader("negative block count"))?;
        let max_depth = u32::try_from(field(1))
            .map_err(|_| OctreeError::InvalidHeader("negative max depth"))?;
        let root = bytemuck::pod_read_unaligned::<Record>(&header[8..]).decode(None);

        let expected = block_count as u64 * 8 * std::mem::size_of::<Record>() as u64;
        let mut bytes = Vec::new();
        reader.take(expected).read_to_end(&mut bytes)?;
        if (bytes.len() as u64) < expected {
            return Err(OctreeError::Truncated {
                expected: HEADER_LEN as u64 + expected,
                actual: (HEADER_LEN + bytes.len()) as u64,
            });
        }

        let records: &[Record] = bytemuck::cast_slice(&bytes);
        let nodes = records
            .iter()
            .enumerate()
            .map(|(slot, record)| record.decode(Some(slot as u32 / 8)))
            .collect();

        Ok(Self::new(root, nodes, max_depth))
    }

    /// Writes the octree in the flat file format.
    pub fn write_to(&self, mut writer: impl Write) -> Result<(), OctreeError> {
        let block_count = i32::try_from(self.block_count())
            .map_err(|_| OctreeError::AddressOutOfRange(u32::MAX))?;
        writer.write_all(&block_count.to_le_bytes())?;
        writer.write_all(&(self.max_depth as i32).to_le_bytes())?;
        writer.write_all(bytemuck::bytes_of(&Record::encode(self.root)?))?;
        for &entry in &self.nodes {
            writer.write_all(bytemuck::bytes_of(&Record::encode(entry)?))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads an octree file from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OctreeError> {
        Self::read_from(BufReader::new(File::open(path)?))
    }

    /// Writes an octree file to `path`, replacing any existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), OctreeError> {
        self.write_to(BufWriter::new(File::create(path)?))
    }
}

fn read_exact_or_truncated(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), OctreeError> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => {
                return Err(OctreeError::Truncated {
                    expected: buf.len() as u64,
                    actual: read as u64,
                })
            }
            Ok(len) => read += len,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLUE: Rgb8 = Rgb8::new(0, 0, 200);
    const GRAY: Rgb8 = Rgb8::new(90, 90, 90);

    fn sample() -> LinearOctree {
        let mut nodes = vec![NodeEntry::EMPTY; 16];
        nodes[3] = NodeEntry::parent(1, 0b0001_0000, GRAY);
        nodes[4] = NodeEntry::fractal(0b1001_1001, BLUE);
        nodes[12] = NodeEntry::leaf(BLUE);
        LinearOctree::new(NodeEntry::parent(0, 0b0001_1000, GRAY), nodes, 3)
    }

    #[test]
    fn write_then_read() {
        let octree = sample();
        let mut bytes = Vec::new();
        octree.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 16 * 8);
        assert_eq!(&bytes[..4], &2i32.to_le_bytes());

        let read = LinearOctree::read_from(bytes.as_slice()).unwrap();
        assert_eq!(read, octree);
        assert_eq!(read.slots()[4].children(), NodeChildren::SelfReference);
    }

    #[test]
    fn record_layout() {
        let record = Record::encode(NodeEntry::parent(0x01_0203, 0xA5, BLUE)).unwrap();
        assert_eq!(
            bytemuck::bytes_of(&record),
            &[0xA5, 0x03, 0x02, 0x01, 0, 0, 200, 0]
        );
    }

    #[test]
    fn own_block_reads_as_self_reference() {
        let mut bytes = Vec::new();
        sample().write_to(&mut bytes).unwrap();
        // slot 12 lives in block 1, let it point at block 1
        let offset = HEADER_LEN + 12 * 8;
        bytes[offset..offset + 4].copy_from_slice(&(1u32 << 8 | 0b1).to_le_bytes());

        let read = LinearOctree::read_from(bytes.as_slice()).unwrap();
        assert_eq!(read.slots()[12].children(), NodeChildren::SelfReference);
        assert_eq!(read.slots()[12].color(), BLUE);
    }

    #[test]
    fn zero_address_is_sanitized() {
        let mut bytes = Vec::new();
        sample().write_to(&mut bytes).unwrap();
        let offset = HEADER_LEN + 12 * 8;
        bytes[offset..offset + 4].copy_from_slice(&0b1u32.to_le_bytes());

        let read = LinearOctree::read_from(bytes.as_slice()).unwrap();
        assert_eq!(read.slots()[12], NodeEntry::leaf(BLUE));
    }

    #[test]
    fn truncated_input() {
        let mut bytes = Vec::new();
        sample().write_to(&mut bytes).unwrap();
        bytes.truncate(HEADER_LEN + 20);
        assert!(matches!(
            LinearOctree::read_from(bytes.as_slice()),
            Err(OctreeError::Truncated { .. })
        ));
        assert!(matches!(
            LinearOctree::read_from(&bytes[..7]),
            Err(OctreeError::Truncated {
                expected: 16,
                actual: 7
            })
        ));
    }

    #[test]
    fn negative_block_count() {
        let mut bytes = Vec::new();
        sample().write_to(&mut bytes).unwrap();
        bytes[..4].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(
            LinearOctree::read_from(bytes.as_slice()),
            Err(OctreeError::InvalidHeader(_))
        ));
    }
}
