use arrayvec::ArrayVec;
use derive_where::derive_where;
use thiserror::Error;

/// Marks a tree node whose whole range is allocated.
const ALLOCATED: u32 = 1 << 31;

/// The availability of a completely free node at the given height.
///
/// A node that is partially allocated instead holds the sizes of its maximal free ranges, bit `s`
/// standing for a range of `2^s` blocks whose sibling is not free as well. Since only a free node
/// has bit `height` set, both cases fit into one value.
const fn full(height: u32) -> u32 {
    1 << height
}

const fn available(value: u32) -> u32 {
    if value & ALLOCATED != 0 {
        0
    } else {
        value
    }
}

/// The value of a node at `height` given the values of its two children.
const fn combine(height: u32, left: u32, right: u32) -> u32 {
    let child = full(height - 1);
    if left == child && right == child {
        full(height)
    } else {
        available(left) | available(right)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("cannot allocate {size} elements, at most {max} fit")]
    TooLarge { size: usize, max: usize },
    #[error("out of capacity with {capacity} elements")]
    OutOfCapacity { capacity: usize },
}

/// A range of elements within a [`BlockAllocator`].
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct RangeInfo {
    pub allocated: bool,
    pub start: u32,
    pub size: u32,
}

const DEPTH_LIMIT: u32 = 30;

/// A buddy allocator handing out ranges of one growable array.
///
/// Ranges are always `block_size * 2^k` elements large and aligned to their size. Occupancy is
/// tracked in a complete binary tree stored in heap order, i.e. the children of node `i` are at
/// `2 * i + 1` and `2 * i + 2`. Nodes at height `0` cover a single block.
///
/// Each tree node stores either [`ALLOCATED`] or a bit set of the sizes of the maximal free ranges
/// within it, which makes finding the tightest free range a single walk from the root.
///
/// Capacity starts at `block_size << initial_depth` elements and doubles whenever an allocation does
/// not fit, until `block_size << max_depth` is reached. Existing addresses stay valid when growing.
#[derive(Clone, Debug)]
pub struct BlockAllocator<T> {
    data: Vec<T>,
    tree: Vec<u32>,
    block_size: usize,
    depth: u32,
    max_depth: u32,
}

impl<T: Clone + Default> BlockAllocator<T> {
    /// The hard limit for `max_depth`.
    pub const MAX_DEPTH: u32 = DEPTH_LIMIT;

    /// Constructs an empty [`BlockAllocator`].
    ///
    /// `initial_depth` is clamped to `max_depth`.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero, `max_depth` exceeds [`Self::MAX_DEPTH`] or the maximum
    /// capacity does not fit into a [`u32`].
    pub fn new(block_size: usize, initial_depth: u32, max_depth: u32) -> Self {
        assert!(block_size > 0, "block size should not be zero");
        assert!(max_depth <= Self::MAX_DEPTH, "max depth should not exceed 30");
        assert!(
            (block_size as u64) << max_depth <= u32::MAX as u64,
            "max capacity should fit into u32"
        );

        let depth = initial_depth.min(max_depth);
        let mut allocator = Self {
            data: Vec::new(),
            tree: Vec::new(),
            block_size,
            depth,
            max_depth,
        };
        allocator.tree = (0..=depth)
            .flat_map(|level| std::iter::repeat_n(full(depth - level), 1 << level))
            .collect();
        allocator.data.resize(allocator.capacity(), T::default());
        allocator
    }

    /// Allocates a range of at least `size` elements and returns its address.
    ///
    /// Uses the smallest free range that fits, growing the backing storage if necessary.
    pub fn allocate(&mut self, size: usize) -> Result<u32, AllocError> {
        let blocks = size.div_ceil(self.block_size).max(1);
        let level = blocks.next_power_of_two().trailing_zeros();
        if level > self.max_depth {
            return Err(AllocError::TooLarge {
                size,
                max: self.block_size << self.max_depth,
            });
        }

        loop {
            if let Some(address) = self.try_allocate(level) {
                return Ok(address);
            }
            if self.depth == self.max_depth {
                return Err(AllocError::OutOfCapacity {
                    capacity: self.capacity(),
                });
            }
            self.grow();
        }
    }

    /// Frees the range starting at `address`.
    ///
    /// Returns `false` if no allocated range starts at `address`.
    pub fn deallocate(&mut self, address: u32) -> bool {
        let Some(block) = self.block_of(address) else {
            return false;
        };
        if block * self.block_size != address as usize {
            return false;
        }

        let mut index = 0;
        let mut height = self.depth;
        loop {
            let value = self.tree[index];
            if value == ALLOCATED {
                let start = (index + 1 - (1 << (self.depth - height))) << height;
                if start != block {
                    return false;
                }
                self.tree[index] = full(height);
                self.propagate(index, height);
                return true;
            }
            if value == full(height) || height == 0 {
                return false;
            }
            height -= 1;
            index = 2 * index + 1 + (block >> height & 1);
        }
    }

    /// Returns the range containing `address`.
    ///
    /// Free ranges are reported as the largest aligned free range containing `address`. Returns
    /// [`None`] if `address` lies outside of the current capacity.
    pub fn is_allocated(&self, address: u32) -> Option<RangeInfo> {
        let block = self.block_of(address)?;
        let mut index = 0;
        let mut height = self.depth;
        loop {
            let value = self.tree[index];
            if value == ALLOCATED || value == full(height) {
                return Some(self.range_info(index, height));
            }
            height -= 1;
            index = 2 * index + 1 + (block >> height & 1);
        }
    }

    /// Iterates all allocated and free ranges in order of their address.
    ///
    /// The ranges are disjoint and together cover the full capacity.
    pub fn ranges(&self) -> Ranges<T> {
        let mut pending = ArrayVec::new();
        pending.push((0, self.depth));
        Ranges {
            allocator: self,
            pending,
        }
    }

    /// The allocated elements of the range at `address`.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the capacity.
    pub fn slice(&self, address: u32, len: usize) -> &[T] {
        &self.data[address as usize..address as usize + len]
    }

    /// The allocated elements of the range at `address`.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the capacity.
    pub fn slice_mut(&mut self, address: u32, len: usize) -> &mut [T] {
        &mut self.data[address as usize..address as usize + len]
    }

    /// The number of elements that can currently be allocated without growing.
    pub fn capacity(&self) -> usize {
        self.block_size << self.depth
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The current depth of the occupancy tree; capacity is `block_size << depth`.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Marks a free range of `2^level` blocks as allocated and returns its address.
    fn try_allocate(&mut self, level: u32) -> Option<u32> {
        if level > self.depth {
            return None;
        }
        let fitting = available(self.tree[0]) & !(full(level) - 1);
        if fitting == 0 {
            return None;
        }
        // the smallest free range that is large enough
        let target = fitting.trailing_zeros();

        let mut index = 0;
        let mut height = self.depth;
        while height > target {
            let left = 2 * index + 1;
            index = if available(self.tree[left]) & full(target) != 0 {
                left
            } else {
                left + 1
            };
            height -= 1;
        }
        // split the fitting range down to the requested size
        while height > level {
            index = 2 * index + 1;
            height -= 1;
        }

        self.tree[index] = ALLOCATED;
        self.propagate(index, height);
        let RangeInfo { start, .. } = self.range_info(index, height);
        Some(start)
    }

    /// Updates all ancestors of the node at `index` and `height`.
    fn propagate(&mut self, mut index: usize, mut height: u32) {
        while index > 0 {
            index = (index - 1) / 2;
            height += 1;
            let left = self.tree[2 * index + 1];
            let right = self.tree[2 * index + 2];
            self.tree[index] = combine(height, left, right);
        }
    }

    /// Doubles the capacity, keeping the current tree as the left subtree of a new root.
    fn grow(&mut self) {
        let old_depth = self.depth;
        let depth = old_depth + 1;
        let mut tree = Vec::with_capacity((1 << (depth + 1)) - 1);
        tree.push(0);
        for level in 0..=old_depth {
            let first = (1 << level) - 1;
            tree.extend_from_slice(&self.tree[first..first + (1 << level)]);
            tree.extend(std::iter::repeat_n(full(old_depth - level), 1 << level));
        }
        tree[0] = combine(depth, tree[1], tree[2]);

        self.tree = tree;
        self.depth = depth;
        self.data.resize(self.capacity(), T::default());
        log::debug!(
            "grew block allocator to {} elements ({} blocks)",
            self.capacity(),
            1 << depth
        );
    }

    fn block_of(&self, address: u32) -> Option<usize> {
        let address = address as usize;
        (address < self.capacity()).then_some(address / self.block_size)
    }

    fn range_info(&self, index: usize, height: u32) -> RangeInfo {
        let first_in_level = (1 << (self.depth - height)) - 1;
        let block = (index - first_in_level) << height;
        RangeInfo {
            allocated: self.tree[index] == ALLOCATED,
            start: (block * self.block_size) as u32,
            size: (self.block_size << height) as u32,
        }
    }
}

/// Iterates the ranges of a [`BlockAllocator`].
///
/// Created by [`BlockAllocator::ranges`].
#[derive_where(Clone)]
pub struct Ranges<'a, T> {
    allocator: &'a BlockAllocator<T>,
    /// Tree nodes that still have to be visited, the lowest address on top.
    pending: ArrayVec<(usize, u32), { DEPTH_LIMIT as usize + 2 }>,
}

impl<T: Clone + Default> Iterator for Ranges<'_, T> {
    type Item = RangeInfo;

    fn next(&mut self) -> Option<RangeInfo> {
        loop {
            let (index, height) = self.pending.pop()?;
            let value = self.allocator.tree[index];
            if value == ALLOCATED || value == full(height) {
                return Some(self.allocator.range_info(index, height));
            }
            self.pending.push((2 * index + 2, height - 1));
            self.pending.push((2 * index + 1, height - 1));
        }
    }
}

#[cfg(test)]
mod tests {
    use itertools::{assert_equal, Itertools};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn range(allocated: bool, start: u32, size: u32) -> RangeInfo {
        RangeInfo {
            allocated,
            start,
            size,
        }
    }

    fn assert_partition(allocator: &BlockAllocator<u8>) {
        let mut next = 0;
        for range in allocator.ranges() {
            assert_eq!(range.start, next, "ranges should not have gaps or overlaps");
            assert!(range.size > 0);
            next += range.size;
        }
        assert_eq!(next as usize, allocator.capacity());
    }

    #[test]
    fn allocate_grows_when_full() {
        let mut allocator = BlockAllocator::<u8>::new(1, 2, 8);
        assert_eq!(allocator.allocate(3), Ok(0));
        assert_eq!(allocator.capacity(), 4);
        assert_eq!(allocator.allocate(1), Ok(4));
        assert_eq!(allocator.capacity(), 8);

        assert_equal(
            allocator.ranges(),
            [
                range(true, 0, 4),
                range(true, 4, 1),
                range(false, 5, 1),
                range(false, 6, 2),
            ],
        );
        assert_eq!(
            allocator.ranges().filter(|range| range.allocated).count(),
            2
        );
    }

    #[test]
    fn tightest_fit() {
        let mut allocator = BlockAllocator::<u8>::new(4, 3, 3);
        let a = allocator.allocate(4).unwrap();
        let b = allocator.allocate(8).unwrap();
        let c = allocator.allocate(2).unwrap();
        // `c` fills the hole next to `a` instead of splitting the untouched upper half
        assert_eq!((a, b, c), (0, 8, 4));
        assert_eq!(allocator.allocate(16), Ok(16));
        assert_eq!(
            allocator.allocate(1),
            Err(AllocError::OutOfCapacity { capacity: 32 })
        );
    }

    #[test]
    fn freed_holes_are_reused_before_splitting() {
        let mut allocator = BlockAllocator::<u8>::new(1, 3, 3);
        assert_eq!(allocator.allocate(4), Ok(0));
        assert_eq!(allocator.allocate(1), Ok(4));
        assert!(allocator.deallocate(0));

        // the single free block next to the allocation fits better than the free half
        assert_eq!(allocator.allocate(1), Ok(5));
        assert_eq!(allocator.allocate(4), Ok(0));
        assert_eq!(allocator.allocate(2), Ok(6));
        assert_eq!(
            allocator.allocate(1),
            Err(AllocError::OutOfCapacity { capacity: 8 })
        );
    }

    #[test]
    fn deallocate_requires_range_start() {
        let mut allocator = BlockAllocator::<u8>::new(2, 3, 3);
        let address = allocator.allocate(6).unwrap();
        assert_eq!(address, 0);
        assert!(!allocator.deallocate(2));
        assert!(!allocator.deallocate(1));
        assert!(!allocator.deallocate(8));
        assert!(allocator.deallocate(0));
        assert!(!allocator.deallocate(0));
        assert_equal(allocator.ranges(), [range(false, 0, 16)]);
    }

    #[test]
    fn is_allocated_reports_containing_range() {
        let mut allocator = BlockAllocator::<u8>::new(1, 3, 3);
        allocator.allocate(2).unwrap();
        assert_eq!(allocator.is_allocated(1), Some(range(true, 0, 2)));
        assert_eq!(allocator.is_allocated(2), Some(range(false, 2, 2)));
        assert_eq!(allocator.is_allocated(6), Some(range(false, 4, 4)));
        assert_eq!(allocator.is_allocated(8), None);
    }

    #[test]
    fn too_large() {
        let mut allocator = BlockAllocator::<u8>::new(8, 0, 2);
        assert_eq!(
            allocator.allocate(33),
            Err(AllocError::TooLarge { size: 33, max: 32 })
        );
        assert_eq!(allocator.allocate(32), Ok(0));
        assert_eq!(allocator.depth(), 2);
    }

    #[test]
    fn data_survives_growth() {
        let mut allocator = BlockAllocator::<u32>::new(4, 0, 4);
        let first = allocator.allocate(3).unwrap();
        allocator.slice_mut(first, 3).copy_from_slice(&[7, 8, 9]);
        let second = allocator.allocate(20).unwrap();
        assert_eq!(second, 32);
        assert_eq!(allocator.slice(first, 3), &[7, 8, 9]);
        assert_eq!(allocator.capacity(), 64);
    }

    #[test]
    fn random_sequences_keep_partition() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for block_size in [1, 3, 8] {
            let mut allocator = BlockAllocator::<u8>::new(block_size, 1, 16);
            let mut outstanding = Vec::new();
            for _ in 0..300 {
                if outstanding.is_empty() || rng.random_bool(0.5) {
                    let size = rng.random_range(1..=40);
                    let address = allocator.allocate(size).unwrap();
                    outstanding.push((address, size));
                } else {
                    let index = rng.random_range(0..outstanding.len());
                    let (address, _) = outstanding.swap_remove(index);
                    assert!(allocator.deallocate(address));
                }

                assert_partition(&allocator);
                let allocated: usize = allocator
                    .ranges()
                    .filter(|range| range.allocated)
                    .map(|range| range.size as usize)
                    .sum();
                let expected: usize = outstanding
                    .iter()
                    .map(|&(_, size)| size.div_ceil(block_size).next_power_of_two() * block_size)
                    .sum();
                assert_eq!(allocated, expected);

                let starts = outstanding.iter().map(|&(address, _)| address).sorted();
                assert!(starts.tuple_windows().all(|(a, b)| a != b));
            }
        }
    }
}
