//! Conservative rasterization of the eight children of a projected node.
//!
//! The map covers the screen-space bounding box of a node, stretched to `[-1, 1]` along both
//! axes. Since every node of an octree is a scaled copy of the root, a single map serves all
//! levels of a draw call.

use glam::{I64Vec2, Vec2};
use octosplat_lib::math_enums::Corner3;

/// Fractional bits of the fixed point math used while baking.
pub const FRACTION_BITS: u32 = 15;

const ONE: i64 = 1 << FRACTION_BITS;

/// A half-plane pair `|normal · q| <= reach`.
#[derive(Clone, Copy, Debug)]
struct Slab {
    normal: I64Vec2,
    reach: i64,
}

impl Slab {
    fn contains(self, point: I64Vec2) -> bool {
        self.normal.dot(point).abs() <= self.reach
    }
}

/// Which children of a node can cover each cell of a `2^shift × 2^shift` grid.
#[derive(Clone, Debug, Default)]
pub struct CoverageMap {
    shift: u32,
    /// The projected root axes, normalized by the projected extent of the root.
    axes: [I64Vec2; 3],
    cells: Vec<u8>,
    columns: Vec<u8>,
    rows: Vec<u8>,
}

impl CoverageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts projected axes into the normalized fixed point form used by the map.
    ///
    /// Axes are divided by the sum of their absolute values, so that the projected node spans
    /// exactly `[-1, 1]` along both screen axes.
    pub fn normalize(axes: [Vec2; 3]) -> [I64Vec2; 3] {
        let extent = axes.iter().map(|axis| axis.abs()).sum::<Vec2>();
        axes.map(|axis| {
            let normalized = Vec2::select(extent.cmpgt(Vec2::ZERO), axis / extent, Vec2::ZERO);
            (normalized * ONE as f32).round().as_i64vec2()
        })
    }

    /// Rebuilds the map for the screen-space x and y components of the three node axes.
    ///
    /// Does nothing if neither the normalized axes nor `shift` changed since the last call and
    /// returns whether the map was rebuilt.
    pub fn bake(&mut self, axes: [Vec2; 3], shift: u32) -> bool {
        let shift = shift.clamp(4, 8);
        let axes = Self::normalize(axes);
        if shift == self.shift && axes == self.axes && !self.cells.is_empty() {
            return false;
        }
        self.shift = shift;
        self.axes = axes;

        let size = 1 << shift;
        self.cells.clear();
        self.cells.resize(size * size, 0);
        self.columns.clear();
        self.columns.resize(size, 0);
        self.rows.clear();
        self.rows.resize(size, 0);

        // half a cell in the doubled space in which a child spans the same range as its parent
        let half_cell = 1 << (FRACTION_BITS + 1 - shift);
        let extent = axes.iter().fold(I64Vec2::ZERO, |sum, axis| sum + axis.abs()) + half_cell + 1;
        let slabs = [0, 1, 2].map(|index| {
            let axis = axes[index];
            let normal = I64Vec2::new(-axis.y, axis.x);
            let reach = (0..3)
                .filter(|&other| other != index)
                .map(|other| normal.dot(axes[other]).abs())
                .sum::<i64>();
            Slab {
                normal,
                reach: reach + normal.abs().element_sum() * (half_cell + 1),
            }
        });
        let centers: [I64Vec2; 8] = array_init::array_init(|octant| {
            let signs = Corner3::from_index(octant as u8).signum();
            axes[0] * signs.x as i64 + axes[1] * signs.y as i64 + axes[2] * signs.z as i64
        });

        for y in 0..size {
            for x in 0..size {
                let doubled = I64Vec2::new(
                    (2 * x as i64 + 1 - size as i64) * half_cell,
                    (2 * y as i64 + 1 - size as i64) * half_cell,
                );
                let mask = (0..8).fold(0, |mask, octant| {
                    let point = doubled - centers[octant];
                    let covered = point.abs().cmple(extent).all()
                        && slabs.iter().all(|slab| slab.contains(point));
                    if covered {
                        mask | 1 << octant
                    } else {
                        mask
                    }
                });
                self.cells[y * size + x] = mask;
                self.columns[x] |= mask;
                self.rows[y] |= mask;
            }
        }

        log::trace!("baked {size}x{size} coverage map");
        true
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// The number of cells along each axis.
    pub fn size(&self) -> u32 {
        1 << self.shift
    }

    /// The children that can cover the given cell.
    pub fn cell(&self, x: u32, y: u32) -> u8 {
        self.cells[(y as usize) << self.shift | x as usize]
    }

    /// The children that can cover any cell of column `x`.
    pub fn column(&self, x: u32) -> u8 {
        self.columns[x as usize]
    }

    /// The children that can cover any cell of row `y`.
    pub fn row(&self, y: u32) -> u8 {
        self.rows[y as usize]
    }
}
