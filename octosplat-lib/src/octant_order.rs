use std::sync::OnceLock;

use glam::{Mat3, Vec3};

use crate::math_enums::{Axis3, Corner3};

/// The six orders in which the axes of an octant index can be counted through.
///
/// Each entry lists the axes from least to most significant; the last axis is the primary axis,
/// i.e. the one the view direction is most aligned with.
pub const PERMUTATIONS: [[Axis3; 3]; 6] = [
    [Axis3::X, Axis3::Y, Axis3::Z],
    [Axis3::X, Axis3::Z, Axis3::Y],
    [Axis3::Y, Axis3::X, Axis3::Z],
    [Axis3::Y, Axis3::Z, Axis3::X],
    [Axis3::Z, Axis3::X, Axis3::Y],
    [Axis3::Z, Axis3::Y, Axis3::X],
];

const MASKS: usize = 256;
const TABLE_LEN: usize = PERMUTATIONS.len() * 8 * MASKS;

/// The direction the camera looks along, expressed in the object space of `basis`.
///
/// `basis` maps object space to camera space, where the camera looks along `+Z`. Only the
/// orientation of the result is meaningful, not its length.
pub fn view_direction(basis: Mat3) -> Vec3 {
    let direction = basis.row(0).cross(basis.row(1));
    if basis.determinant() < 0.0 {
        -direction
    } else {
        direction
    }
}

/// Returns the octant of a node that lies closest to the camera.
///
/// Along each axis the lower half is in front if the view direction points towards positive
/// values, otherwise the upper half is.
pub fn classify_octant(basis: Mat3) -> Corner3 {
    let direction = view_direction(basis);
    let index = Axis3::ALL
        .into_iter()
        .filter(|&axis| direction[axis] < 0.0)
        .fold(0, |index, axis| index | axis.octant_bit());
    Corner3::from_index(index)
}

/// Returns the index into [`PERMUTATIONS`] that orders axes by how much the view direction is
/// aligned with them.
///
/// Ties are resolved in favor of the lower axis, which keeps the order stable for views along
/// diagonals.
pub fn classify_primary_axis(basis: Mat3) -> usize {
    let magnitude = view_direction(basis).abs();
    let mut axes = Axis3::ALL;
    axes.sort_by(|&lhs, &rhs| {
        magnitude[rhs]
            .total_cmp(&magnitude[lhs])
            .then(lhs.cmp(&rhs))
    });
    let order = [axes[2], axes[1], axes[0]];
    PERMUTATIONS
        .iter()
        .position(|permutation| *permutation == order)
        .expect("every axis order should be listed")
}

/// A front-to-back visiting order of the eight octants of a node.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct OctantOrder {
    permutation: u8,
    front: Corner3,
}

impl OctantOrder {
    /// Constructs an [`OctantOrder`] from an index into [`PERMUTATIONS`] and the front-most octant.
    ///
    /// # Panics
    ///
    /// Panics if `permutation` is out of range.
    pub fn new(permutation: usize, front: Corner3) -> Self {
        assert!(permutation < PERMUTATIONS.len(), "permutation out of range");
        Self {
            permutation: permutation as u8,
            front,
        }
    }

    /// The front-to-back order for a camera with the given object-to-camera `basis`.
    pub fn from_basis(basis: Mat3) -> Self {
        Self::new(classify_primary_axis(basis), classify_octant(basis))
    }

    /// The octant that is visited first.
    pub fn front(self) -> Corner3 {
        self.front
    }

    /// The axes from least to most significant.
    pub fn axes(self) -> [Axis3; 3] {
        PERMUTATIONS[self.permutation as usize]
    }

    /// The exact reverse of this order, i.e. back-to-front.
    pub fn reversed(self) -> Self {
        Self {
            permutation: self.permutation,
            front: self.front.opposite(),
        }
    }

    fn key(self, mask: u8) -> usize {
        (self.permutation as usize * 8 + self.front.index() as usize) * MASKS + mask as usize
    }
}

/// A packed sequence of octants, four bits per entry.
///
/// The lowest three bits of each entry hold the octant index, the fourth bit is always set so that
/// the queue is exhausted exactly when the remaining bits are zero.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct OctantQueue(u32);

impl OctantQueue {
    /// Wraps an already packed queue.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The packed representation.
    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The first octant of the queue without consuming it.
    pub const fn first(self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some((self.0 & 7) as u8)
        }
    }
}

impl Iterator for OctantQueue {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        let octant = self.first()?;
        self.0 >>= 4;
        Some(octant)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = (32 - self.0.leading_zeros() as usize).div_ceil(4);
        (len, Some(len))
    }
}

impl ExactSizeIterator for OctantQueue {}

/// Precomputed [`OctantQueue`]s for every order, front octant and child mask.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OctantOrderTable {
    queues: Box<[u32]>,
}

impl OctantOrderTable {
    /// Generates the lookup table.
    pub fn generate() -> Self {
        let mut queues = vec![0; TABLE_LEN].into_boxed_slice();
        for (permutation, axes) in PERMUTATIONS.iter().enumerate() {
            let flips: [u8; 8] = array_init::array_init(|counter| {
                axes.iter()
                    .enumerate()
                    .filter(|(bit, _)| counter & (1 << bit) != 0)
                    .fold(0, |flip, (_, axis)| flip | axis.octant_bit())
            });
            for front in Corner3::ALL {
                let order = OctantOrder::new(permutation, front);
                for mask in 0..=u8::MAX {
                    queues[order.key(mask)] = pack_queue(&flips, front.index(), mask);
                }
            }
        }
        Self { queues }
    }

    /// A lazily generated table shared by everything in the process.
    pub fn shared() -> &'static Self {
        static TABLE: OnceLock<OctantOrderTable> = OnceLock::new();
        TABLE.get_or_init(Self::generate)
    }

    /// The octants that are set in `mask`, in the given `order`.
    pub fn queue(&self, order: OctantOrder, mask: u8) -> OctantQueue {
        OctantQueue(self.queues[order.key(mask)])
    }
}

impl Default for OctantOrderTable {
    fn default() -> Self {
        Self::generate()
    }
}

fn pack_queue(flips: &[u8; 8], front: u8, mask: u8) -> u32 {
    let mut queue = 0;
    let mut shift = 0;
    for flip in flips {
        let octant = front ^ flip;
        if mask & (1 << octant) != 0 {
            queue |= (octant as u32 | 8) << shift;
            shift += 4;
        }
    }
    queue
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    /// A rotation whose third row is the normalized view `direction`.
    fn looking_along(direction: Vec3) -> Mat3 {
        let forward = direction.normalize();
        let helper = if forward.x.abs() < 0.9 { Vec3::X } else { Vec3::Y };
        let right = helper.cross(forward).normalize();
        let up = forward.cross(right);
        Mat3::from_cols(right, up, forward).transpose()
    }

    #[test]
    fn view_direction_from_basis() {
        let direction = Vec3::new(0.3, -0.5, 0.8);
        let basis = looking_along(direction);
        let computed = view_direction(basis).normalize();
        assert!(computed.abs_diff_eq(direction.normalize(), 1e-5));

        let mirrored = Mat3::from_diagonal(Vec3::new(-1.0, 1.0, 1.0)) * basis;
        let computed = view_direction(mirrored).normalize();
        assert!(computed.abs_diff_eq(direction.normalize(), 1e-5));
    }

    #[test]
    fn front_octant_faces_camera() {
        assert_eq!(
            classify_octant(looking_along(Vec3::new(1.0, 1.0, 1.0))),
            Corner3::X0Y0Z0
        );
        assert_eq!(
            classify_octant(looking_along(Vec3::new(-1.0, 0.2, -3.0))),
            Corner3::X1Y0Z1
        );
        assert_eq!(classify_octant(Mat3::IDENTITY), Corner3::X0Y0Z0);
    }

    #[test]
    fn primary_axis_is_most_significant() {
        let permutation = classify_primary_axis(looking_along(Vec3::new(0.1, -2.0, 0.5)));
        assert_eq!(PERMUTATIONS[permutation], [Axis3::X, Axis3::Z, Axis3::Y]);
        assert_eq!(
            PERMUTATIONS[classify_primary_axis(Mat3::IDENTITY)],
            [Axis3::Y, Axis3::X, Axis3::Z]
        );
    }

    #[test]
    fn full_queue_is_a_permutation() {
        let table = OctantOrderTable::generate();
        for permutation in 0..PERMUTATIONS.len() {
            for front in Corner3::ALL {
                let order = OctantOrder::new(permutation, front);
                let octants = table.queue(order, u8::MAX).collect_vec();
                assert_eq!(octants.len(), 8);
                assert_eq!(octants[0], front.index());
                assert_eq!(octants[7], front.opposite().index());
                assert!(octants.iter().all_unique());
            }
        }
    }

    #[test]
    fn queue_filters_mask_and_reverses() {
        let table = OctantOrderTable::generate();
        let order = OctantOrder::new(0, Corner3::X1Y0Z0);
        let mask = 0b1001_1001;
        let forward = table.queue(order, mask).collect_vec();
        assert_eq!(forward, [0u8, 3, 4, 7]);
        let mut backward = table.queue(order.reversed(), mask).collect_vec();
        backward.reverse();
        assert_eq!(forward, backward);
        assert_eq!(table.queue(order, mask).len(), 4);
        assert!(table.queue(order, 0).is_empty());
    }

    #[test]
    fn front_to_back_along_view() {
        let table = OctantOrderTable::shared();
        let direction = Vec3::new(0.7, -0.2, 0.4);
        let order = OctantOrder::from_basis(looking_along(direction));
        let depths = table
            .queue(order, u8::MAX)
            .map(|octant| Vec3::from(Corner3::from_index(octant)).dot(direction))
            .collect_vec();
        assert!(depths.windows(2).all(|pair| pair[0] <= pair[1]));
    }
}
