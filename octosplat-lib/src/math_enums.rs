use std::ops::{Index, IndexMut};

use enum_map::Enum;
use enumset::{EnumSet, EnumSetType};
use glam::{IVec3, Vec3};

macro_rules! impl_from_for_vec {
    { $enum_type:ident for $value_type:ident {
        $( $variant:ident => ( $( $value:expr ),* ), )*
    } } => {
        impl From<$enum_type> for $value_type {
            fn from(value: $enum_type) -> Self {
                match value {
                    $( <$enum_type>::$variant => Self::new( $( $value as _ ),* ), )*
                }
            }
        }
    };
    { $enum_type:ident for [ $( $value_type:ident ),* ] $values:tt } => { $(
        impl_from_for_vec! {
            $enum_type for $value_type
            $values
        }
    )* };
}

macro_rules! impl_index_for_vec {
    { $axis_type:ident for $base_type:ident: $vector_type:ident {
        $( $axis_name:ident => $axis_field:ident, )*
    } } => {
        impl Index<$axis_type> for $vector_type {
            type Output = $base_type;

            fn index(&self, index: $axis_type) -> &Self::Output {
                match index {
                    $( $axis_type::$axis_name => &self.$axis_field, )*
                }
            }
        }

        impl IndexMut<$axis_type> for $vector_type {
            fn index_mut(&mut self, index: $axis_type) -> &mut Self::Output {
                match index {
                    $( $axis_type::$axis_name => &mut self.$axis_field, )*
                }
            }
        }
    };
    { $axis_type:ident for [
        $( $base_type:ident: $( $vector_type:ident ),* ; )*
    ] $axes:tt } => { $( $(
        impl_index_for_vec! {
            $axis_type for $base_type: $vector_type
            $axes
        }
    )* )* };
}

/// A three-dimensional axis; `X`, `Y`, or `Z`.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Axis3 {
    X,
    Y,
    Z,
}

impl Axis3 {
    /// All axes in index order.
    pub const ALL: [Self; 3] = [Self::X, Self::Y, Self::Z];

    /// The bit of an octant index that selects the upper half along this axis.
    pub const fn octant_bit(self) -> u8 {
        1 << self as u8
    }
}

impl_index_for_vec! {
    Axis3 for [
        f32: Vec3;
    ] {
        X => x,
        Y => y,
        Z => z,
    }
}

/// A corner of a 3D cube, which doubles as the octant of an octree node.
///
/// The discriminant is the octant index: bit `0` is set for the upper half along `X`, bit `1` for
/// `Y` and bit `2` for `Z`.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Enum, EnumSetType)]
#[enumset(no_super_impls, repr = "u8")]
pub enum Corner3 {
    X0Y0Z0,
    X1Y0Z0,
    X0Y1Z0,
    X1Y1Z0,
    X0Y0Z1,
    X1Y0Z1,
    X0Y1Z1,
    X1Y1Z1,
}

impl Corner3 {
    /// All corners in octant index order.
    pub const ALL: [Self; 8] = [
        Self::X0Y0Z0,
        Self::X1Y0Z0,
        Self::X0Y1Z0,
        Self::X1Y1Z0,
        Self::X0Y0Z1,
        Self::X1Y0Z1,
        Self::X0Y1Z1,
        Self::X1Y1Z1,
    ];

    /// Returns the corner with the given octant index, ignoring all but the lowest three bits.
    pub const fn from_index(index: u8) -> Self {
        Self::ALL[(index & 7) as usize]
    }

    /// The octant index of this corner.
    pub const fn index(self) -> u8 {
        self as u8
    }

    /// The corner diagonally opposite of this one.
    pub fn opposite(self) -> Self {
        Self::from_index(self as u8 ^ 7)
    }

    /// The direction from the center of a cube towards this corner, `-1` or `1` per axis.
    pub fn signum(self) -> IVec3 {
        IVec3::from(self) * 2 - IVec3::ONE
    }
}

impl_from_for_vec! {
    Corner3 for [Vec3, IVec3] {
        X0Y0Z0 => (0, 0, 0),
        X1Y0Z0 => (1, 0, 0),
        X0Y1Z0 => (0, 1, 0),
        X1Y1Z0 => (1, 1, 0),
        X0Y0Z1 => (0, 0, 1),
        X1Y0Z1 => (1, 0, 1),
        X0Y1Z1 => (0, 1, 1),
        X1Y1Z1 => (1, 1, 1),
    }
}

/// A set of corners; the octant mask of an octree node.
pub type Corners3 = EnumSet<Corner3>;
