use glam::IVec2;

/// Signed integer axis-aligned bounds in 2D-space, e.g. a rectangle of pixels.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct IBounds2 {
    /// The inclusive lower limit of the bounds.
    lower: IVec2,
    /// The exclusive upper limit of the bounds.
    upper: IVec2,
}

impl IBounds2 {
    /// Constructs [`IBounds2`] from the given inclusive `lower` and exclusive `upper`.
    ///
    /// # Panics
    ///
    /// Panics if `lower` exceeds `upper` along any axis.
    pub const fn new(lower: IVec2, upper: IVec2) -> Self {
        if let Some(bounds) = Self::checked_new(lower, upper) {
            bounds
        } else {
            panic!("lower bounds must not exceed upper bounds");
        }
    }

    /// Constructs [`IBounds2`] from the given inclusive `lower` and exclusive `upper`.
    ///
    /// Returns [`None`] if `lower` exceeds `upper` along any axis.
    pub const fn checked_new(lower: IVec2, upper: IVec2) -> Option<Self> {
        if lower.x <= upper.x && lower.y <= upper.y {
            Some(Self { lower, upper })
        } else {
            None
        }
    }

    /// Constructs [`IBounds2`] with the given `size` located at the origin.
    ///
    /// Negative sizes are treated as zero.
    pub fn with_size_at_origin(size: IVec2) -> Self {
        Self {
            lower: IVec2::ZERO,
            upper: size.max(IVec2::ZERO),
        }
    }

    /// The inclusive lower limit of the bounds.
    pub const fn lower(self) -> IVec2 {
        self.lower
    }

    /// The exclusive upper limit of the bounds.
    pub const fn upper(self) -> IVec2 {
        self.upper
    }

    /// Whether the [`IBounds2`] are empty along _any_ axis.
    pub fn is_empty(self) -> bool {
        self.lower.cmpge(self.upper).any()
    }

    /// Returns the lower and upper bounds of `self` clamped to `within`.
    ///
    /// I.e. if `within` encloses `self`, `self` is returned unchanged. Otherwise `self` is cut off
    /// so that `within` does enclose it.
    ///
    /// If `within` is disjoint from `self`, the clamped bounds will be empty but lie on the
    /// boundary of `within` closest to `self`.
    pub fn clamp(self, within: Self) -> Self {
        Self {
            lower: self.lower.clamp(within.lower, within.upper),
            upper: self.upper.clamp(within.lower, within.upper),
        }
    }

    /// Iterates all rows of the bounds, top to bottom.
    pub fn rows(self) -> std::ops::Range<i32> {
        self.lower.y..self.upper.y
    }

    /// Iterates all columns of the bounds, left to right.
    pub fn columns(self) -> std::ops::Range<i32> {
        self.lower.x..self.upper.x
    }
}
