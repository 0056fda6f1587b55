/// Tunables of a [`Renderer`](crate::splat::Renderer), passed with every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct RenderConfig {
    /// Nodes at this level are drawn instead of expanded; the root is level `0`.
    pub max_level: u32,
    /// Nodes whose projection is at most this many pixels wide are drawn instead of expanded.
    pub min_draw_size: u32,
    /// Fractional bits of fixed point screen coordinates and depth values.
    pub subpixel_shift: u32,
    /// The coverage map has `1 << map_shift` cells along each axis.
    pub map_shift: u32,
    /// Whether decoded children are reused across frames.
    pub node_cache: bool,
    /// Stops updating the node cache; nodes that missed it are drawn instead of expanded.
    pub freeze_cache: bool,
    /// How much of the parent color is mixed into drawn nodes, `0` to `256`.
    pub detail_blend: u32,
    /// The number of 8-child blocks the node cache holds per frame.
    pub cache_capacity: u32,
}

impl RenderConfig {
    pub const MAX_LEVEL: u32 = 30;
    pub const MAX_SUBPIXEL_SHIFT: u32 = 16;
    pub const MIN_MAP_SHIFT: u32 = 4;
    pub const MAX_MAP_SHIFT: u32 = 8;
    pub const MAX_DETAIL_BLEND: u32 = 256;
    /// Two blocks are reserved, at least one must remain usable.
    pub const MIN_CACHE_CAPACITY: u32 = 3;
    pub const MAX_CACHE_CAPACITY: u32 = 1 << 24;

    /// Returns a copy with every setting moved into its valid range.
    pub fn clamped(self) -> Self {
        Self {
            max_level: self.max_level.min(Self::MAX_LEVEL),
            min_draw_size: self.min_draw_size,
            subpixel_shift: self.subpixel_shift.min(Self::MAX_SUBPIXEL_SHIFT),
            map_shift: self
                .map_shift
                .clamp(Self::MIN_MAP_SHIFT, Self::MAX_MAP_SHIFT),
            node_cache: self.node_cache,
            freeze_cache: self.freeze_cache && self.node_cache,
            detail_blend: self.detail_blend.min(Self::MAX_DETAIL_BLEND),
            cache_capacity: self
                .cache_capacity
                .clamp(Self::MIN_CACHE_CAPACITY, Self::MAX_CACHE_CAPACITY),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_level: 16,
            min_draw_size: 1,
            subpixel_shift: 8,
            map_shift: 6,
            node_cache: true,
            freeze_cache: false,
            detail_blend: 0,
            cache_capacity: 1 << 16,
        }
    }
}
