//! Splats an octree into a [`FrameBuffer`] by hierarchical projection.
//!
//! All screen-space math uses fixed point numbers with [`RenderConfig::subpixel_shift`] fractional
//! bits. The projection is affine, so the offsets from a node to its children only depend on the
//! level and are derived from the root axes by arithmetic shifts once per draw call.

use arrayvec::ArrayVec;
use glam::{Affine3A, I64Vec2, I64Vec3, IVec2, Mat3, Vec3};
use octosplat_lib::{
    math::bounds::IBounds2,
    math_enums::Corner3,
    octant_order::{OctantOrder, OctantOrderTable},
    octree::{NodeInfo, NodeSource, Rgb8},
};

use crate::{
    config::RenderConfig,
    coverage::CoverageMap,
    frame_buffer::{FrameBuffer, Pixel},
    node_cache::{CacheLink, InstanceKey, NodeCache},
};

/// Added to every projected extent so that neighboring nodes overlap instead of leaving cracks.
const MARGIN: i64 = 2;

/// Keeps pixel positions far away from overflowing [`i32`].
const PIXEL_LIMIT: i64 = 1 << 30;

const LEVEL_CAPACITY: usize = RenderConfig::MAX_LEVEL as usize + 2;

/// Projected geometry shared by all nodes of one level.
#[derive(Clone, Copy, Debug, Default)]
struct Level {
    /// Half the size of a node's screen-space bounding box, excluding [`MARGIN`].
    extent: I64Vec3,
    /// From the center of a node to the centers of its children.
    children: [I64Vec3; 8],
    /// Maps offsets from the lower corner of a node into coverage map cells, 32 fractional bits.
    cell_scale: I64Vec2,
}

/// A pending node of the traversal.
#[derive(Clone, Copy, Debug)]
struct Frame {
    /// Pixels the node can cover, clipped to its parent and the buffer.
    rect: IBounds2,
    center: I64Vec3,
    level: u32,
    node: NodeInfo,
    ancestor_color: Rgb8,
    link: CacheLink,
}

/// What happened during the frames since the last [`Renderer::begin_frame`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderStats {
    /// Nodes taken from the stack.
    pub nodes: u64,
    /// Nodes that were completely hidden behind already drawn pixels.
    pub occluded: u64,
    pub drawn: u64,
    pub expanded: u64,
    pub pixels_written: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Nodes drawn in place of their children, since the children could not be loaded.
    pub load_failures: u64,
    pub coverage_bakes: u64,
}

/// Renders octrees into a [`FrameBuffer`], keeping state that is reused across frames.
#[derive(Clone, Debug)]
pub struct Renderer {
    table: &'static OctantOrderTable,
    coverage: CoverageMap,
    cache: NodeCache,
    stack: Vec<Frame>,
    levels: ArrayVec<Level, LEVEL_CAPACITY>,
    stats: RenderStats,
}

impl Renderer {
    pub fn new() -> Self {
        Self {
            table: OctantOrderTable::shared(),
            coverage: CoverageMap::new(),
            cache: NodeCache::new(RenderConfig::default().cache_capacity),
            stack: Vec::new(),
            levels: ArrayVec::new(),
            stats: RenderStats::default(),
        }
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    /// Starts a new frame, making the nodes cached during the last frame available.
    ///
    /// Sources that page their data, such as a chunked store, need their own
    /// [`NodeSource::begin_frame`] to be called as well.
    pub fn begin_frame(&mut self, config: &RenderConfig) {
        let config = config.clamped();
        if config.node_cache {
            self.cache
                .begin_frame(config.cache_capacity, config.freeze_cache);
        }
        self.stats = RenderStats::default();
    }

    /// Renders the octree of `source` into `buffer`.
    ///
    /// `transform` maps the root cube, spanning `[-1, 1]` along every axis, into screen space:
    /// x and y in pixels, z as depth. `instance` identifies the draw call for the node cache.
    pub fn render<S: NodeSource>(
        &mut self,
        config: &RenderConfig,
        instance: InstanceKey,
        transform: &Affine3A,
        source: &mut S,
        buffer: &mut FrameBuffer,
    ) {
        let config = config.clamped();
        let basis = Mat3::from(transform.matrix3);
        if !basis.is_finite() || basis.determinant() == 0.0 {
            log::debug!("skipping draw call with degenerate transform");
            return;
        }
        let order = OctantOrder::from_basis(basis);

        let fixed = |vector: Vec3| {
            (vector.as_dvec3() * (1u64 << config.subpixel_shift) as f64)
                .round()
                .as_i64vec3()
        };
        let center = fixed(transform.translation.into());
        let axes = [
            transform.matrix3.x_axis,
            transform.matrix3.y_axis,
            transform.matrix3.z_axis,
        ]
        .map(|axis| fixed(axis.into()));
        self.prepare_levels(axes, &config);
        let projected = [
            transform.matrix3.x_axis,
            transform.matrix3.y_axis,
            transform.matrix3.z_axis,
        ]
        .map(|axis| axis.truncate());
        if self.coverage.bake(projected, config.map_shift) {
            self.stats.coverage_bakes += 1;
        }

        let root = source.root();
        let rect = pixel_rect(center, self.levels[0].extent, config.subpixel_shift)
            .clamp(buffer.bounds());
        if rect.is_empty() {
            return;
        }
        let link = if config.node_cache {
            self.cache.begin_instance(instance, root)
        } else {
            CacheLink::default()
        };

        self.stack.clear();
        self.stack.push(Frame {
            rect,
            center,
            level: 0,
            node: root,
            ancestor_color: root.color,
            link,
        });
        while let Some(frame) = self.stack.pop() {
            self.process(frame, order, &config, source, buffer);
        }
    }

    fn prepare_levels(&mut self, axes: [I64Vec3; 3], config: &RenderConfig) {
        let extent = axes[0].abs() + axes[1].abs() + axes[2].abs();
        let corners: [I64Vec3; 8] = array_init::array_init(|octant| {
            let signs = Corner3::from_index(octant as u8).signum().as_i64vec3();
            axes[0] * signs.x + axes[1] * signs.y + axes[2] * signs.z
        });
        let map_scale = 1i64 << (config.map_shift + 32);

        self.levels.clear();
        for level in 0..config.max_level + 2 {
            let extent = shift_right(extent, level);
            self.levels.push(Level {
                extent,
                children: corners.map(|corner| shift_right(corner, level + 1)),
                cell_scale: I64Vec2::new(
                    map_scale / (2 * extent.x).max(1),
                    map_scale / (2 * extent.y).max(1),
                ),
            });
        }
    }

    fn process<S: NodeSource>(
        &mut self,
        frame: Frame,
        order: OctantOrder,
        config: &RenderConfig,
        source: &mut S,
        buffer: &mut FrameBuffer,
    ) {
        self.stats.nodes += 1;
        let level = self.levels[frame.level as usize];
        let near = to_depth(frame.center.z - level.extent.z);
        if is_occluded(buffer, frame.rect, near) {
            self.stats.occluded += 1;
            return;
        }

        let footprint = 2 * level.extent.x.max(level.extent.y);
        let terminal = frame.level >= config.max_level
            || footprint <= (config.min_draw_size as i64) << config.subpixel_shift
            || !frame.node.has_children();
        if !terminal {
            if let Some((children, written)) = self.fetch_children(&frame, config, source) {
                self.expand(&frame, &children, written, order, config.subpixel_shift);
                return;
            }
        }
        self.draw(&frame, order, config, buffer);
    }

    /// Takes the children from the cache, or loads and caches them.
    ///
    /// Returns the children along with the cache slot they were written to.
    fn fetch_children<S: NodeSource>(
        &mut self,
        frame: &Frame,
        config: &RenderConfig,
        source: &mut S,
    ) -> Option<([NodeInfo; 8], u32)> {
        if config.node_cache {
            if let Some(children) = self.cache.lookup(frame.link) {
                self.stats.cache_hits += 1;
                let written = self.cache.commit(frame.link, &children);
                return Some((children, written));
            }
            self.stats.cache_misses += 1;
            if config.freeze_cache {
                return None;
            }
        }

        match source.load_children(frame.node) {
            Ok(children) => {
                let written = if config.node_cache {
                    self.cache.commit(frame.link, &children)
                } else {
                    0
                };
                Some((children, written))
            }
            Err(error) => {
                if self.stats.load_failures == 0 {
                    log::warn!("drawing node instead of its children: {error}");
                }
                self.stats.load_failures += 1;
                None
            }
        }
    }

    fn expand(
        &mut self,
        frame: &Frame,
        children: &[NodeInfo; 8],
        written: u32,
        order: OctantOrder,
        shift: u32,
    ) {
        self.stats.expanded += 1;
        let level = self.levels[frame.level as usize];
        let child_extent = self.levels[frame.level as usize + 1].extent;

        // back to front, so that the front-most child is processed first
        for octant in self.table.queue(order.reversed(), frame.node.mask) {
            let center = frame.center + level.children[octant as usize];
            let rect = pixel_rect(center, child_extent, shift).clamp(frame.rect);
            if rect.is_empty() {
                continue;
            }
            self.stack.push(Frame {
                rect,
                center,
                level: frame.level + 1,
                node: children[octant as usize],
                ancestor_color: frame.node.color,
                link: self.cache.child_link(frame.link, written, octant),
            });
        }
    }

    fn draw(
        &mut self,
        frame: &Frame,
        order: OctantOrder,
        config: &RenderConfig,
        buffer: &mut FrameBuffer,
    ) {
        self.stats.drawn += 1;
        let level = self.levels[frame.level as usize];
        let child_extent = self.levels[frame.level as usize + 1].extent;
        let child_depths = level
            .children
            .map(|offset| to_depth(frame.center.z + offset.z - child_extent.z));
        let near = to_depth(frame.center.z - level.extent.z);
        let mask = if frame.node.is_leaf() {
            0xFF
        } else {
            frame.node.mask
        };
        let color = frame
            .node
            .color
            .blend(frame.ancestor_color, config.detail_blend);

        let shift = config.subpixel_shift;
        let half = (1i64 << shift) >> 1;
        let origin = frame.center.truncate() - level.extent.truncate();
        let map_size = self.coverage.size() as i64;
        let cell = |offset: i64, scale: i64| ((offset * scale) >> 32).clamp(0, map_size - 1) as u32;
        let cell_x = |x: i32| cell(((x as i64) << shift) + half - origin.x, level.cell_scale.x);

        // cells are monotonic in x, so only the span between the outermost live columns remains
        let live = |x: &i32| self.coverage.column(cell_x(*x)) & mask != 0;
        let Some(first) = frame.rect.columns().find(live) else {
            return;
        };
        let last = frame.rect.columns().rev().find(live).unwrap_or(first);
        let rect = IBounds2::new(
            IVec2::new(first, frame.rect.lower().y),
            IVec2::new(last + 1, frame.rect.upper().y),
        );

        for y in rect.rows() {
            let cell_y = cell(((y as i64) << shift) + half - origin.y, level.cell_scale.y);
            let row_mask = self.coverage.row(cell_y) & mask;
            if row_mask == 0 {
                continue;
            }
            for (x, pixel) in rect.columns().zip(buffer.row_span_mut(y, rect)) {
                if pixel.depth <= near {
                    continue;
                }
                let cell_x = cell_x(x);
                let column_mask = self.coverage.column(cell_x) & row_mask;
                if column_mask == 0 {
                    continue;
                }
                let covered = self.coverage.cell(cell_x, cell_y) & column_mask;
                let Some(octant) = self.table.queue(order, covered).first() else {
                    continue;
                };
                let depth = child_depths[octant as usize];
                if depth < pixel.depth {
                    *pixel = Pixel::new(depth, color);
                    self.stats.pixels_written += 1;
                }
            }
        }
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

fn shift_right(vector: I64Vec3, shift: u32) -> I64Vec3 {
    I64Vec3::new(vector.x >> shift, vector.y >> shift, vector.z >> shift)
}

fn to_depth(depth: i64) -> i32 {
    depth.clamp(i32::MIN as i64, i32::MAX as i64 - 1) as i32
}

/// The pixels whose centers lie within `extent` (plus [`MARGIN`]) of `center`.
fn pixel_rect(center: I64Vec3, extent: I64Vec3, shift: u32) -> IBounds2 {
    let one = 1i64 << shift;
    let half = one >> 1;
    let lower = center.truncate() - extent.truncate() - MARGIN - half;
    let upper = center.truncate() + extent.truncate() + MARGIN - half;
    let first = I64Vec2::new((lower.x + one - 1) >> shift, (lower.y + one - 1) >> shift);
    let last = I64Vec2::new(upper.x >> shift, upper.y >> shift);
    let first = first.clamp(I64Vec2::splat(-PIXEL_LIMIT), I64Vec2::splat(PIXEL_LIMIT));
    let end = (last + 1).clamp(first, I64Vec2::splat(PIXEL_LIMIT));
    IBounds2::new(first.as_ivec2(), end.as_ivec2())
}

fn is_occluded(buffer: &FrameBuffer, rect: IBounds2, near: i32) -> bool {
    rect.rows().all(|y| {
        buffer
            .row_span(y, rect)
            .iter()
            .all(|pixel| pixel.depth <= near)
    })
}
