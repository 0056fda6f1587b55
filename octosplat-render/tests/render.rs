use glam::{Affine3A, Quat, Vec3, Vec3A};
use octosplat_lib::{
    chunk_store::{ChunkedOctreeStore, StoreConfig},
    octree::{builder::OctreeBuilder, LinearOctree, NodeInfo, NodeSource, Rgb8},
};
use octosplat_render::{
    config::RenderConfig,
    frame_buffer::{FrameBuffer, Pixel},
    node_cache::InstanceKey,
    splat::Renderer,
};

const KEY: InstanceKey = InstanceKey::new(7, 0, 0);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A ball with a color gradient, `2^depth` voxels across.
fn ball(depth: u32) -> LinearOctree {
    let mut builder = OctreeBuilder::new(depth);
    builder.insert_ball(builder.size() as f32 / 2.0, f32::INFINITY);
    builder.finish()
}

fn ball_transform(frame: u32) -> Affine3A {
    Affine3A::from_scale_rotation_translation(
        Vec3::splat(24.0),
        Quat::from_euler(glam::EulerRot::YXZ, 0.4 + frame as f32 * 0.1, 0.3, 0.1),
        Vec3::new(32.0, 32.0, 100.0),
    )
}

fn render_frames<S: NodeSource>(
    config: &RenderConfig,
    source: &mut S,
    frames: u32,
    moving: bool,
) -> Vec<FrameBuffer> {
    let mut renderer = Renderer::new();
    (0..frames)
        .map(|frame| {
            renderer.begin_frame(config);
            source.begin_frame();
            let mut buffer = FrameBuffer::new(64, 64);
            let transform = ball_transform(if moving { frame } else { 0 });
            renderer.render(config, KEY, &transform, source, &mut buffer);
            buffer
        })
        .collect()
}

#[test]
fn fractal_quadrants() {
    init_logging();
    let color = Rgb8::new(200, 100, 50);
    let mut octree = LinearOctree::fractal(0b1001_1001, color, 8);
    // object y points into the screen, object z points down
    let transform = Affine3A::from_cols(
        Vec3A::new(32.0, 0.0, 0.0),
        Vec3A::new(0.0, 0.0, 32.0),
        Vec3A::new(0.0, 32.0, 0.0),
        Vec3A::new(32.0, 32.0, 64.0),
    );
    let config = RenderConfig {
        max_level: 1,
        subpixel_shift: 16,
        ..RenderConfig::default()
    };

    let mut renderer = Renderer::new();
    let mut buffer = FrameBuffer::new(64, 64);
    renderer.begin_frame(&config);
    renderer.render(&config, KEY, &transform, &mut octree, &mut buffer);

    // the present octants form a near left half and a far right half
    for y in 0..64 {
        for x in (0..30).chain(34..64) {
            let expected_depth = if x < 32 { 32 << 16 } else { 64 << 16 };
            assert_eq!(
                buffer.get(x, y),
                Some(Pixel::new(expected_depth, color)),
                "pixel {x} {y}"
            );
        }
    }
    assert!(buffer.pixels().iter().all(|pixel| !pixel.is_empty()));
    assert_eq!(renderer.stats().drawn, 1);
}

#[test]
fn node_cache_is_transparent() {
    init_logging();
    let mut octree = ball(5);
    let cached = RenderConfig::default();
    let uncached = RenderConfig {
        node_cache: false,
        ..RenderConfig::default()
    };

    for moving in [false, true] {
        let with_cache = render_frames(&cached, &mut octree, 3, moving);
        let without_cache = render_frames(&uncached, &mut octree, 3, moving);
        assert_eq!(with_cache, without_cache);
        assert!(with_cache[0].pixels().iter().any(|pixel| !pixel.is_empty()));
    }
}

#[test]
fn static_frames_hit_the_cache() {
    let mut octree = ball(4);
    let config = RenderConfig::default();
    let mut renderer = Renderer::new();
    for frame in 0..3 {
        renderer.begin_frame(&config);
        let mut buffer = FrameBuffer::new(64, 64);
        renderer.render(&config, KEY, &ball_transform(0), &mut octree, &mut buffer);
        let stats = renderer.stats();
        assert!(stats.expanded > 0);
        if frame == 0 {
            assert_eq!(stats.cache_hits, 0);
            assert_eq!(stats.coverage_bakes, 1);
        } else {
            assert_eq!(stats.cache_misses, 0);
            assert_eq!(stats.cache_hits, stats.expanded);
            assert_eq!(stats.coverage_bakes, 0);
        }
    }
}

#[test]
fn packed_store_renders_like_linear_octree() {
    init_logging();
    let octree = ball(5);
    let config = RenderConfig::default();
    let expected = render_frames(&config, &mut octree.clone(), 3, true);

    let mut store = ChunkedOctreeStore::pack(
        &octree,
        StoreConfig {
            chunk_shift: 5,
            compress: true,
            initial_arena_shift: 6,
            max_arena_shift: 7,
        },
    );
    assert_eq!(render_frames(&config, &mut store, 3, true), expected);
    assert!(store.stats().chunks_evicted > 0);

    let mut resident = ChunkedOctreeStore::from_linear(&octree, StoreConfig::default()).unwrap();
    assert_eq!(render_frames(&config, &mut resident, 3, true), expected);
}

/// Fails to load any children.
struct Unavailable(NodeInfo);

impl NodeSource for Unavailable {
    type Error = std::io::Error;

    fn root(&self) -> NodeInfo {
        self.0
    }

    fn max_depth(&self) -> u32 {
        8
    }

    fn load_children(&mut self, _parent: NodeInfo) -> Result<[NodeInfo; 8], Self::Error> {
        Err(std::io::Error::other("chunk unavailable"))
    }
}

#[test]
fn unavailable_children_draw_the_parent() {
    init_logging();
    let color = Rgb8::new(255, 0, 0);
    let mut source = Unavailable(NodeInfo {
        address: 0,
        mask: 0xFF,
        color,
    });
    let transform = Affine3A::from_scale_rotation_translation(
        Vec3::splat(16.0),
        Quat::IDENTITY,
        Vec3::new(16.0, 16.0, 50.0),
    );
    let config = RenderConfig::default();
    let mut renderer = Renderer::new();
    let mut buffer = FrameBuffer::new(32, 32);
    renderer.begin_frame(&config);
    renderer.render(&config, KEY, &transform, &mut source, &mut buffer);

    assert_eq!(renderer.stats().load_failures, 1);
    assert!(buffer.pixels().iter().all(|pixel| pixel.rgb() == color));
}

#[test]
fn hidden_instances_are_culled() {
    let config = RenderConfig::default();
    let mut renderer = Renderer::new();
    let mut buffer = FrameBuffer::new(32, 32);
    renderer.begin_frame(&config);

    let mut near = LinearOctree::fractal(0xFF, Rgb8::WHITE, 4);
    let near_transform = Affine3A::from_scale_rotation_translation(
        Vec3::splat(16.0),
        Quat::IDENTITY,
        Vec3::new(16.0, 16.0, 50.0),
    );
    renderer.render(&config, KEY, &near_transform, &mut near, &mut buffer);
    let drawn = buffer.clone();
    assert!(drawn
        .pixels()
        .iter()
        .all(|pixel| pixel.depth == 34 << config.subpixel_shift));

    let mut far = LinearOctree::fractal(0xFF, Rgb8::BLACK, 4);
    let far_transform = Affine3A::from_scale_rotation_translation(
        Vec3::splat(8.0),
        Quat::IDENTITY,
        Vec3::new(16.0, 16.0, 200.0),
    );
    renderer.render(
        &config,
        InstanceKey::new(8, 0, 0),
        &far_transform,
        &mut far,
        &mut buffer,
    );
    assert_eq!(renderer.stats().occluded, 1);
    assert_eq!(buffer, drawn);
}
