use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use glam::{Affine3A, EulerRot, Quat, Vec3};
use octosplat_lib::{
    chunk_store::{ChunkedOctreeStore, PackedOctree, StoreConfig},
    octree::{builder::OctreeBuilder, LinearOctree, NodeSource},
};
use octosplat_render::{
    config::RenderConfig, frame_buffer::FrameBuffer, node_cache::InstanceKey, splat::Renderer,
};
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "octosplat", about = "Splat sparse voxel octrees into images")]
struct Cli {
    /// TOML file with `[render]` and `[store]` tables
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a colored ball as an octree file
    DemoSphere {
        /// The ball is 2^depth voxels across
        #[arg(long, default_value_t = 6)]
        depth: u32,
        /// Output octree file path
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Pack an octree file into chunks
    Pack {
        /// Input octree file path
        #[arg(long, short)]
        input: PathBuf,
        /// Output packed file path
        #[arg(long, short)]
        output: PathBuf,
        /// Overrides the chunk shift of the config
        #[arg(long)]
        chunk_shift: Option<u32>,
        /// Stores chunks without compression
        #[arg(long)]
        no_compress: bool,
    },
    /// Render an octree file into a PNG image
    Render {
        /// Input octree file path
        #[arg(long, short)]
        input: PathBuf,
        /// Packed file to page nodes from, created or refreshed as needed
        #[arg(long)]
        packed: Option<PathBuf>,
        /// Output PNG file path
        #[arg(long, short)]
        output: PathBuf,
        #[arg(long, default_value_t = 512)]
        width: u32,
        #[arg(long, default_value_t = 512)]
        height: u32,
        /// Rotation around the vertical axis in degrees
        #[arg(long, default_value_t = 30.0, allow_hyphen_values = true)]
        yaw: f32,
        /// Rotation around the horizontal axis in degrees
        #[arg(long, default_value_t = 20.0, allow_hyphen_values = true)]
        pitch: f32,
        /// Renders this many frames, reporting statistics for each
        #[arg(long, default_value_t = 1)]
        frames: u32,
        /// Overrides the max level of the config
        #[arg(long)]
        max_level: Option<u32>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HostConfig {
    render: RenderConfig,
    store: StoreConfig,
}

impl HostConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }
}

fn demo_sphere(depth: u32) -> LinearOctree {
    let mut builder = OctreeBuilder::new(depth);
    // a hollow shell, about one voxel thick
    builder.insert_ball(builder.size() as f32 / 2.0, 1.5);
    builder.finish()
}

fn camera(width: u32, height: u32, yaw: f32, pitch: f32) -> Affine3A {
    let half = width.min(height) as f32 / 2.0;
    // the root cube diagonal has to fit into the smaller side
    let scale = half / 3f32.sqrt();
    Affine3A::from_scale_rotation_translation(
        Vec3::splat(scale),
        Quat::from_euler(EulerRot::YXZ, yaw.to_radians(), pitch.to_radians(), 0.0),
        Vec3::new(width as f32 / 2.0, height as f32 / 2.0, 2.0 * half),
    )
}

fn render_frames<S: NodeSource>(
    source: &mut S,
    config: &RenderConfig,
    transform: &Affine3A,
    buffer: &mut FrameBuffer,
    frames: u32,
) {
    let mut renderer = Renderer::new();
    for frame in 0..frames {
        renderer.begin_frame(config);
        source.begin_frame();
        buffer.clear();
        let start = std::time::Instant::now();
        renderer.render(config, InstanceKey::default(), transform, source, buffer);
        let stats = renderer.stats();
        log::info!(
            "frame {frame}: {:.2?}, {} nodes, {} drawn, {} occluded, {} cache hits, {} cache misses",
            start.elapsed(),
            stats.nodes,
            stats.drawn,
            stats.occluded,
            stats.cache_hits,
            stats.cache_misses,
        );
    }
}

fn save_png(buffer: &FrameBuffer, path: &Path) -> Result<()> {
    image::save_buffer(
        path,
        &buffer.to_rgba(),
        buffer.width(),
        buffer.height(),
        image::ExtendedColorType::Rgba8,
    )
    .with_context(|| format!("failed to write {}", path.display()))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = HostConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::DemoSphere { depth, output } => {
            anyhow::ensure!(
                depth <= OctreeBuilder::MAX_DEPTH,
                "depth must not exceed {}",
                OctreeBuilder::MAX_DEPTH
            );
            let octree = demo_sphere(depth);
            octree
                .save(&output)
                .with_context(|| format!("failed to write {}", output.display()))?;
            log::info!("wrote {} blocks to {}", octree.block_count(), output.display());
        }
        Command::Pack {
            input,
            output,
            chunk_shift,
            no_compress,
        } => {
            let octree = LinearOctree::load(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let store = StoreConfig {
                chunk_shift: chunk_shift.unwrap_or(config.store.chunk_shift),
                compress: config.store.compress && !no_compress,
                ..config.store
            }
            .clamped();
            let packed = PackedOctree::build(&octree, store.chunk_shift, store.compress);
            packed
                .save(&output)
                .with_context(|| format!("failed to write {}", output.display()))?;
            log::info!(
                "wrote {} chunks with {} bytes of node data to {}",
                packed.chunk_count(),
                packed.blob_len(),
                output.display()
            );
        }
        Command::Render {
            input,
            packed,
            output,
            width,
            height,
            yaw,
            pitch,
            frames,
            max_level,
        } => {
            anyhow::ensure!(
                (1..=FrameBuffer::MAX_SIZE).contains(&width)
                    && (1..=FrameBuffer::MAX_SIZE).contains(&height),
                "image size must be between 1 and {}",
                FrameBuffer::MAX_SIZE
            );
            let octree = LinearOctree::load(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let render = RenderConfig {
                max_level: max_level.unwrap_or(config.render.max_level),
                ..config.render
            };
            let transform = camera(width, height, yaw, pitch);
            let mut buffer = FrameBuffer::new(width, height);

            match packed {
                Some(path) => {
                    let mut store = ChunkedOctreeStore::open_or_pack(&path, &octree, config.store);
                    render_frames(&mut store, &render, &transform, &mut buffer, frames);
                    log::info!(
                        "{} of {} chunks resident",
                        store.resident_chunks(),
                        store.chunk_count()
                    );
                }
                None => {
                    let mut store = ChunkedOctreeStore::from_linear(&octree, config.store)
                        .context("octree does not fit into the arena")?;
                    render_frames(&mut store, &render, &transform, &mut buffer, frames);
                }
            }
            save_png(&buffer, &output)?;
        }
    }
    Ok(())
}
