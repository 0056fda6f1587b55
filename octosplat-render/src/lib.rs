pub mod config;
pub mod coverage;
pub mod frame_buffer;
pub mod node_cache;
pub mod splat;
