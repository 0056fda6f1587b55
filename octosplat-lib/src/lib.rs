pub mod alloc;
pub mod chunk_store;
pub mod math;
pub mod math_enums;
pub mod octant_order;
pub mod octree;
