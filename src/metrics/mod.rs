//! Pure metrics algorithms: provider blending and snapshot aggregation.

pub mod aggregator;
pub mod blender;
