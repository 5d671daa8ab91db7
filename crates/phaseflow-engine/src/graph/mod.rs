//! Stage dependency graph: validation and wave grouping.

pub mod dag;

pub use dag::{find_cycle, group_stages, validate_stage_graph};
