//! Rkterra - a block-based heightfield landscape engine

pub mod core;
pub mod math;
pub mod render;
pub mod terrain;
pub mod culling;
pub mod paint;
pub mod persistence;
pub mod landscape;
