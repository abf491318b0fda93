//! World database rows, blob codecs and the in-memory store

pub mod database;
pub mod memory;

pub use database::{
    transaction, BlockRow, LandscapeRow, PaintLayerRow, ProceduralLayerRow, RowId, VarianceRow,
    WorldDatabase,
};
pub use memory::MemoryDatabase;
